//! Boundary and centroid channels derived from the label mask.
//!
//! Morphology uses the 6-connected structuring element. Voxels outside the
//! volume count as background, so foreground touching the border erodes.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::error::{AugmentError, Result};
use crate::sample::Sample;
use crate::volume::Volume;

/// Which side of the object boundary the edge channel covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeMode {
    /// Foreground voxels removed by `n` erosions.
    #[default]
    Inner,
    /// Background voxels added by `n` dilations.
    Outer,
    /// Union of inner and outer bands.
    Thick,
}

/// Append an edge channel and a centroid channel to the mask.
///
/// Must run after every spatial transform so both channels describe the
/// final mask geometry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EdgesAndCentroids {
    /// Erosion/dilation steps for the edge band and the centroid blobs.
    pub iterations: usize,
    /// Edge band placement.
    pub mode: EdgeMode,
    /// Mask channel the derived channels are computed from.
    pub source_channel: usize,
}

impl Default for EdgesAndCentroids {
    fn default() -> Self {
        Self {
            iterations: 3,
            mode: EdgeMode::Inner,
            source_channel: 0,
        }
    }
}

impl EdgesAndCentroids {
    /// Derive channels from mask channel 0.
    #[must_use]
    pub fn new(iterations: usize, mode: EdgeMode) -> Self {
        Self {
            iterations,
            mode,
            source_channel: 0,
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.iterations == 0 {
            return Err(AugmentError::invalid_config(
                "edges_and_centroids needs at least one iteration",
            ));
        }
        Ok(())
    }

    pub(crate) fn apply(&self, mut sample: Sample) -> Result<Sample> {
        if self.source_channel >= sample.mask.channels() {
            return Err(AugmentError::invalid_config(format!(
                "edges_and_centroids source channel {} out of range for {} mask channels",
                self.source_channel,
                sample.mask.channels()
            )));
        }
        let spatial = sample.mask.spatial();
        let foreground: Vec<bool> = sample
            .mask
            .channel(self.source_channel)
            .iter()
            .map(|&v| v > 0.5)
            .collect();

        let edges = self.edge_band(&foreground, spatial);
        let centroids = centroid_blobs(&foreground, spatial, self.iterations);

        let [d, h, w] = spatial;
        let to_volume = |bits: Vec<bool>| {
            Volume::new(
                [1, d, h, w],
                bits.into_iter().map(|b| f32::from(u8::from(b))).collect(),
            )
        };
        sample.mask =
            Volume::concat_channels(&[sample.mask, to_volume(edges)?, to_volume(centroids)?])?;
        Ok(sample)
    }

    fn edge_band(&self, foreground: &[bool], spatial: [usize; 3]) -> Vec<bool> {
        let n = self.iterations;
        match self.mode {
            EdgeMode::Inner => {
                let eroded = repeat(foreground, n, |m| erode(m, spatial));
                zip_with(foreground, &eroded, |f, e| f && !e)
            }
            EdgeMode::Outer => {
                let dilated = repeat(foreground, n, |m| dilate(m, spatial));
                zip_with(&dilated, foreground, |g, f| g && !f)
            }
            EdgeMode::Thick => {
                let eroded = repeat(foreground, n, |m| erode(m, spatial));
                let dilated = repeat(foreground, n, |m| dilate(m, spatial));
                zip_with(&dilated, &eroded, |g, e| g && !e)
            }
        }
    }
}

const NEIGHBOURS: [[isize; 3]; 6] = [
    [-1, 0, 0],
    [1, 0, 0],
    [0, -1, 0],
    [0, 1, 0],
    [0, 0, -1],
    [0, 0, 1],
];

fn repeat(mask: &[bool], n: usize, step: impl Fn(&[bool]) -> Vec<bool>) -> Vec<bool> {
    let mut current = mask.to_vec();
    for _ in 0..n {
        current = step(&current);
    }
    current
}

fn zip_with(a: &[bool], b: &[bool], f: impl Fn(bool, bool) -> bool) -> Vec<bool> {
    a.iter().zip(b).map(|(&x, &y)| f(x, y)).collect()
}

#[inline]
fn index([d, h, w]: [usize; 3], [z, y, x]: [usize; 3]) -> usize {
    debug_assert!(z < d && y < h && x < w);
    (z * h + y) * w + x
}

fn coords([_, h, w]: [usize; 3], idx: usize) -> [usize; 3] {
    [idx / (h * w), (idx / w) % h, idx % w]
}

/// Neighbour of `pos` along `offset`, or `None` outside `bounds` (inclusive lo, exclusive hi).
fn neighbour(
    pos: [usize; 3],
    offset: [isize; 3],
    lo: [usize; 3],
    hi: [usize; 3],
) -> Option<[usize; 3]> {
    let mut out = [0; 3];
    for axis in 0..3 {
        let v = pos[axis].checked_add_signed(offset[axis])?;
        if v < lo[axis] || v >= hi[axis] {
            return None;
        }
        out[axis] = v;
    }
    Some(out)
}

fn erode(mask: &[bool], spatial: [usize; 3]) -> Vec<bool> {
    (0..mask.len())
        .map(|idx| {
            mask[idx]
                && NEIGHBOURS.iter().all(|&off| {
                    neighbour(coords(spatial, idx), off, [0; 3], spatial)
                        .is_some_and(|n| mask[index(spatial, n)])
                })
        })
        .collect()
}

fn dilate(mask: &[bool], spatial: [usize; 3]) -> Vec<bool> {
    dilate_within(mask, spatial, [0; 3], spatial)
}

/// One dilation step that only grows into voxels inside `[lo, hi)`.
fn dilate_within(mask: &[bool], spatial: [usize; 3], lo: [usize; 3], hi: [usize; 3]) -> Vec<bool> {
    let mut out = mask.to_vec();
    for (idx, &set) in mask.iter().enumerate() {
        if !set {
            continue;
        }
        for &off in &NEIGHBOURS {
            if let Some(n) = neighbour(coords(spatial, idx), off, lo, hi) {
                out[index(spatial, n)] = true;
            }
        }
    }
    out
}

/// Per 6-connected component: the rounded centroid voxel dilated `iterations`
/// times, clipped to the component's bounding box.
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn centroid_blobs(foreground: &[bool], spatial: [usize; 3], iterations: usize) -> Vec<bool> {
    let mut visited = vec![false; foreground.len()];
    let mut out = vec![false; foreground.len()];
    let mut queue = VecDeque::new();

    for start in 0..foreground.len() {
        if !foreground[start] || visited[start] {
            continue;
        }
        visited[start] = true;
        queue.push_back(start);

        let mut sum = [0.0_f64; 3];
        let mut count = 0.0_f64;
        let mut lo = coords(spatial, start);
        let mut hi = lo;
        while let Some(idx) = queue.pop_front() {
            let pos = coords(spatial, idx);
            for axis in 0..3 {
                sum[axis] += pos[axis] as f64;
                lo[axis] = lo[axis].min(pos[axis]);
                hi[axis] = hi[axis].max(pos[axis]);
            }
            count += 1.0;
            for &off in &NEIGHBOURS {
                if let Some(n) = neighbour(pos, off, [0; 3], spatial) {
                    let n_idx = index(spatial, n);
                    if foreground[n_idx] && !visited[n_idx] {
                        visited[n_idx] = true;
                        queue.push_back(n_idx);
                    }
                }
            }
        }

        let centre = [0, 1, 2].map(|axis| (sum[axis] / count).round() as usize);
        let hi_excl = hi.map(|v| v + 1);
        let mut blob = vec![false; foreground.len()];
        blob[index(spatial, centre)] = true;
        for _ in 0..iterations {
            blob = dilate_within(&blob, spatial, lo, hi_excl);
        }
        for (o, b) in out.iter_mut().zip(blob) {
            *o |= b;
        }
    }
    out
}
