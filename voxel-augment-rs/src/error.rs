//! Error types for voxel-augment-rs.

use thiserror::Error;

/// Result type alias for augmentation operations.
pub type Result<T> = std::result::Result<T, AugmentError>;

/// Errors raised while building or applying an augmentation pipeline.
#[derive(Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum AugmentError {
    /// A transform left image, mask or weight map with diverging spatial dims.
    #[error("shape mismatch after {transform}: image {image:?}, {other} {got:?}")]
    ShapeMismatch {
        /// Name of the transform that broke alignment.
        transform: String,
        /// Spatial dims (D, H, W) of the image.
        image: [usize; 3],
        /// Which array disagreed with the image (`mask` or `weight_map`).
        other: &'static str,
        /// Spatial dims of the disagreeing array.
        got: [usize; 3],
    },

    /// A transform was configured with a probability outside `[0, 1]`.
    #[error("invalid apply probability {probability} for {transform}: must be within [0, 1]")]
    InvalidProbability {
        /// Name of the offending transform.
        transform: String,
        /// The configured probability.
        probability: f64,
    },

    /// Invalid transform parameters or pipeline ordering.
    #[error("invalid augmentation config: {0}")]
    InvalidConfig(String),

    /// A volume was built from data that does not fit its declared shape.
    #[error("invalid volume shape: {0}")]
    InvalidShape(String),
}

impl AugmentError {
    /// Create an invalid config error.
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Create an invalid shape error.
    pub fn invalid_shape(msg: impl Into<String>) -> Self {
        Self::InvalidShape(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_mismatch_display() {
        let error = AugmentError::ShapeMismatch {
            transform: "flip".to_string(),
            image: [4, 8, 8],
            other: "mask",
            got: [4, 8, 9],
        };
        let text = error.to_string();
        assert!(text.contains("flip"));
        assert!(text.contains("mask"));
        assert!(text.contains("[4, 8, 9]"));
    }

    #[test]
    fn test_invalid_probability_display() {
        let error = AugmentError::InvalidProbability {
            transform: "random_gaussian_noise".to_string(),
            probability: 1.5,
        };
        assert_eq!(
            error.to_string(),
            "invalid apply probability 1.5 for random_gaussian_noise: must be within [0, 1]"
        );
    }

    #[test]
    fn test_helpers() {
        assert!(matches!(
            AugmentError::invalid_config("x"),
            AugmentError::InvalidConfig(_)
        ));
        assert!(matches!(
            AugmentError::invalid_shape("x"),
            AugmentError::InvalidShape(_)
        ));
    }
}
