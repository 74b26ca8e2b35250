//! Partition model parameters into trainable and frozen sets.

use candle_core::Var;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TrainError};
use crate::model::{GradientFlow, SegmentationModel};

/// A name pattern and whether matching parameters train.
///
/// A pattern matches a parameter when it is a substring of the parameter's
/// name, so `"decoder"` selects every `decoder.*` tensor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterGroup {
    /// Substring matched against parameter names.
    pub name_pattern: String,
    /// Requested trainability of matching parameters.
    pub trainable: bool,
}

impl ParameterGroup {
    /// Group that unfreezes parameters matching `pattern`.
    #[must_use]
    pub fn trainable(pattern: impl Into<String>) -> Self {
        Self {
            name_pattern: pattern.into(),
            trainable: true,
        }
    }

    /// Group that freezes parameters matching `pattern`.
    #[must_use]
    pub fn frozen(pattern: impl Into<String>) -> Self {
        Self {
            name_pattern: pattern.into(),
            trainable: false,
        }
    }

    fn matches(&self, name: &str) -> bool {
        name.contains(&self.name_pattern)
    }
}

/// Ordered rules deciding which parameters train.
///
/// Every parameter starts frozen; groups are applied in order and a later
/// match overrides an earlier one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParameterSelector {
    groups: Vec<ParameterGroup>,
}

impl ParameterSelector {
    /// Selector from explicit groups.
    #[must_use]
    pub fn new(groups: Vec<ParameterGroup>) -> Self {
        Self { groups }
    }

    /// Selector that unfreezes every parameter matching any of `patterns`.
    #[must_use]
    pub fn from_patterns<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(patterns.into_iter().map(ParameterGroup::trainable).collect())
    }

    /// Rules in application order.
    #[must_use]
    pub fn groups(&self) -> &[ParameterGroup] {
        &self.groups
    }

    /// Whether a parameter name ends up trainable.
    #[must_use]
    pub fn is_trainable(&self, name: &str) -> bool {
        self.groups
            .iter()
            .rev()
            .find(|group| group.matches(name))
            .is_some_and(|group| group.trainable)
    }

    /// Split the model's parameters.
    ///
    /// # Errors
    ///
    /// Returns [`TrainError::NoTrainableParameters`] when nothing would train.
    pub fn select(&self, model: &dyn SegmentationModel) -> Result<ParameterPartition> {
        let named = model.named_parameters()?;
        let total = named.len();
        let (trainable, frozen): (Vec<_>, Vec<_>) = named
            .into_iter()
            .partition(|(name, _)| self.is_trainable(name));

        if trainable.is_empty() {
            return Err(TrainError::NoTrainableParameters {
                patterns: self
                    .groups
                    .iter()
                    .filter(|g| g.trainable)
                    .map(|g| g.name_pattern.clone())
                    .collect(),
                total,
            });
        }

        let partition = ParameterPartition { trainable, frozen };
        tracing::info!(
            "Trainable parameters: {} tensors ({} values), frozen: {} tensors ({} values)",
            partition.trainable.len(),
            partition.trainable_elements(),
            partition.frozen.len(),
            partition.frozen_elements()
        );
        for (name, _) in &partition.trainable {
            tracing::debug!("trainable: {name}");
        }
        Ok(partition)
    }
}

/// Disjoint, complete split of a model's parameters, sorted by name.
#[derive(Debug, Clone)]
pub struct ParameterPartition {
    trainable: Vec<(String, Var)>,
    frozen: Vec<(String, Var)>,
}

impl ParameterPartition {
    /// Parameters updated by the optimizer.
    #[must_use]
    pub fn trainable(&self) -> &[(String, Var)] {
        &self.trainable
    }

    /// Parameters left untouched.
    #[must_use]
    pub fn frozen(&self) -> &[(String, Var)] {
        &self.frozen
    }

    /// Names of trainable parameters.
    pub fn trainable_names(&self) -> impl Iterator<Item = &str> {
        self.trainable.iter().map(|(name, _)| name.as_str())
    }

    /// Names of frozen parameters.
    pub fn frozen_names(&self) -> impl Iterator<Item = &str> {
        self.frozen.iter().map(|(name, _)| name.as_str())
    }

    /// Scalar count of trainable parameters.
    #[must_use]
    pub fn trainable_elements(&self) -> usize {
        self.trainable.iter().map(|(_, v)| v.elem_count()).sum()
    }

    /// Scalar count of frozen parameters.
    #[must_use]
    pub fn frozen_elements(&self) -> usize {
        self.frozen.iter().map(|(_, v)| v.elem_count()).sum()
    }

    /// Gradient flow that detaches every frozen parameter.
    #[must_use]
    pub fn gradient_flow(&self) -> GradientFlow {
        GradientFlow::with_frozen(self.frozen_names())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use crate::model::UNet3dLite;
    use candle_core::Device;

    fn model() -> UNet3dLite {
        let config = ModelConfig {
            out_channels: 3,
            features: 4,
            dropout: 0.0,
            ..ModelConfig::default()
        };
        UNet3dLite::new(&config, &Device::Cpu, 0).unwrap()
    }

    #[test]
    fn test_decoder_pattern() {
        let partition = ParameterSelector::from_patterns(["decoder"])
            .select(&model())
            .unwrap();
        let trainable: Vec<&str> = partition.trainable_names().collect();
        assert_eq!(
            trainable,
            vec!["decoder.conv1.bias", "decoder.conv1.weight", "decoder.skip.weight"]
        );
        assert!(partition.frozen_names().all(|n| !n.starts_with("decoder")));
        assert_eq!(partition.trainable().len() + partition.frozen().len(), 10);
    }

    #[test]
    fn test_later_group_overrides() {
        let selector = ParameterSelector::new(vec![
            ParameterGroup::trainable("encoder"),
            ParameterGroup::frozen("encoder.context"),
        ]);
        assert!(selector.is_trainable("encoder.conv1.weight"));
        assert!(!selector.is_trainable("encoder.context.weight"));
        assert!(!selector.is_trainable("decoder.conv1.weight"));
    }

    #[test]
    fn test_no_match_is_an_error() {
        let err = ParameterSelector::from_patterns(["transformer"])
            .select(&model())
            .unwrap_err();
        assert!(matches!(
            err,
            TrainError::NoTrainableParameters { total: 10, .. }
        ));
    }

    #[test]
    fn test_element_counts() {
        let partition = ParameterSelector::from_patterns(["final_conv"])
            .select(&model())
            .unwrap();
        // head: 3 x 4 weight + 3 bias
        assert_eq!(partition.trainable_elements(), 15);
        let total = model().parameter_count().unwrap();
        assert_eq!(partition.trainable_elements() + partition.frozen_elements(), total);
    }

    #[test]
    fn test_gradient_flow_freezes_rest() {
        let partition = ParameterSelector::from_patterns(["decoder"])
            .select(&model())
            .unwrap();
        let flow = partition.gradient_flow();
        assert!(flow.is_frozen("encoder.conv1.weight"));
        assert!(!flow.is_frozen("decoder.skip.weight"));
    }
}
