//! Instance type selection.
//!
//! Selection keeps the provider's catalog order: the first eligible entry
//! wins, even when a cheaper one follows.

use crate::providers::InstanceType;

/// Criteria an instance type must satisfy.
#[derive(Debug, Clone, PartialEq)]
pub struct Criteria {
    /// Substring the GPU description must contain, case-insensitively.
    /// Empty matches everything.
    pub gpu: String,
    /// Inclusive ceiling on the spot price. `None` means unbounded.
    pub max_spot_price: Option<f64>,
}

impl Criteria {
    /// Criteria with both a GPU filter and a price ceiling.
    #[must_use]
    pub fn new(gpu: impl Into<String>, max_spot_price: f64) -> Self {
        Self {
            gpu: gpu.into(),
            max_spot_price: Some(max_spot_price),
        }
    }

    /// Whether `instance_type` satisfies these criteria.
    #[must_use]
    pub fn matches(&self, instance_type: &InstanceType) -> bool {
        let gpu_ok = self.gpu.is_empty()
            || instance_type
                .gpu_description
                .to_lowercase()
                .contains(&self.gpu.to_lowercase());
        let price_ok = self
            .max_spot_price
            .is_none_or(|cap| instance_type.spot_price_per_hour <= cap);
        gpu_ok && price_ok
    }
}

/// Return the first catalog entry matching `criteria`, or `None`.
#[must_use]
pub fn first_match<'a>(catalog: &'a [InstanceType], criteria: &Criteria) -> Option<&'a InstanceType> {
    catalog.iter().find(|t| criteria.matches(t))
}

/// Return every catalog entry matching `criteria`, in catalog order.
#[must_use]
pub fn all_matches<'a>(catalog: &'a [InstanceType], criteria: &Criteria) -> Vec<&'a InstanceType> {
    catalog.iter().filter(|t| criteria.matches(t)).collect()
}
