use std::collections::BTreeMap;
use std::str::FromStr;

use log::debug;
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur during stake operations
#[derive(Debug, Error, PartialEq)]
pub enum StakeError {
    #[error("No stakes available for validator selection")]
    NoStake,

    #[error("Invalid stake for {identity}: {weight}")]
    InvalidStake { identity: String, weight: f64 },

    #[error("Invalid stake entry: {0}")]
    Parse(String),
}

/// Stake weight of every participant, keyed by identity
///
/// Identities are kept sorted so a seeded draw is reproducible.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "BTreeMap<String, f64>", into = "BTreeMap<String, f64>")]
pub struct StakeRegistry {
    stakes: BTreeMap<String, f64>,
}

impl StakeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a registry from `(identity, weight)` pairs
    pub fn from_pairs<I, S>(pairs: I) -> Result<Self, StakeError>
    where
        I: IntoIterator<Item = (S, f64)>,
        S: Into<String>,
    {
        let mut registry = Self::new();
        for (identity, weight) in pairs {
            registry.insert(identity, weight)?;
        }
        Ok(registry)
    }

    /// Sets the stake of `identity`, returning its previous stake
    ///
    /// Rejects negative or non-finite weights, and any weight that would
    /// make the total stake overflow.
    pub fn insert(
        &mut self,
        identity: impl Into<String>,
        weight: f64,
    ) -> Result<Option<f64>, StakeError> {
        let identity = identity.into();
        if !weight.is_finite() || weight < 0.0 {
            return Err(StakeError::InvalidStake { identity, weight });
        }

        let others: f64 = self
            .stakes
            .iter()
            .filter(|(existing, _)| **existing != identity)
            .map(|(_, stake)| *stake)
            .sum();
        if !(others + weight).is_finite() {
            return Err(StakeError::InvalidStake { identity, weight });
        }

        Ok(self.stakes.insert(identity, weight))
    }

    pub fn total_stake(&self) -> f64 {
        self.stakes.values().sum()
    }

    pub fn len(&self) -> usize {
        self.stakes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stakes.is_empty()
    }
}

impl TryFrom<BTreeMap<String, f64>> for StakeRegistry {
    type Error = StakeError;

    fn try_from(stakes: BTreeMap<String, f64>) -> Result<Self, Self::Error> {
        Self::from_pairs(stakes)
    }
}

impl From<StakeRegistry> for BTreeMap<String, f64> {
    fn from(registry: StakeRegistry) -> Self {
        registry.stakes
    }
}

/// Parses `identity:weight` entries separated by commas, e.g. `Alice:50,Bob:30`
impl FromStr for StakeRegistry {
    type Err = StakeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut registry = Self::new();

        for entry in s.split(',').map(str::trim).filter(|entry| !entry.is_empty()) {
            let (identity, weight) = entry
                .rsplit_once(':')
                .ok_or_else(|| StakeError::Parse(entry.to_string()))?;
            let identity = identity.trim();
            if identity.is_empty() {
                return Err(StakeError::Parse(entry.to_string()));
            }
            let weight: f64 = weight
                .trim()
                .parse()
                .map_err(|_| StakeError::Parse(entry.to_string()))?;

            registry.insert(identity, weight)?;
        }

        Ok(registry)
    }
}

/// Draws one validator with probability proportional to its stake
///
/// # Arguments
///
/// * `registry` - The stakes to draw from
/// * `rng` - Source of randomness
///
/// # Returns
///
/// The selected identity, or `StakeError::NoStake` if the total stake is
/// zero or not finite
pub fn select_validator<R: Rng + ?Sized>(
    registry: &StakeRegistry,
    rng: &mut R,
) -> Result<String, StakeError> {
    let total = registry.total_stake();
    if registry.is_empty() || !total.is_finite() || total <= 0.0 {
        return Err(StakeError::NoStake);
    }

    let distribution = WeightedIndex::<f64>::new(registry.stakes.values().copied())
        .map_err(|_| StakeError::NoStake)?;

    let chosen = distribution.sample(rng);
    registry
        .stakes
        .keys()
        .nth(chosen)
        .cloned()
        .ok_or(StakeError::NoStake)
}

/// Proof-of-stake selector owning its stakes and random source
pub struct ValidatorSelector {
    registry: StakeRegistry,
    rng: Box<dyn RngCore + Send>,
}

impl std::fmt::Debug for ValidatorSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValidatorSelector")
            .field("registry", &self.registry)
            .finish()
    }
}

impl ValidatorSelector {
    /// Creates a selector seeded from operating system entropy
    pub fn new(registry: StakeRegistry) -> Self {
        Self::with_rng(registry, StdRng::from_entropy())
    }

    /// Creates a selector whose draws are reproducible
    pub fn with_seed(registry: StakeRegistry, seed: u64) -> Self {
        Self::with_rng(registry, StdRng::seed_from_u64(seed))
    }

    /// Creates a selector drawing from the given random source
    pub fn with_rng<R: RngCore + Send + 'static>(registry: StakeRegistry, rng: R) -> Self {
        ValidatorSelector {
            registry,
            rng: Box::new(rng),
        }
    }

    pub fn registry(&self) -> &StakeRegistry {
        &self.registry
    }

    /// Replaces the stakes used for subsequent draws
    pub fn set_registry(&mut self, registry: StakeRegistry) {
        self.registry = registry;
    }

    /// Selects the validator of the next block
    pub fn select(&mut self) -> Result<String, StakeError> {
        let validator = select_validator(&self.registry, &mut self.rng)?;
        debug!(
            "Selected validator {} out of {} participants",
            validator,
            self.registry.len()
        );
        Ok(validator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn sample_registry() -> StakeRegistry {
        StakeRegistry::from_pairs([("Alice", 50.0), ("Bob", 30.0), ("Charlie", 20.0)]).unwrap()
    }

    #[test]
    fn test_selection_converges_to_stake_share() {
        let mut selector = ValidatorSelector::with_seed(sample_registry(), 7);
        let draws = 100_000;
        let mut counts: HashMap<String, usize> = HashMap::new();

        for _ in 0..draws {
            *counts.entry(selector.select().unwrap()).or_default() += 1;
        }

        let share = |id: &str| counts.get(id).copied().unwrap_or(0) as f64 / draws as f64;
        assert!((share("Alice") - 0.5).abs() < 0.01);
        assert!((share("Bob") - 0.3).abs() < 0.01);
        assert!((share("Charlie") - 0.2).abs() < 0.01);
    }

    #[test]
    fn test_same_seed_same_draws() {
        let mut first = ValidatorSelector::with_seed(sample_registry(), 42);
        let mut second = ValidatorSelector::with_seed(sample_registry(), 42);

        for _ in 0..50 {
            assert_eq!(first.select().unwrap(), second.select().unwrap());
        }
    }

    #[test]
    fn test_zero_weight_never_selected() {
        let registry = StakeRegistry::from_pairs([("Alice", 0.0), ("Bob", 1.0)]).unwrap();
        let mut selector = ValidatorSelector::with_seed(registry, 1);

        for _ in 0..200 {
            assert_eq!(selector.select().unwrap(), "Bob");
        }
    }

    #[test]
    fn test_all_zero_stake_fails() {
        let registry = StakeRegistry::from_pairs([("Alice", 0.0), ("Bob", 0.0)]).unwrap();
        let mut selector = ValidatorSelector::with_seed(registry, 1);

        assert_eq!(selector.select(), Err(StakeError::NoStake));
    }

    #[test]
    fn test_empty_registry_fails() {
        let mut selector = ValidatorSelector::with_seed(StakeRegistry::new(), 1);
        assert_eq!(selector.select(), Err(StakeError::NoStake));
    }

    #[test]
    fn test_negative_stake_rejected() {
        let mut registry = StakeRegistry::new();
        assert!(matches!(
            registry.insert("Mallory", -1.0),
            Err(StakeError::InvalidStake { .. })
        ));
        assert!(matches!(
            registry.insert("Mallory", f64::NAN),
            Err(StakeError::InvalidStake { .. })
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_overflowing_total_rejected() {
        assert_eq!(
            StakeRegistry::from_pairs([("A", 1e308), ("B", 1e308)]),
            Err(StakeError::InvalidStake {
                identity: "B".to_string(),
                weight: 1e308,
            })
        );
        assert!(serde_json::from_str::<StakeRegistry>(r#"{"A":1e308,"B":1e308}"#).is_err());

        let mut registry = StakeRegistry::from_pairs([("A", 1e308)]).unwrap();
        assert_eq!(registry.insert("A", 1.5e308), Ok(Some(1e308)));
        assert!(registry.insert("B", 1e308).is_err());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_non_finite_total_is_no_stake() {
        let stakes = BTreeMap::from([("A".to_string(), 1e308), ("B".to_string(), 1e308)]);
        let mut selector = ValidatorSelector::with_seed(StakeRegistry { stakes }, 1);

        assert_eq!(selector.select(), Err(StakeError::NoStake));
    }

    #[test]
    fn test_selection_with_huge_finite_total() {
        let registry = StakeRegistry::from_pairs([("A", 8e307), ("B", 8e307)]).unwrap();
        let mut selector = ValidatorSelector::with_seed(registry, 1);

        for _ in 0..20 {
            let validator = selector.select().unwrap();
            assert!(validator == "A" || validator == "B");
        }
    }

    #[test]
    fn test_parse_registry() {
        let registry: StakeRegistry = "Alice:50, Bob:30,Charlie:20.5".parse().unwrap();

        assert_eq!(registry.len(), 3);
        assert_eq!(BTreeMap::from(registry.clone())["Charlie"], 20.5);
        assert_eq!(registry.total_stake(), 100.5);

        assert!(matches!(
            "Alice".parse::<StakeRegistry>(),
            Err(StakeError::Parse(_))
        ));
        assert!(matches!(
            "Alice:lots".parse::<StakeRegistry>(),
            Err(StakeError::Parse(_))
        ));
    }

    #[test]
    fn test_registry_json_round_trip_rejects_negative() {
        let registry = sample_registry();
        let json = serde_json::to_string(&registry).unwrap();
        assert_eq!(json, r#"{"Alice":50.0,"Bob":30.0,"Charlie":20.0}"#);

        assert!(serde_json::from_str::<StakeRegistry>(r#"{"Eve":-5}"#).is_err());
    }
}
