//! Per-unit dividend rates by data type.

use std::collections::BTreeMap;

use crate::error::{Error, Result};

/// Key of the fallback entry.
pub const DEFAULT_KEY: &str = "default";

const STANDARD_DEFAULT_RATE: f64 = 0.001;

/// Rates shipped with the service, in currency units per usage.
pub const STANDARD_RATES: [(&str, f64); 5] = [
    ("spotify", 0.01),   // per play
    ("gmail", 0.005),    // per email
    ("location", 0.002), // per location point
    ("health", 0.05),    // per health data point
    (DEFAULT_KEY, STANDARD_DEFAULT_RATE),
];

/// Read-only mapping from data type to rate, with a mandatory default.
#[derive(Debug, Clone, PartialEq)]
pub struct RateTable {
    by_type: BTreeMap<String, f64>,
    default_rate: f64,
}

impl RateTable {
    /// Build from explicit entries; one of them must be [`DEFAULT_KEY`].
    pub fn new<K: Into<String>>(entries: impl IntoIterator<Item = (K, f64)>) -> Result<Self> {
        let mut by_type = BTreeMap::new();
        for (key, rate) in entries {
            let key = key.into();
            validate_rate(&key, rate)?;
            by_type.insert(key, rate);
        }
        let default_rate = by_type
            .remove(DEFAULT_KEY)
            .ok_or_else(|| Error::invalid(format!("rate table needs a '{DEFAULT_KEY}' entry")))?;
        Ok(Self {
            by_type,
            default_rate,
        })
    }

    /// Layer overrides on top of this table; an override of [`DEFAULT_KEY`]
    /// replaces the fallback rate.
    pub fn with_overrides<K: Into<String>>(
        mut self,
        overrides: impl IntoIterator<Item = (K, f64)>,
    ) -> Result<Self> {
        for (key, rate) in overrides {
            let key = key.into();
            validate_rate(&key, rate)?;
            if key == DEFAULT_KEY {
                self.default_rate = rate;
            } else {
                self.by_type.insert(key, rate);
            }
        }
        Ok(self)
    }

    pub fn rate(&self, data_type: &str) -> f64 {
        self.by_type
            .get(data_type)
            .copied()
            .unwrap_or(self.default_rate)
    }

    pub fn default_rate(&self) -> f64 {
        self.default_rate
    }

    /// Explicit entries (excluding the default), sorted by data type.
    pub fn entries(&self) -> impl Iterator<Item = (&str, f64)> {
        self.by_type.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

impl Default for RateTable {
    fn default() -> Self {
        Self {
            by_type: STANDARD_RATES
                .iter()
                .filter(|(k, _)| *k != DEFAULT_KEY)
                .map(|(k, v)| (k.to_string(), *v))
                .collect(),
            default_rate: STANDARD_DEFAULT_RATE,
        }
    }
}

fn validate_rate(key: &str, rate: f64) -> Result<()> {
    if key.is_empty() {
        return Err(Error::invalid("rate table keys must be non-empty"));
    }
    if !rate.is_finite() || rate < 0.0 {
        return Err(Error::invalid(format!(
            "rate for '{key}' must be a finite non-negative number, got {rate}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_standard_rates() {
        let rates = RateTable::default();
        assert_eq!(rates.rate("spotify"), 0.01);
        assert_eq!(rates.rate("gmail"), 0.005);
        assert_eq!(rates.rate("location"), 0.002);
        assert_eq!(rates.rate("health"), 0.05);
        assert_eq!(rates.rate(DEFAULT_KEY), 0.001);
        assert_eq!(rates.default_rate(), 0.001);
    }

    #[test]
    fn test_default_matches_standard_table() {
        assert_eq!(RateTable::new(STANDARD_RATES).unwrap(), RateTable::default());
    }

    #[test]
    fn test_new_requires_default_entry() {
        let err = RateTable::new([("spotify", 0.01)]).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_rejects_negative_and_nan() {
        assert!(RateTable::new([(DEFAULT_KEY, -0.1)]).is_err());
        assert!(RateTable::new([(DEFAULT_KEY, f64::NAN)]).is_err());
        assert!(
            RateTable::default()
                .with_overrides([("spotify", f64::INFINITY)])
                .is_err()
        );
    }

    #[test]
    fn test_overrides_layer_on_standard() {
        let rates = RateTable::default()
            .with_overrides([("spotify", 0.02), ("podcasts", 0.003), (DEFAULT_KEY, 0.0)])
            .unwrap();
        assert_eq!(rates.rate("spotify"), 0.02);
        assert_eq!(rates.rate("podcasts"), 0.003);
        assert_eq!(rates.rate("gmail"), 0.005);
        assert_eq!(rates.rate("unheard-of"), 0.0);
    }

    #[test]
    fn test_entries_exclude_default() {
        let rates = RateTable::default();
        let keys: Vec<&str> = rates.entries().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["gmail", "health", "location", "spotify"]);
    }

    proptest! {
        #[test]
        fn unknown_types_fall_back_to_default(data_type in "[a-z_]{1,16}") {
            let rates = RateTable::default();
            prop_assume!(!["spotify", "gmail", "location", "health"].contains(&data_type.as_str()));
            prop_assert_eq!(rates.rate(&data_type), rates.rate(DEFAULT_KEY));
        }
    }
}
