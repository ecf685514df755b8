use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::CoreError;

/// An effective-dated price: from `effective_from` onward, one bundle of
/// `units_per_bundle` units costs `amount_per_bundle` in `currency`.
///
/// Never mutated once created, only superseded by a later-dated entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceConfig {
    pub id: Uuid,
    pub amount_per_bundle: f64,
    pub units_per_bundle: u32,
    pub currency: String,
    pub effective_from: DateTime<Utc>,
}

impl PriceConfig {
    /// Build and validate a new config. Currency is normalized to uppercase.
    pub fn new(
        amount_per_bundle: f64,
        units_per_bundle: u32,
        currency: &str,
        effective_from: DateTime<Utc>,
    ) -> Result<Self, CoreError> {
        let config = Self {
            id: Uuid::new_v4(),
            amount_per_bundle,
            units_per_bundle,
            currency: currency.trim().to_uppercase(),
            effective_from,
        };
        config.validate()?;
        Ok(config)
    }

    /// Cost of a single unit under this config.
    #[must_use]
    pub fn unit_cost(&self) -> f64 {
        self.amount_per_bundle / f64::from(self.units_per_bundle)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if !self.amount_per_bundle.is_finite() || self.amount_per_bundle <= 0.0 {
            return Err(CoreError::validation(
                "amount_per_bundle",
                format!("must be a positive number, got {}", self.amount_per_bundle),
            ));
        }
        if self.units_per_bundle == 0 {
            return Err(CoreError::validation(
                "units_per_bundle",
                "must be at least 1",
            ));
        }
        if self.currency.len() != 3 || !self.currency.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(CoreError::validation(
                "currency",
                format!(
                    "invalid currency code '{}': must be exactly 3 ASCII letters (e.g., USD, EUR, PLN)",
                    self.currency
                ),
            ));
        }
        Ok(())
    }
}

/// Result of resolving the price in effect at an instant.
///
/// `NoPrice` is the sentinel for instants that precede every known config.
/// Aggregation treats it as zero cost and raises a cost-undefined flag.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PriceResolution<'a> {
    Priced(&'a PriceConfig),
    NoPrice,
}

impl<'a> PriceResolution<'a> {
    #[must_use]
    pub fn unit_cost(&self) -> f64 {
        match self {
            PriceResolution::Priced(config) => config.unit_cost(),
            PriceResolution::NoPrice => 0.0,
        }
    }

    #[must_use]
    pub fn is_defined(&self) -> bool {
        matches!(self, PriceResolution::Priced(_))
    }

    #[must_use]
    pub fn config(&self) -> Option<&'a PriceConfig> {
        match self {
            PriceResolution::Priced(config) => Some(config),
            PriceResolution::NoPrice => None,
        }
    }
}

/// Ordered history of effective-dated price configs.
///
/// Entries are strictly ascending by `effective_from`; inserting a config at
/// an instant that already has one replaces it (latest insert wins).
/// All entries share one currency.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PriceTimeline {
    entries: Vec<PriceConfig>,
}

impl PriceTimeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a timeline from stored configs, validating each one.
    pub fn from_configs(configs: Vec<PriceConfig>) -> Result<Self, CoreError> {
        let mut timeline = Self::new();
        for config in configs {
            timeline.add_config(config)?;
        }
        Ok(timeline)
    }

    /// Insert a config, keeping ascending order by `effective_from`.
    /// Returns the config it replaced, if one existed at the same instant.
    pub fn add_config(&mut self, config: PriceConfig) -> Result<Option<PriceConfig>, CoreError> {
        config.validate()?;
        if let Some(currency) = self.currency() {
            if currency != config.currency {
                return Err(CoreError::validation(
                    "currency",
                    format!(
                        "price history is kept in {currency}; got {} (currency conversion is not supported)",
                        config.currency
                    ),
                ));
            }
        }

        match self
            .entries
            .binary_search_by_key(&config.effective_from, |c| c.effective_from)
        {
            Ok(idx) => Ok(Some(std::mem::replace(&mut self.entries[idx], config))),
            Err(idx) => {
                self.entries.insert(idx, config);
                Ok(None)
            }
        }
    }

    /// The entry with the greatest `effective_from <= at`. O(log n).
    #[must_use]
    pub fn resolve_price_at(&self, at: DateTime<Utc>) -> PriceResolution<'_> {
        let idx = self.entries.partition_point(|c| c.effective_from <= at);
        match idx.checked_sub(1) {
            Some(i) => PriceResolution::Priced(&self.entries[i]),
            None => PriceResolution::NoPrice,
        }
    }

    /// The first config that becomes effective strictly after `at`.
    #[must_use]
    pub fn next_after(&self, at: DateTime<Utc>) -> Option<&PriceConfig> {
        let idx = self.entries.partition_point(|c| c.effective_from <= at);
        self.entries.get(idx)
    }

    pub fn config(&self, id: Uuid) -> Result<&PriceConfig, CoreError> {
        self.entries
            .iter()
            .find(|c| c.id == id)
            .ok_or_else(|| CoreError::price_config_not_found(id))
    }

    /// Currency shared by every entry, if any entry exists.
    #[must_use]
    pub fn currency(&self) -> Option<&str> {
        self.entries.first().map(|c| c.currency.as_str())
    }

    #[must_use]
    pub fn entries(&self) -> &[PriceConfig] {
        &self.entries
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
