// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

use std::time::Duration;

use crate::errors;
use crate::errors::TopodError;

pub type TopodResult<T> = Result<T, errors::TopodError>;

/// Longest interval the engine will reason about: one hundred years.
const MAX_DELTA_MS: i64 = 100 * 365 * 24 * 3600 * 1000;

/// Convert a std `Duration` into the chrono type used for timestamp
/// arithmetic, saturating at one hundred years.
pub fn delta(d: Duration) -> chrono::Duration {
    let ms = i64::try_from(d.as_millis()).unwrap_or(MAX_DELTA_MS);
    chrono::Duration::milliseconds(ms.min(MAX_DELTA_MS))
}

/// Tunables of the reconciliation engine.  None of the numbers are part of
/// any external contract.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Confidence assigned to a link when it is first observed
    pub initial_confidence: f64,
    /// Confidence gained from each corroborating observation
    pub confirm_increment: f64,
    /// Level toward which a link only ever seen from one side converges
    pub one_sided_floor: f64,
    /// Largest confidence change applied when converging toward the floor
    pub decay_step: f64,
    /// Confidence ceiling for links with an unknown remote port
    pub wildcard_cap: f64,
    /// Silence after which a link is marked stale
    pub ttl_stale: Duration,
    /// Silence after which a stale link is removed
    pub ttl_remove: Duration,
    /// Maximum gap between two observations for the second to confirm the
    /// first; also the window in which a collector counts as active
    pub confirm_window: Duration,
    pub sweep_interval: Duration,
    /// How far in the future an observation timestamp may be before it is
    /// replaced by the receipt time
    pub max_clock_drift: Duration,
    /// How long removed links are kept in the tombstone log
    pub tombstone_retention: Duration,
    pub tombstone_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let ttl_stale = Duration::from_secs(300);
        EngineConfig {
            initial_confidence: 0.3,
            confirm_increment: 0.3,
            one_sided_floor: 0.7,
            decay_step: 0.05,
            wildcard_cap: 0.5,
            ttl_stale,
            ttl_remove: Duration::from_secs(900),
            confirm_window: ttl_stale,
            sweep_interval: ttl_stale / 4,
            max_clock_drift: Duration::from_secs(60),
            tombstone_retention: Duration::from_secs(3600),
            tombstone_capacity: 1024,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> TopodResult<()> {
        let unit = [
            ("initial_confidence", self.initial_confidence),
            ("confirm_increment", self.confirm_increment),
            ("one_sided_floor", self.one_sided_floor),
            ("decay_step", self.decay_step),
            ("wildcard_cap", self.wildcard_cap),
        ];
        for (name, val) in unit {
            if !(0.0..=1.0).contains(&val) {
                return Err(TopodError::Invalid(format!(
                    "{name} must be within [0, 1], not {val}"
                )));
            }
        }
        if self.initial_confidence > self.wildcard_cap {
            return Err(TopodError::Invalid(
                "initial_confidence may not exceed wildcard_cap".into(),
            ));
        }
        if self.ttl_stale.is_zero() || self.sweep_interval.is_zero() {
            return Err(TopodError::Invalid(
                "ttl_stale and sweep_interval must be non-zero".into(),
            ));
        }
        if self.ttl_remove <= self.ttl_stale {
            return Err(TopodError::Invalid(format!(
                "ttl_remove ({:?}) must exceed ttl_stale ({:?})",
                self.ttl_remove, self.ttl_stale
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let cfg = EngineConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.sweep_interval, Duration::from_secs(75));
    }

    #[test]
    fn test_config_validation() {
        let cfg = EngineConfig {
            ttl_remove: Duration::from_secs(300),
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(TopodError::Invalid(_))));

        let cfg = EngineConfig {
            confirm_increment: 1.5,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(TopodError::Invalid(_))));

        let cfg = EngineConfig {
            sweep_interval: Duration::ZERO,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(TopodError::Invalid(_))));
    }

    #[test]
    fn test_delta() {
        assert_eq!(
            delta(Duration::from_secs(300)),
            chrono::Duration::seconds(300)
        );
        assert_eq!(delta(Duration::MAX), chrono::Duration::days(36500));
    }
}
