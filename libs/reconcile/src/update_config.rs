//! Per-group rollout settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{ChangeKind, ChangeSet, ReconcileError};

/// A count given either absolutely or as a percentage of the group size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawValue", into = "RawValue")]
pub enum Quantity {
    Count(u32),
    Percent(u32),
}

impl Quantity {
    /// Resolves the quantity against a group of `size` instances.
    ///
    /// Percentages round to the nearest instance.
    pub fn resolve(&self, size: usize) -> usize {
        match *self {
            Quantity::Count(n) => n as usize,
            Quantity::Percent(pct) => {
                let exact = size as f64 * f64::from(pct) / 100.0;
                exact.round() as usize
            }
        }
    }
}

impl std::str::FromStr for Quantity {
    type Err = ReconcileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let invalid = || ReconcileError::InvalidQuantity(s.to_string());

        match trimmed.strip_suffix('%') {
            Some(pct) => {
                let pct: u32 = pct.trim().parse().map_err(|_| invalid())?;
                if pct > 100 {
                    return Err(invalid());
                }
                Ok(Quantity::Percent(pct))
            }
            None => trimmed.parse().map(Quantity::Count).map_err(|_| invalid()),
        }
    }
}

impl std::fmt::Display for Quantity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Quantity::Count(n) => write!(f, "{n}"),
            Quantity::Percent(p) => write!(f, "{p}%"),
        }
    }
}

/// Minimum and maximum time, in milliseconds, to watch an instance after it
/// was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawValue", into = "RawValue")]
pub struct WatchRange {
    min_ms: u64,
    max_ms: u64,
}

impl WatchRange {
    pub fn new(min_ms: u64, max_ms: u64) -> Result<Self, ReconcileError> {
        if min_ms > max_ms {
            return Err(ReconcileError::InvalidWatchRange(format!(
                "{min_ms}-{max_ms}: minimum exceeds maximum"
            )));
        }
        Ok(Self { min_ms, max_ms })
    }

    pub fn min_ms(&self) -> u64 {
        self.min_ms
    }

    pub fn max_ms(&self) -> u64 {
        self.max_ms
    }

    pub fn min(&self) -> Duration {
        Duration::from_millis(self.min_ms)
    }

    pub fn max(&self) -> Duration {
        Duration::from_millis(self.max_ms)
    }
}

impl std::str::FromStr for WatchRange {
    type Err = ReconcileError;

    /// Accepts `"1000-2000"` or a single `"1000"` (min = max).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ReconcileError::InvalidWatchRange(s.to_string());
        let parse = |part: &str| part.trim().parse::<u64>().map_err(|_| invalid());

        match s.split_once('-') {
            Some((min, max)) => Self::new(parse(min)?, parse(max)?),
            None => {
                let value = parse(s)?;
                Self::new(value, value)
            }
        }
    }
}

impl std::fmt::Display for WatchRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.min_ms, self.max_ms)
    }
}

/// Manifest form of quantities and watch ranges: an integer or a string.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum RawValue {
    Int(u64),
    Text(String),
}

impl TryFrom<RawValue> for Quantity {
    type Error = ReconcileError;

    fn try_from(raw: RawValue) -> Result<Self, Self::Error> {
        match raw {
            RawValue::Int(n) => u32::try_from(n)
                .map(Quantity::Count)
                .map_err(|_| ReconcileError::InvalidQuantity(n.to_string())),
            RawValue::Text(s) => s.parse(),
        }
    }
}

impl From<Quantity> for RawValue {
    fn from(q: Quantity) -> Self {
        match q {
            Quantity::Count(n) => RawValue::Int(u64::from(n)),
            Quantity::Percent(_) => RawValue::Text(q.to_string()),
        }
    }
}

impl TryFrom<RawValue> for WatchRange {
    type Error = ReconcileError;

    fn try_from(raw: RawValue) -> Result<Self, Self::Error> {
        match raw {
            RawValue::Int(n) => WatchRange::new(n, n),
            RawValue::Text(s) => s.parse(),
        }
    }
}

impl From<WatchRange> for RawValue {
    fn from(range: WatchRange) -> Self {
        RawValue::Text(range.to_string())
    }
}

fn default_serial() -> bool {
    true
}

fn default_shutdown_drain_on() -> ChangeSet {
    [
        ChangeKind::Network,
        ChangeKind::ResourceProfile,
        ChangeKind::Stemcell,
        ChangeKind::Environment,
        ChangeKind::PersistentDisk,
    ]
    .into_iter()
    .collect()
}

/// Rollout settings for one instance group.
///
/// Loaded once per convergence run and never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateConfig {
    pub canaries: Quantity,

    pub max_in_flight: Quantity,

    pub canary_watch_time: WatchRange,

    pub update_watch_time: WatchRange,

    /// Whether the enclosing runner updates this group alone. Carried for
    /// the runner; the engine does not interpret it.
    #[serde(default = "default_serial")]
    pub serial: bool,

    /// Change categories that classify a drain as `shutdown` rather than
    /// `update`.
    #[serde(default = "default_shutdown_drain_on")]
    pub shutdown_drain_on: ChangeSet,
}

impl UpdateConfig {
    pub fn new(
        canaries: Quantity,
        max_in_flight: Quantity,
        canary_watch_time: WatchRange,
        update_watch_time: WatchRange,
    ) -> Self {
        Self {
            canaries,
            max_in_flight,
            canary_watch_time,
            update_watch_time,
            serial: default_serial(),
            shutdown_drain_on: default_shutdown_drain_on(),
        }
    }

    /// Number of canaries for a group of `size` changed instances.
    pub fn canaries_for(&self, size: usize) -> usize {
        self.canaries.resolve(size).min(size)
    }

    /// Concurrency bound for a group of `size` instances; never below one.
    pub fn max_in_flight_for(&self, size: usize) -> usize {
        self.max_in_flight.resolve(size).max(1)
    }

    pub fn watch_range(&self, canary: bool) -> WatchRange {
        if canary {
            self.canary_watch_time
        } else {
            self.update_watch_time
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    #[rstest]
    #[case("3", Quantity::Count(3))]
    #[case(" 50% ", Quantity::Percent(50))]
    #[case("100%", Quantity::Percent(100))]
    fn test_quantity_parse(#[case] input: &str, #[case] expected: Quantity) {
        assert_eq!(input.parse::<Quantity>().unwrap(), expected);
    }

    #[rstest]
    #[case("")]
    #[case("abc")]
    #[case("150%")]
    #[case("-1")]
    fn test_quantity_parse_rejects(#[case] input: &str) {
        assert!(input.parse::<Quantity>().is_err());
    }

    #[rstest]
    #[case(Quantity::Percent(50), 4, 2)]
    #[case(Quantity::Percent(50), 3, 2)]
    #[case(Quantity::Percent(10), 4, 0)]
    #[case(Quantity::Count(2), 10, 2)]
    fn test_quantity_resolve(#[case] q: Quantity, #[case] size: usize, #[case] expected: usize) {
        assert_eq!(q.resolve(size), expected);
    }

    #[test]
    fn test_watch_range_parse() {
        let range: WatchRange = "1000-2000".parse().unwrap();
        assert_eq!((range.min_ms(), range.max_ms()), (1000, 2000));

        let single: WatchRange = "3000".parse().unwrap();
        assert_eq!((single.min_ms(), single.max_ms()), (3000, 3000));

        assert!("2000-1000".parse::<WatchRange>().is_err());
        assert!("fast".parse::<WatchRange>().is_err());
    }

    #[test]
    fn test_update_config_from_manifest_json() {
        let config: UpdateConfig = serde_json::from_value(serde_json::json!({
            "canaries": "50%",
            "max_in_flight": 2,
            "canary_watch_time": "1000-2000",
            "update_watch_time": 5000,
        }))
        .unwrap();

        assert_eq!(config.canaries, Quantity::Percent(50));
        assert_eq!(config.max_in_flight, Quantity::Count(2));
        assert_eq!(config.update_watch_time.min_ms(), 5000);
        assert!(config.serial);
        assert!(config.shutdown_drain_on.contains(ChangeKind::Network));
        assert!(!config.shutdown_drain_on.contains(ChangeKind::Dns));
    }

    #[test]
    fn test_update_config_rejects_inverted_range() {
        let result: Result<UpdateConfig, _> = serde_json::from_value(serde_json::json!({
            "canaries": 1,
            "max_in_flight": 1,
            "canary_watch_time": "5000-1000",
            "update_watch_time": 5000,
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_update_config_serializes_manifest_form() {
        let config = UpdateConfig::new(
            Quantity::Percent(25),
            Quantity::Count(3),
            WatchRange::new(1000, 2000).unwrap(),
            WatchRange::new(500, 500).unwrap(),
        );
        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(value["canaries"], "25%");
        assert_eq!(value["max_in_flight"], 3);
        assert_eq!(value["canary_watch_time"], "1000-2000");
    }

    #[test]
    fn test_bounds_for_group() {
        let config = UpdateConfig::new(
            Quantity::Count(5),
            Quantity::Percent(10),
            WatchRange::new(0, 0).unwrap(),
            WatchRange::new(0, 0).unwrap(),
        );
        assert_eq!(config.canaries_for(2), 2);
        assert_eq!(config.max_in_flight_for(3), 1);
        assert_eq!(config.max_in_flight_for(40), 4);
    }

    proptest! {
        #[test]
        fn prop_max_in_flight_at_least_one(pct in 0u32..=100, size in 0usize..500) {
            let config = UpdateConfig::new(
                Quantity::Count(0),
                Quantity::Percent(pct),
                WatchRange::new(0, 0).unwrap(),
                WatchRange::new(0, 0).unwrap(),
            );
            prop_assert!(config.max_in_flight_for(size) >= 1);
        }

        #[test]
        fn prop_canaries_never_exceed_size(n in 0u32..100, size in 0usize..100) {
            let config = UpdateConfig::new(
                Quantity::Count(n),
                Quantity::Count(1),
                WatchRange::new(0, 0).unwrap(),
                WatchRange::new(0, 0).unwrap(),
            );
            prop_assert!(config.canaries_for(size) <= size);
        }
    }
}
