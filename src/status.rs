use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::position::Position;

/// Writes a JSON snapshot of the engine after every cycle so external
/// readers never have to touch live engine state.
#[derive(Debug)]
pub struct StatusReporter {
    path: PathBuf,
    interval_secs: u64,
    cycles: u64,
    entries: u64,
    exits: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusPosition {
    pub pair: String,
    pub long_venue: String,
    pub short_venue: String,
    pub long_volume: String,
    pub short_volume: String,
    pub long_entry: String,
    pub short_entry: String,
    pub exit_target: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub ts: i64,
    pub updated_at: String,
    pub interval_secs: u64,
    pub cycles: u64,
    pub entries: u64,
    pub exits: u64,
    pub in_market: bool,
    pub entry_halted: bool,
    pub position: Option<StatusPosition>,
    pub last_cycle_ms: u64,
}

impl StatusReporter {
    pub fn new(path: impl Into<PathBuf>, interval_secs: u64) -> Self {
        Self {
            path: path.into(),
            interval_secs,
            cycles: 0,
            entries: 0,
            exits: 0,
        }
    }

    pub fn record_entry(&mut self) {
        self.entries += 1;
    }

    pub fn record_exit(&mut self) {
        self.exits += 1;
    }

    pub fn write_snapshot(
        &mut self,
        position: Option<&Position>,
        entry_halted: bool,
        cycle_duration: Duration,
    ) -> std::io::Result<()> {
        self.cycles += 1;
        let now = Utc::now();
        let snapshot = StatusSnapshot {
            ts: now.timestamp(),
            updated_at: now.to_rfc3339(),
            interval_secs: self.interval_secs,
            cycles: self.cycles,
            entries: self.entries,
            exits: self.exits,
            in_market: position.is_some(),
            entry_halted,
            position: position.map(|p| StatusPosition {
                pair: p.pair.to_string(),
                long_venue: p.long.venue.name.clone(),
                short_venue: p.short.venue.name.clone(),
                long_volume: p.long.volume.to_string(),
                short_volume: p.short.volume.to_string(),
                long_entry: p.long.entry.to_string(),
                short_entry: p.short.entry.to_string(),
                exit_target: p.exit_target.to_string(),
            }),
            last_cycle_ms: cycle_duration.as_millis() as u64,
        };
        let payload = serde_json::to_string(&snapshot)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, payload)?;
        fs::rename(tmp_path, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::TradeLeg;
    use crate::testing::{pair, test_venue, MockGateway};
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn read(path: &std::path::Path) -> StatusSnapshot {
        serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap()
    }

    #[test]
    fn snapshot_reflects_flat_and_in_market_states() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status").join("engine.json");
        let mut reporter = StatusReporter::new(&path, 3);

        reporter
            .write_snapshot(None, false, Duration::from_millis(42))
            .unwrap();
        let flat = read(&path);
        assert!(!flat.in_market);
        assert_eq!(flat.cycles, 1);
        assert_eq!(flat.last_cycle_ms, 42);

        let position = Position {
            long: TradeLeg {
                venue: Arc::new(test_venue("alpha", Arc::new(MockGateway::default()))),
                order_id: "L".to_string(),
                volume: dec!(1.5),
                entry: dec!(100),
            },
            short: TradeLeg {
                venue: Arc::new(test_venue("beta", Arc::new(MockGateway::default()))),
                order_id: "S".to_string(),
                volume: dec!(1.4),
                entry: dec!(101.5),
            },
            pair: pair("BTC/USD"),
            exit_target: dec!(0.006),
        };
        reporter.record_entry();
        reporter
            .write_snapshot(Some(&position), true, Duration::from_millis(5))
            .unwrap();
        let open = read(&path);
        assert!(open.in_market);
        assert!(open.entry_halted);
        assert_eq!(open.entries, 1);
        assert_eq!(open.cycles, 2);
        let summary = open.position.unwrap();
        assert_eq!(summary.long_venue, "alpha");
        assert_eq!(summary.exit_target, "0.006");
    }
}
