use anyhow::{anyhow, Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::model::CurrencyPair;
use crate::venue::Venue;

/// One side of the hedged position.
#[derive(Clone)]
pub struct TradeLeg {
    pub venue: Arc<Venue>,
    pub order_id: String,
    pub volume: Decimal,
    pub entry: Decimal,
}

impl PartialEq for TradeLeg {
    fn eq(&self, other: &Self) -> bool {
        self.venue.name == other.venue.name
            && self.order_id == other.order_id
            && self.volume == other.volume
            && self.entry == other.entry
    }
}

impl fmt::Debug for TradeLeg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TradeLeg")
            .field("venue", &self.venue.name)
            .field("order_id", &self.order_id)
            .field("volume", &self.volume)
            .field("entry", &self.entry)
            .finish()
    }
}

/// The single open arbitrage position.
#[derive(Debug, Clone, PartialEq)]
pub struct Position {
    pub long: TradeLeg,
    pub short: TradeLeg,
    pub pair: CurrencyPair,
    pub exit_target: Decimal,
}

impl Position {
    pub fn matches(&self, long: &Venue, short: &Venue, pair: &CurrencyPair) -> bool {
        self.long.venue.name == long.name
            && self.short.venue.name == short.name
            && &self.pair == pair
    }

    pub fn combination_key(&self) -> String {
        format!(
            "{}:{}:{}",
            self.long.venue.name, self.short.venue.name, self.pair
        )
    }

    pub fn to_record(&self) -> PositionRecord {
        PositionRecord {
            long_trade: TradeRecord::from_leg(&self.long),
            short_trade: TradeRecord::from_leg(&self.short),
            currency_pair: self.pair.clone(),
            exit_target: self.exit_target,
        }
    }

    /// Rebuilds venue references by name against the configured venues.
    pub fn from_record(record: PositionRecord, venues: &[Arc<Venue>]) -> Result<Self> {
        let lookup = |name: &str| -> Result<Arc<Venue>> {
            venues
                .iter()
                .find(|v| v.name == name)
                .cloned()
                .ok_or_else(|| anyhow!("persisted position references unknown venue {}", name))
        };
        Ok(Position {
            long: record.long_trade.into_leg(lookup(&record.long_trade.exchange)?),
            short: record
                .short_trade
                .into_leg(lookup(&record.short_trade.exchange)?),
            pair: record.currency_pair,
            exit_target: record.exit_target,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeRecord {
    pub exchange: String,
    #[serde(default)]
    pub order_id: String,
    pub volume: Decimal,
    pub entry: Decimal,
}

impl TradeRecord {
    fn from_leg(leg: &TradeLeg) -> Self {
        Self {
            exchange: leg.venue.name.clone(),
            order_id: leg.order_id.clone(),
            volume: leg.volume,
            entry: leg.entry,
        }
    }

    fn into_leg(&self, venue: Arc<Venue>) -> TradeLeg {
        TradeLeg {
            venue,
            order_id: self.order_id.clone(),
            volume: self.volume,
            entry: self.entry,
        }
    }
}

/// Durable form of [`Position`]. Unknown fields are ignored on read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionRecord {
    pub long_trade: TradeRecord,
    pub short_trade: TradeRecord,
    pub currency_pair: CurrencyPair,
    pub exit_target: Decimal,
}

/// Singleton position file, rewritten atomically on every change.
#[derive(Debug, Clone)]
pub struct PositionStore {
    path: PathBuf,
}

impl PositionStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Option<PositionRecord>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to read {}", self.path.display()))
            }
        };
        if content.trim().is_empty() {
            return Ok(None);
        }
        let record = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse {}", self.path.display()))?;
        Ok(Some(record))
    }

    /// Writes `None` as a removed file.
    pub fn save(&self, position: Option<&Position>) -> Result<()> {
        let Some(position) = position else {
            return match fs::remove_file(&self.path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e)
                    .with_context(|| format!("failed to remove {}", self.path.display())),
            };
        };
        let json = serde_json::to_string_pretty(&position.to_record())?;
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        {
            let mut file = fs::File::create(&tmp)
                .with_context(|| format!("failed to create {}", tmp.display()))?;
            file.write_all(json.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to move {} into place", tmp.display()))?;
        Ok(())
    }
}
