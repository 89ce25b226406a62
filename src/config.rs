use anyhow::{anyhow, bail, Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::collections::HashSet;
use std::env;
use std::fs::File;
use std::path::Path;

use crate::model::CurrencyPair;

const DEFAULT_ENTRY_SPREAD: Decimal = dec!(0.008);
const DEFAULT_EXIT_TARGET: Decimal = dec!(0.005);
const DEFAULT_INTERVAL_SECS: u64 = 3;
const DEFAULT_SUMMARY_INTERVAL_SECS: u64 = 6 * 60 * 60;
const DEFAULT_FILL_POLL_INTERVAL_SECS: u64 = 3;
const DEFAULT_FILL_TIMEOUT_SECS: u64 = 600;
const DEFAULT_POSITION_FILE: &str = "arbitrage_position.json";
const DEFAULT_HOME_CURRENCY: &str = "USD";

#[derive(Debug, Deserialize, Clone)]
#[serde(untagged)]
enum StringOrVec {
    String(String),
    Vec(Vec<String>),
}

impl StringOrVec {
    fn into_vec(self) -> Vec<String> {
        match self {
            StringOrVec::String(value) => split_list(&value),
            StringOrVec::Vec(values) => values
                .into_iter()
                .map(|item| item.trim().to_string())
                .filter(|item| !item.is_empty())
                .collect(),
        }
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
        .collect()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
struct ArbitrageYaml {
    entry_spread: Option<Decimal>,
    exit_target: Option<Decimal>,
    fixed_exposure: Option<Decimal>,
    trade_blacklist: Option<StringOrVec>,
    interval_secs: Option<u64>,
    summary_interval_secs: Option<u64>,
    fill_poll_interval_secs: Option<u64>,
    fill_timeout_secs: Option<u64>,
    position_file: Option<String>,
    status_file: Option<String>,
    #[serde(default)]
    venues: Vec<VenueYaml>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
struct VenueYaml {
    name: String,
    home_currency: Option<String>,
    trading_pairs: Option<StringOrVec>,
    margin: Option<bool>,
    margin_exclude: Option<StringOrVec>,
    fee: Option<Decimal>,
    replay_file: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VenueConfig {
    pub name: String,
    pub home_currency: String,
    pub trading_pairs: Vec<CurrencyPair>,
    pub margin: bool,
    pub margin_exclude: Vec<CurrencyPair>,
    /// Fallback maker fee when the venue publishes none.
    pub fee: Option<Decimal>,
    pub replay_file: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArbitrageConfig {
    pub entry_spread: Decimal,
    pub exit_target: Decimal,
    pub fixed_exposure: Option<Decimal>,
    /// Entries of the form `long:short:BASE/COUNTER`.
    pub trade_blacklist: Vec<String>,
    pub interval_secs: u64,
    pub summary_interval_secs: u64,
    pub fill_poll_interval_secs: u64,
    pub fill_timeout_secs: u64,
    pub position_file: String,
    pub status_file: Option<String>,
    pub venues: Vec<VenueConfig>,
}

impl ArbitrageConfig {
    pub fn from_env_or_yaml() -> Result<Self> {
        let path = env::var("ARBITRAGE_CONFIG_PATH")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| anyhow!("ARBITRAGE_CONFIG_PATH must point to a YAML config"))?;
        let mut cfg = Self::from_yaml_path(path)?;
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Loads a file without consulting the environment.
    pub fn from_yaml_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        let file = File::open(path_ref)
            .with_context(|| format!("failed to open arbitrage config {}", path_ref.display()))?;
        let yaml: ArbitrageYaml = serde_yaml::from_reader(file)
            .with_context(|| format!("failed to parse arbitrage config {}", path_ref.display()))?;
        Self::from_yaml(yaml)
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let yaml: ArbitrageYaml =
            serde_yaml::from_str(raw).context("failed to parse arbitrage config")?;
        Self::from_yaml(yaml)
    }

    fn from_yaml(yaml: ArbitrageYaml) -> Result<Self> {
        let venues = yaml
            .venues
            .into_iter()
            .map(VenueConfig::from_yaml)
            .collect::<Result<Vec<_>>>()?;

        Ok(ArbitrageConfig {
            entry_spread: yaml.entry_spread.unwrap_or(DEFAULT_ENTRY_SPREAD),
            exit_target: yaml.exit_target.unwrap_or(DEFAULT_EXIT_TARGET),
            fixed_exposure: yaml.fixed_exposure,
            trade_blacklist: yaml
                .trade_blacklist
                .map(StringOrVec::into_vec)
                .unwrap_or_default(),
            interval_secs: yaml.interval_secs.unwrap_or(DEFAULT_INTERVAL_SECS),
            summary_interval_secs: yaml
                .summary_interval_secs
                .unwrap_or(DEFAULT_SUMMARY_INTERVAL_SECS),
            fill_poll_interval_secs: yaml
                .fill_poll_interval_secs
                .unwrap_or(DEFAULT_FILL_POLL_INTERVAL_SECS),
            fill_timeout_secs: yaml.fill_timeout_secs.unwrap_or(DEFAULT_FILL_TIMEOUT_SECS),
            position_file: yaml
                .position_file
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_POSITION_FILE.to_string()),
            status_file: yaml.status_file.filter(|v| !v.trim().is_empty()),
            venues,
        })
    }

    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| env::var(key).ok())
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(value) = get("ENTRY_SPREAD") {
            self.entry_spread = parse_env("ENTRY_SPREAD", &value)?;
        }
        if let Some(value) = get("EXIT_TARGET") {
            self.exit_target = parse_env("EXIT_TARGET", &value)?;
        }
        if let Some(value) = get("FIXED_EXPOSURE") {
            self.fixed_exposure = Some(parse_env("FIXED_EXPOSURE", &value)?);
        }
        if let Some(value) = get("INTERVAL_SECS") {
            self.interval_secs = parse_env("INTERVAL_SECS", &value)?;
        }
        if let Some(value) = get("SUMMARY_INTERVAL_SECS") {
            self.summary_interval_secs = parse_env("SUMMARY_INTERVAL_SECS", &value)?;
        }
        if let Some(value) = get("FILL_POLL_INTERVAL_SECS") {
            self.fill_poll_interval_secs = parse_env("FILL_POLL_INTERVAL_SECS", &value)?;
        }
        if let Some(value) = get("FILL_TIMEOUT_SECS") {
            self.fill_timeout_secs = parse_env("FILL_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = get("POSITION_FILE") {
            self.position_file = value;
        }
        if let Some(value) = get("STATUS_FILE") {
            self.status_file = Some(value);
        }
        if let Some(value) = get("TRADE_BLACKLIST") {
            self.trade_blacklist = split_list(&value);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.venues.len() < 2 {
            bail!(
                "at least two venues are required, {} configured",
                self.venues.len()
            );
        }
        let mut names = HashSet::new();
        for venue in &self.venues {
            if venue.name.trim().is_empty() {
                bail!("venue name must not be empty");
            }
            if !names.insert(venue.name.as_str()) {
                bail!("duplicate venue name {}", venue.name);
            }
            if venue.trading_pairs.is_empty() {
                bail!("venue {} has no trading_pairs", venue.name);
            }
            if let Some(fee) = venue.fee {
                if fee < Decimal::ZERO {
                    bail!("venue {} has a negative fee {}", venue.name, fee);
                }
            }
        }
        if self.interval_secs == 0
            || self.summary_interval_secs == 0
            || self.fill_poll_interval_secs == 0
            || self.fill_timeout_secs == 0
        {
            bail!("intervals and timeouts must be positive");
        }
        if self.entry_spread < Decimal::ZERO {
            bail!("entry_spread must not be negative: {}", self.entry_spread);
        }
        if self.exit_target < Decimal::ZERO {
            bail!("exit_target must not be negative: {}", self.exit_target);
        }
        if let Some(exposure) = self.fixed_exposure {
            if exposure <= Decimal::ZERO {
                bail!("fixed_exposure must be positive: {}", exposure);
            }
        }
        for entry in &self.trade_blacklist {
            parse_blacklist_entry(entry)?;
        }
        Ok(())
    }

    /// Canonical `long:short:BASE/COUNTER` keys.
    pub fn blacklist_keys(&self) -> Result<HashSet<String>> {
        self.trade_blacklist
            .iter()
            .map(|entry| parse_blacklist_entry(entry))
            .collect()
    }
}

impl VenueConfig {
    fn from_yaml(yaml: VenueYaml) -> Result<Self> {
        let name = yaml.name.trim().to_string();
        let trading_pairs = parse_pairs(yaml.trading_pairs)
            .with_context(|| format!("invalid trading_pairs for venue {}", name))?;
        let margin_exclude = parse_pairs(yaml.margin_exclude)
            .with_context(|| format!("invalid margin_exclude for venue {}", name))?;
        Ok(VenueConfig {
            home_currency: yaml
                .home_currency
                .map(|c| c.trim().to_ascii_uppercase())
                .filter(|c| !c.is_empty())
                .unwrap_or_else(|| DEFAULT_HOME_CURRENCY.to_string()),
            trading_pairs,
            margin: yaml.margin.unwrap_or(false),
            margin_exclude,
            fee: yaml.fee,
            replay_file: yaml.replay_file.filter(|v| !v.trim().is_empty()),
            name,
        })
    }
}

fn parse_pairs(raw: Option<StringOrVec>) -> Result<Vec<CurrencyPair>> {
    raw.map(StringOrVec::into_vec)
        .unwrap_or_default()
        .iter()
        .map(|p| p.parse())
        .collect()
}

fn parse_blacklist_entry(entry: &str) -> Result<String> {
    let parts: Vec<&str> = entry.trim().splitn(3, ':').collect();
    match parts.as_slice() {
        [long, short, pair] if !long.is_empty() && !short.is_empty() => {
            let pair: CurrencyPair = pair
                .parse()
                .with_context(|| format!("invalid blacklist entry {}", entry))?;
            Ok(format!("{}:{}:{}", long, short, pair))
        }
        _ => Err(anyhow!(
            "invalid blacklist entry {} (expected long:short:BASE/COUNTER)",
            entry
        )),
    }
}

fn parse_env<T>(key: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| anyhow!("invalid {}={}: {}", key, value, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    const SAMPLE: &str = r#"
entry_spread: "0.01"
exit_target: "0.005"
trade_blacklist: "alpha:beta:ETH/USD, beta:alpha:btc/usd"
interval_secs: 5
venues:
  - name: alpha
    trading_pairs: [BTC/USD, ETH/USD]
    margin: true
    fee: "0.001"
  - name: beta
    home_currency: usdt
    trading_pairs: "BTC/USD,ETH/USD"
    margin_exclude: [ETH/USD]
"#;

    #[test]
    fn yaml_file_is_loaded_with_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let cfg = ArbitrageConfig::from_yaml_path(file.path()).unwrap();

        assert_eq!(cfg.entry_spread, dec!(0.01));
        assert_eq!(cfg.exit_target, dec!(0.005));
        assert_eq!(cfg.fixed_exposure, None);
        assert_eq!(cfg.interval_secs, 5);
        assert_eq!(cfg.summary_interval_secs, DEFAULT_SUMMARY_INTERVAL_SECS);
        assert_eq!(cfg.fill_poll_interval_secs, 3);
        assert_eq!(cfg.fill_timeout_secs, 600);
        assert_eq!(cfg.position_file, DEFAULT_POSITION_FILE);
        assert_eq!(cfg.venues.len(), 2);

        let alpha = &cfg.venues[0];
        assert_eq!(alpha.home_currency, "USD");
        assert!(alpha.margin);
        assert_eq!(alpha.fee, Some(dec!(0.001)));

        let beta = &cfg.venues[1];
        assert_eq!(beta.home_currency, "USDT");
        assert!(!beta.margin);
        assert_eq!(beta.trading_pairs.len(), 2);
        assert_eq!(beta.margin_exclude, vec![CurrencyPair::new("ETH", "USD")]);
        cfg.validate().unwrap();
    }

    #[test]
    fn blacklist_keys_are_canonical() {
        let cfg = ArbitrageConfig::from_yaml_str(SAMPLE).unwrap();
        let keys = cfg.blacklist_keys().unwrap();
        assert!(keys.contains("alpha:beta:ETH/USD"));
        assert!(keys.contains("beta:alpha:BTC/USD"));
    }

    #[test]
    fn overrides_replace_yaml_values() {
        let mut cfg = ArbitrageConfig::from_yaml_str(SAMPLE).unwrap();
        let env = HashMap::from([
            ("ENTRY_SPREAD", "0.02"),
            ("FIXED_EXPOSURE", "250"),
            ("FILL_TIMEOUT_SECS", "30"),
            ("TRADE_BLACKLIST", ""),
            ("STATUS_FILE", "/tmp/status.json"),
        ]);
        cfg.apply_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(cfg.entry_spread, dec!(0.02));
        assert_eq!(cfg.fixed_exposure, Some(dec!(250)));
        assert_eq!(cfg.fill_timeout_secs, 30);
        assert_eq!(cfg.trade_blacklist.len(), 2);
        assert_eq!(cfg.status_file.as_deref(), Some("/tmp/status.json"));
    }

    #[test]
    fn malformed_override_is_an_error() {
        let mut cfg = ArbitrageConfig::from_yaml_str(SAMPLE).unwrap();
        let err = cfg
            .apply_overrides(|key| (key == "INTERVAL_SECS").then(|| "soon".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("INTERVAL_SECS"));
    }

    #[test]
    fn validation_rejects_bad_configs() {
        let base = ArbitrageConfig::from_yaml_str(SAMPLE).unwrap();

        let mut single = base.clone();
        single.venues.truncate(1);
        assert!(single.validate().is_err());

        let mut duplicate = base.clone();
        duplicate.venues[1].name = "alpha".to_string();
        assert!(duplicate.validate().is_err());

        let mut zero_interval = base.clone();
        zero_interval.interval_secs = 0;
        assert!(zero_interval.validate().is_err());

        let mut negative = base.clone();
        negative.entry_spread = dec!(-0.01);
        assert!(negative.validate().is_err());

        let mut blacklist = base;
        blacklist.trade_blacklist = vec!["alpha-beta-BTC/USD".to_string()];
        assert!(blacklist.validate().is_err());
    }

    #[test]
    fn malformed_pair_fails_to_load() {
        let raw = "venues:\n  - name: alpha\n    trading_pairs: [BTCUSD]\n";
        let err = ArbitrageConfig::from_yaml_str(raw).unwrap_err();
        assert!(format!("{:#}", err).contains("alpha"));
    }
}
