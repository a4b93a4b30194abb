use serde::{Deserialize, Serialize};

use crate::error::AmlError;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub chain: ChainConfig,
    #[serde(default)]
    pub price: PriceConfig,
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default)]
    pub crawler: CrawlerConfig,
    #[serde(default)]
    pub expansion: ExpansionConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub automation: AutomationConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub sanctions: SanctionsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    /// Absent means the in-memory graph store.
    pub url: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: default_max_connections(),
        }
    }
}

fn default_max_connections() -> u32 {
    10
}

// ============================================================
// Chain / Price Config
// ============================================================

#[derive(Debug, Deserialize, Clone)]
pub struct ChainConfig {
    #[serde(default = "default_chain_id")]
    pub chain_id: u64,
    /// JSON-RPC endpoint used for the monitor's chain head.
    pub rpc_http: Option<String>,
    #[serde(default = "default_etherscan_url")]
    pub etherscan_url: String,
    /// Absent means store-only ingestion.
    pub etherscan_api_key: Option<String>,
    #[serde(default = "default_tx_limit_per_address")]
    pub tx_limit_per_address: usize,
    /// Roughly 24h of Ethereum mainnet blocks.
    #[serde(default = "default_lookback_blocks")]
    pub lookback_blocks: u64,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            chain_id: default_chain_id(),
            rpc_http: None,
            etherscan_url: default_etherscan_url(),
            etherscan_api_key: None,
            tx_limit_per_address: default_tx_limit_per_address(),
            lookback_blocks: default_lookback_blocks(),
        }
    }
}

fn default_chain_id() -> u64 {
    1
}

fn default_etherscan_url() -> String {
    "https://api.etherscan.io/v2/api".to_string()
}

fn default_tx_limit_per_address() -> usize {
    1000
}

fn default_lookback_blocks() -> u64 {
    6500
}

#[derive(Debug, Deserialize, Clone)]
pub struct PriceConfig {
    #[serde(default = "default_fixed_usd")]
    pub fixed_usd: f64,
    pub coingecko_url: Option<String>,
    #[serde(default = "default_price_refresh_secs")]
    pub refresh_secs: u64,
}

impl Default for PriceConfig {
    fn default() -> Self {
        Self {
            fixed_usd: default_fixed_usd(),
            coingecko_url: None,
            refresh_secs: default_price_refresh_secs(),
        }
    }
}

fn default_fixed_usd() -> f64 {
    2000.0
}

fn default_price_refresh_secs() -> u64 {
    300
}

// ============================================================
// Detection Config
// ============================================================

/// Detector policy constants. Windows are in days/hours/seconds as named,
/// values are in native units.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DetectionConfig {
    pub neighborhood_hops: u32,
    pub neighborhood_edge_limit: usize,
    pub taint_source_limit: usize,

    pub structuring_window_days: i64,
    pub structuring_max_deposit: f64,
    pub structuring_min_count: usize,
    pub structuring_bonus_total: f64,
    pub structuring_bonus: f64,

    pub peel_ratio: f64,

    pub mixer_medium_fan: usize,
    pub mixer_high_fan: usize,

    pub taint_max_hops: u32,
    pub taint_min_source_score: f64,

    pub circularity_min_len: usize,
    pub circularity_max_len: usize,
    pub circularity_path_cap: usize,

    pub velocity_window_hours: i64,
    pub velocity_min_count: usize,
    pub velocity_min_rate: f64,

    pub dormant_min_lifetime_days: i64,
    pub dormant_recent_days: i64,
    pub dormant_min_value: f64,

    pub round_window_days: i64,
    pub round_min_count: usize,
    pub round_amounts: Vec<f64>,

    pub timing_window_days: i64,
    pub timing_min_count: usize,
    pub timing_max_variance: f64,
    pub timing_max_mean_secs: f64,

    pub wash_window_days: i64,
    pub wash_min_transfers: u64,
    pub wash_max_value_diff: f64,

    pub layering_min_depth: usize,
    pub layering_max_depth: usize,
    pub layering_window_hours: i64,
    pub layering_path_cap: usize,

    pub rug_outflow_ratio: f64,
    pub rug_single_withdrawal_ratio: f64,
    pub rug_silence_days: i64,

    pub ponzi_min_depositors: usize,
    pub ponzi_max_receiver_ratio: f64,

    pub phishing_min_victims: usize,
    pub phishing_max_avg_amount: f64,
    pub phishing_max_destinations: usize,
    pub phishing_withdraw_within_secs: i64,

    pub mev_min_tx: usize,
    pub mev_multi_block_ratio: f64,
    pub mev_max_mean_gap_secs: f64,

    pub dust_threshold: f64,
    pub dust_min_count: usize,

    pub flash_min_tx_per_block: usize,
    pub flash_min_block_volume: f64,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            neighborhood_hops: 5,
            neighborhood_edge_limit: 5000,
            taint_source_limit: 500,

            structuring_window_days: 3,
            structuring_max_deposit: 0.5,
            structuring_min_count: 5,
            structuring_bonus_total: 1.0,
            structuring_bonus: 10.0,

            peel_ratio: 0.7,

            mixer_medium_fan: 10,
            mixer_high_fan: 20,

            taint_max_hops: 3,
            taint_min_source_score: 50.0,

            circularity_min_len: 2,
            circularity_max_len: 4,
            circularity_path_cap: 10_000,

            velocity_window_hours: 24,
            velocity_min_count: 10,
            velocity_min_rate: 10.0,

            dormant_min_lifetime_days: 180,
            dormant_recent_days: 30,
            dormant_min_value: 1.0,

            round_window_days: 90,
            round_min_count: 5,
            round_amounts: vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 20.0, 50.0, 100.0],

            timing_window_days: 30,
            timing_min_count: 10,
            timing_max_variance: 3600.0 * 3600.0,
            timing_max_mean_secs: 24.0 * 3600.0,

            wash_window_days: 90,
            wash_min_transfers: 3,
            wash_max_value_diff: 0.1,

            layering_min_depth: 3,
            layering_max_depth: 5,
            layering_window_hours: 24,
            layering_path_cap: 1000,

            rug_outflow_ratio: 0.8,
            rug_single_withdrawal_ratio: 0.7,
            rug_silence_days: 7,

            ponzi_min_depositors: 50,
            ponzi_max_receiver_ratio: 0.3,

            phishing_min_victims: 20,
            phishing_max_avg_amount: 0.5,
            phishing_max_destinations: 5,
            phishing_withdraw_within_secs: 3600,

            mev_min_tx: 1000,
            mev_multi_block_ratio: 0.3,
            mev_max_mean_gap_secs: 60.0,

            dust_threshold: 0.0001,
            dust_min_count: 5,

            flash_min_tx_per_block: 5,
            flash_min_block_volume: 100.0,
        }
    }
}

// ============================================================
// Scoring Config
// ============================================================

/// Saturation bounds and weights of the composite risk score.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ScoringConfig {
    pub pagerank_bound: f64,
    pub pagerank_weight: f64,
    pub degree_bound: f64,
    pub degree_weight: f64,
    pub in_degree_bound: f64,
    pub in_degree_weight: f64,
    pub out_degree_bound: f64,
    pub out_degree_weight: f64,
    pub triangle_bound: f64,
    pub triangle_weight: f64,
    pub points_per_alert: f64,
    pub alert_cap: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            pagerank_bound: 0.01,
            pagerank_weight: 30.0,
            degree_bound: 100.0,
            degree_weight: 15.0,
            in_degree_bound: 60.0,
            in_degree_weight: 10.0,
            out_degree_bound: 60.0,
            out_degree_weight: 10.0,
            triangle_bound: 50.0,
            triangle_weight: 15.0,
            points_per_alert: 10.0,
            alert_cap: 40.0,
        }
    }
}

// ============================================================
// Controller Config
// ============================================================

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CrawlerConfig {
    pub max_depth: u32,
    pub min_value: f64,
    pub min_risk_score_to_expand: f64,
    pub suspicion_floor: f64,
    pub max_addresses: usize,
    pub request_delay_ms: u64,
    pub counterparty_limit: usize,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            max_depth: 3,
            min_value: 1.0,
            min_risk_score_to_expand: 60.0,
            suspicion_floor: 40.0,
            max_addresses: 5000,
            request_delay_ms: 200,
            counterparty_limit: 50,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ExpansionConfig {
    pub trigger_score: f64,
    pub expansion_depth: u32,
    pub min_value: f64,
    pub max_addresses_per_expansion: usize,
    pub tx_limit: usize,
    /// Recompute structural features before each full score.
    pub refresh_features: bool,
}

impl Default for ExpansionConfig {
    fn default() -> Self {
        Self {
            trigger_score: 70.0,
            expansion_depth: 2,
            min_value: 0.5,
            max_addresses_per_expansion: 50,
            tx_limit: 500,
            refresh_features: false,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct MonitorConfig {
    pub min_value_usd: f64,
    pub check_interval_secs: u64,
    pub max_transactions_per_check: usize,
    pub error_backoff_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            min_value_usd: 100_000.0,
            check_interval_secs: 3600,
            max_transactions_per_check: 100,
            error_backoff_secs: 60,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AutomationConfig {
    #[serde(default = "default_bulk_workers")]
    pub bulk_workers: usize,
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            bulk_workers: default_bulk_workers(),
        }
    }
}

fn default_bulk_workers() -> usize {
    10
}

// ============================================================
// API Config
// ============================================================

#[derive(Debug, Deserialize, Clone)]
pub struct ApiConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_api_port")]
    pub port: u16,
    #[serde(default = "default_api_host")]
    pub host: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_api_port(),
            host: default_api_host(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_api_port() -> u16 {
    3000
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

/// Longest sleep a monitor loop may take between checks.
pub const MAX_MONITOR_INTERVAL_SECS: u64 = 7 * 24 * 3600;

fn non_negative(section: &str, fields: &[(&str, f64)]) -> Result<(), String> {
    for (name, value) in fields {
        // NaN fails this check too
        if !(*value >= 0.0) {
            return Err(format!("{}.{} must not be negative", section, name));
        }
    }
    Ok(())
}

impl CrawlerConfig {
    pub fn validate(&self) -> Result<(), String> {
        non_negative(
            "crawler",
            &[
                ("min_value", self.min_value),
                ("min_risk_score_to_expand", self.min_risk_score_to_expand),
                ("suspicion_floor", self.suspicion_floor),
            ],
        )?;
        if self.max_addresses == 0 {
            return Err("crawler.max_addresses must be > 0".into());
        }
        Ok(())
    }
}

impl ExpansionConfig {
    pub fn validate(&self) -> Result<(), String> {
        non_negative(
            "expansion",
            &[
                ("trigger_score", self.trigger_score),
                ("min_value", self.min_value),
            ],
        )?;
        if self.max_addresses_per_expansion == 0 {
            return Err("expansion.max_addresses_per_expansion must be > 0".into());
        }
        Ok(())
    }
}

impl MonitorConfig {
    pub fn validate(&self) -> Result<(), String> {
        non_negative("monitor", &[("min_value_usd", self.min_value_usd)])?;
        for (name, secs) in [
            ("check_interval_secs", self.check_interval_secs),
            ("error_backoff_secs", self.error_backoff_secs),
        ] {
            if secs == 0 || secs > MAX_MONITOR_INTERVAL_SECS {
                return Err(format!(
                    "monitor.{} must be between 1 and {}",
                    name, MAX_MONITOR_INTERVAL_SECS
                ));
            }
        }
        if self.max_transactions_per_check == 0 {
            return Err("monitor.max_transactions_per_check must be > 0".into());
        }
        Ok(())
    }
}

/// Sanctions list seeded as `SANCTION` alerts at startup.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct SanctionsConfig {
    /// CSV with columns: sdn_id, entity_name, program, address
    pub csv_path: Option<String>,
}

impl Config {
    pub fn load(path: &str) -> eyre::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| eyre::eyre!("Failed to read config file '{}': {}", path, e))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| eyre::eyre!("Failed to parse config file '{}': {}", path, e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AmlError> {
        if self.database.max_connections == 0 {
            return Err(AmlError::Config("database.max_connections must be > 0".into()));
        }
        if self.automation.bulk_workers == 0 {
            return Err(AmlError::Config("automation.bulk_workers must be > 0".into()));
        }

        let s = &self.scoring;
        for (name, bound) in [
            ("pagerank_bound", s.pagerank_bound),
            ("degree_bound", s.degree_bound),
            ("in_degree_bound", s.in_degree_bound),
            ("out_degree_bound", s.out_degree_bound),
            ("triangle_bound", s.triangle_bound),
        ] {
            if bound <= 0.0 {
                return Err(AmlError::Config(format!("scoring.{} must be > 0", name)));
            }
        }

        let d = &self.detection;
        for (name, value) in [
            ("structuring_max_deposit", d.structuring_max_deposit),
            ("peel_ratio", d.peel_ratio),
            ("taint_min_source_score", d.taint_min_source_score),
            ("velocity_min_rate", d.velocity_min_rate),
            ("dormant_min_value", d.dormant_min_value),
            ("timing_max_variance", d.timing_max_variance),
            ("wash_max_value_diff", d.wash_max_value_diff),
            ("dust_threshold", d.dust_threshold),
            ("flash_min_block_volume", d.flash_min_block_volume),
        ] {
            if value < 0.0 {
                return Err(AmlError::Config(format!("detection.{} must not be negative", name)));
            }
        }
        if d.circularity_min_len < 2 || d.circularity_min_len > d.circularity_max_len {
            return Err(AmlError::Config(
                "detection.circularity_min_len must be >= 2 and <= circularity_max_len".into(),
            ));
        }
        if d.layering_min_depth > d.layering_max_depth {
            return Err(AmlError::Config(
                "detection.layering_min_depth must be <= layering_max_depth".into(),
            ));
        }

        self.crawler.validate().map_err(AmlError::Config)?;
        self.expansion.validate().map_err(AmlError::Config)?;
        self.monitor.validate().map_err(AmlError::Config)?;
        if !(self.price.fixed_usd >= 0.0) {
            return Err(AmlError::Config("price.fixed_usd must not be negative".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml_str = r#"
[database]
url = "postgres://localhost/test"
max_connections = 5

[chain]
chain_id = 1
rpc_http = "http://localhost:8545"

[crawler]
max_depth = 1

[detection]
structuring_min_count = 6
"#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.database.url.as_deref(), Some("postgres://localhost/test"));
        assert_eq!(config.database.max_connections, 5);
        assert_eq!(config.chain.lookback_blocks, 6500); // default
        assert_eq!(config.crawler.max_depth, 1);
        assert_eq!(config.crawler.max_addresses, 5000); // default
        assert_eq!(config.detection.structuring_min_count, 6);
        assert_eq!(config.detection.peel_ratio, 0.7); // default
        assert_eq!(config.expansion.max_addresses_per_expansion, 50);
        assert!(config.api.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.database.url.is_none());
        assert_eq!(config.automation.bulk_workers, 10);
        assert_eq!(config.monitor.min_value_usd, 100_000.0);
        assert_eq!(config.scoring.pagerank_bound, 0.01);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_zero_workers() {
        let mut config = Config::default();
        config.automation.bulk_workers = 0;
        assert!(matches!(config.validate(), Err(AmlError::Config(_))));
    }

    #[test]
    fn test_validate_bad_scoring_bound() {
        let mut config = Config::default();
        config.scoring.degree_bound = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_negative_threshold() {
        let mut config = Config::default();
        config.crawler.min_value = -1.0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.detection.dust_threshold = -0.1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_monitor_interval_bounds() {
        let mut config = Config::default();
        config.monitor.check_interval_secs = 0;
        assert!(config.validate().is_err());

        let mut monitor = MonitorConfig::default();
        monitor.error_backoff_secs = u64::MAX;
        assert!(monitor.validate().is_err());
        monitor.error_backoff_secs = MAX_MONITOR_INTERVAL_SECS;
        assert!(monitor.validate().is_ok());
    }
}
