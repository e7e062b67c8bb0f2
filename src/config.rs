//! Service configuration
//!
//! Loaded from a JSON file (`SITELINE_CONFIG` or the platform config dir)
//! with secrets and deployment settings overridable from the environment.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub cache: CacheConfig,
    pub backfill: BackfillConfig,
    /// Deal pipeline connection; the pipeline family is disabled when absent
    pub pipeline: Option<PipelineConfig>,
    /// Accounting connection; the financial family is disabled when absent
    pub financial: Option<FinancialConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// Requests running longer than this are abandoned and their work cancelled
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8787".to_string(),
            request_timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite file holding snapshots and OAuth tokens
    pub path: Option<PathBuf>,
}

impl DatabaseConfig {
    pub fn resolved_path(&self) -> PathBuf {
        self.path.clone().unwrap_or_else(crate::db::default_db_path)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Snapshots younger than this are served without external calls
    pub ttl_hours: i64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { ttl_hours: 24 }
    }
}

impl CacheConfig {
    /// Freshness window, or `None` when `ttl_hours` is not a usable positive span
    pub fn ttl(&self) -> Option<chrono::Duration> {
        chrono::Duration::try_hours(self.ttl_hours).filter(|ttl| *ttl > chrono::Duration::zero())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackfillConfig {
    /// Share of the live value assigned to the oldest synthesized bucket
    pub baseline_fraction: f64,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            baseline_fraction: 0.3,
        }
    }
}

/// A pipeline stage tracked as a stock metric
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageMetric {
    pub key: String,
    pub label: String,
    pub stage_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub base_url: String,
    pub access_token: String,
    /// Stage id of won deals, summed by close date as the `closed-won` flow
    pub closed_won_stage: String,
    pub stages: Vec<StageMetric>,
    /// Deals per search page
    pub page_limit: u32,
    /// Search pages fetched before giving up on a query
    pub max_pages: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.hubapi.com".to_string(),
            access_token: String::new(),
            closed_won_stage: "closedwon".to_string(),
            stages: vec![StageMetric {
                key: "advanced-negotiations".to_string(),
                label: "Advanced Negotiations".to_string(),
                stage_id: "contractsent".to_string(),
            }],
            page_limit: 100,
            max_pages: 20,
        }
    }
}

/// Maps profit and loss report rows onto a metric.
///
/// Matching is case-insensitive substring matching. An empty `accounts` list
/// selects the section's total row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRule {
    pub metric: String,
    pub label: String,
    #[serde(default)]
    pub section: Option<String>,
    #[serde(default)]
    pub accounts: Vec<String>,
}

impl AccountRule {
    fn new(metric: &str, label: &str, section: Option<&str>, accounts: &[&str]) -> Self {
        Self {
            metric: metric.to_string(),
            label: label.to_string(),
            section: section.map(str::to_string),
            accounts: accounts.iter().map(|a| a.to_string()).collect(),
        }
    }
}

/// Default classification of a construction company's P&L
pub fn default_account_rules() -> Vec<AccountRule> {
    vec![
        AccountRule::new("revenue", "Revenue", Some("income"), &[]),
        AccountRule::new("cost-of-goods", "Cost of Goods Sold", Some("cost of sales"), &[]),
        AccountRule::new("materials", "Materials", Some("cost of sales"), &["material"]),
        AccountRule::new(
            "subcontracted-labor",
            "Subcontracted Labor",
            Some("cost of sales"),
            &["subcontract"],
        ),
        AccountRule::new("net-profit", "Net Profit", None, &["net profit"]),
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FinancialConfig {
    pub base_url: String,
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub tenant_id: String,
    /// Minimum spacing between report calls; the quota is per credential
    pub min_call_interval_ms: u64,
    /// Refresh the access token when it expires within this many seconds
    pub refresh_margin_secs: i64,
    pub account_rules: Vec<AccountRule>,
}

/// External quota on report calls per credential
pub const MIN_REPORT_INTERVAL_MS: u64 = 1100;

impl FinancialConfig {
    /// Token refresh margin, or `None` when negative or out of range
    pub fn refresh_margin(&self) -> Option<chrono::Duration> {
        chrono::Duration::try_seconds(self.refresh_margin_secs)
            .filter(|margin| *margin >= chrono::Duration::zero())
    }
}

impl Default for FinancialConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.xero.com/api.xro/2.0".to_string(),
            token_url: "https://identity.xero.com/connect/token".to_string(),
            client_id: String::new(),
            client_secret: String::new(),
            tenant_id: String::new(),
            min_call_interval_ms: MIN_REPORT_INTERVAL_MS,
            refresh_margin_secs: 300,
            account_rules: default_account_rules(),
        }
    }
}

impl AppConfig {
    /// Load from `SITELINE_CONFIG` or the default location, then apply env overrides
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var_os("SITELINE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(default_config_path);

        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else {
            tracing::info!("No config file at {:?}, using defaults", path);
            Self::default()
        };

        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Read a config file without env overrides
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Apply environment overrides through a lookup function
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(addr) = lookup("SITELINE_BIND_ADDR") {
            self.server.bind_addr = addr;
        }
        if let Some(path) = lookup("SITELINE_DB_PATH") {
            self.database.path = Some(PathBuf::from(path));
        }
        if let Some(token) = lookup("SITELINE_PIPELINE_TOKEN") {
            self.pipeline.get_or_insert_with(PipelineConfig::default).access_token = token;
        }

        let client_id = lookup("SITELINE_FINANCIAL_CLIENT_ID");
        let client_secret = lookup("SITELINE_FINANCIAL_CLIENT_SECRET");
        let tenant_id = lookup("SITELINE_FINANCIAL_TENANT_ID");
        if client_id.is_some() || client_secret.is_some() || tenant_id.is_some() {
            let financial = self.financial.get_or_insert_with(FinancialConfig::default);
            if let Some(v) = client_id {
                financial.client_id = v;
            }
            if let Some(v) = client_secret {
                financial.client_secret = v;
            }
            if let Some(v) = tenant_id {
                financial.tenant_id = v;
            }
        }
    }

    /// Reject values the aggregator cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache.ttl().is_none() {
            return Err(ConfigError::Invalid(format!(
                "cache.ttl_hours must be a positive number of hours, got {}",
                self.cache.ttl_hours
            )));
        }
        if !(0.0..=1.0).contains(&self.backfill.baseline_fraction) {
            return Err(ConfigError::Invalid(
                "backfill.baseline_fraction must be between 0 and 1".into(),
            ));
        }
        if let Some(pipeline) = &self.pipeline {
            if pipeline.page_limit == 0 || pipeline.max_pages == 0 {
                return Err(ConfigError::Invalid(
                    "pipeline.page_limit and pipeline.max_pages must be positive".into(),
                ));
            }
            if pipeline.stages.iter().any(|s| s.key == "closed-won") {
                return Err(ConfigError::Invalid(
                    "pipeline stage key 'closed-won' is reserved".into(),
                ));
            }
        }
        if let Some(financial) = &self.financial {
            if financial.min_call_interval_ms < MIN_REPORT_INTERVAL_MS {
                return Err(ConfigError::Invalid(format!(
                    "financial.min_call_interval_ms must be at least {}, got {}",
                    MIN_REPORT_INTERVAL_MS, financial.min_call_interval_ms
                )));
            }
            if financial.refresh_margin().is_none() {
                return Err(ConfigError::Invalid(format!(
                    "financial.refresh_margin_secs is out of range: {}",
                    financial.refresh_margin_secs
                )));
            }
            if financial.account_rules.is_empty() {
                return Err(ConfigError::Invalid(
                    "financial.account_rules must not be empty".into(),
                ));
            }
            if let Some(rule) = financial
                .account_rules
                .iter()
                .find(|r| r.metric.trim().is_empty())
            {
                return Err(ConfigError::Invalid(format!(
                    "account rule '{}' has an empty metric key",
                    rule.label
                )));
            }
        }
        Ok(())
    }
}

/// Get the default config path
pub fn default_config_path() -> PathBuf {
    let config_dir = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));

    config_dir.join("siteline").join("config.json")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.server.bind_addr, "127.0.0.1:8787");
        assert_eq!(config.cache.ttl_hours, 24);
        assert!((config.backfill.baseline_fraction - 0.3).abs() < f64::EPSILON);
        assert!(config.pipeline.is_none());
        assert!(config.financial.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let json = r#"{
            "cache": { "ttl_hours": 6 },
            "financial": { "tenant_id": "tenant-1" }
        }"#;
        let config: AppConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.cache.ttl_hours, 6);
        let financial = config.financial.unwrap();
        assert_eq!(financial.tenant_id, "tenant-1");
        assert_eq!(financial.min_call_interval_ms, 1100);
        assert_eq!(financial.refresh_margin_secs, 300);
        assert_eq!(financial.account_rules, default_account_rules());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("SITELINE_PIPELINE_TOKEN", "pat-123"),
            ("SITELINE_FINANCIAL_CLIENT_ID", "client"),
            ("SITELINE_DB_PATH", "/tmp/siteline.db"),
        ]
        .into_iter()
        .collect();

        let mut config = AppConfig::default();
        config.apply_env(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.pipeline.unwrap().access_token, "pat-123");
        assert_eq!(config.financial.unwrap().client_id, "client");
        assert_eq!(config.database.path, Some(PathBuf::from("/tmp/siteline.db")));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = AppConfig::default();
        config.backfill.baseline_fraction = 1.5;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = AppConfig::default();
        config.cache.ttl_hours = 0;
        assert!(config.validate().is_err());

        // Would overflow chrono's duration range
        let mut config = AppConfig::default();
        config.cache.ttl_hours = i64::MAX;
        assert!(config.cache.ttl().is_none());
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = AppConfig::default();
        config.financial = Some(FinancialConfig {
            refresh_margin_secs: i64::MAX,
            ..FinancialConfig::default()
        });
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.financial = Some(FinancialConfig {
            account_rules: vec![],
            ..FinancialConfig::default()
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_enforces_report_quota() {
        let mut config = AppConfig::default();
        config.financial = Some(FinancialConfig {
            min_call_interval_ms: 250,
            ..FinancialConfig::default()
        });
        match config.validate() {
            Err(ConfigError::Invalid(msg)) => assert!(msg.contains("min_call_interval_ms")),
            other => panic!("expected Invalid, got {:?}", other),
        }

        config.financial = Some(FinancialConfig {
            min_call_interval_ms: MIN_REPORT_INTERVAL_MS,
            ..FinancialConfig::default()
        });
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file_reports_missing_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = AppConfig::from_file(&dir.path().join("missing.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_from_file_reads_rules() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{ "financial": { "account_rules": [
                { "metric": "revenue", "label": "Sales", "section": "trading income" }
            ] } }"#,
        )
        .unwrap();

        let config = AppConfig::from_file(&path).unwrap();
        let rules = config.financial.unwrap().account_rules;
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].section.as_deref(), Some("trading income"));
        assert!(rules[0].accounts.is_empty());
    }
}
