use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub store: StoreConfig,
    #[serde(default)]
    pub oracle: OracleConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

/// Application database holding conversation sessions.
#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

/// The analytical store that questions are asked against.
#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    pub path: PathBuf,
    #[serde(default = "default_db_schema")]
    pub db_schema: String,
    #[serde(default = "default_dialect")]
    pub dialect: String,
}

fn default_db_schema() -> String {
    "main".to_string()
}
fn default_dialect() -> String {
    "SQLite".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct OracleConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            url: None,
            max_tokens: default_max_tokens(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_max_tokens() -> u32 {
    1000
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

impl OracleConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    /// Maximum number of repair rounds after the first execution.
    #[serde(default = "default_max_repair_attempts")]
    pub max_repair_attempts: u32,
    /// Treat an empty result from a joined query as a failure worth repairing.
    #[serde(default)]
    pub repair_empty_results: bool,
    /// Jaro-Winkler similarity above which a column is offered as a suggestion
    /// for an unrecognized term.
    #[serde(default = "default_suggestion_threshold")]
    pub suggestion_threshold: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_repair_attempts: default_max_repair_attempts(),
            repair_empty_results: false,
            suggestion_threshold: default_suggestion_threshold(),
        }
    }
}

fn default_max_repair_attempts() -> u32 {
    3
}
fn default_suggestion_threshold() -> f64 {
    0.8
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.store.db_schema.trim().is_empty() {
        anyhow::bail!("store.db_schema must not be empty");
    }

    // Validate pipeline
    if config.pipeline.max_repair_attempts == 0 || config.pipeline.max_repair_attempts > 10 {
        anyhow::bail!("pipeline.max_repair_attempts must be in [1, 10]");
    }
    if !(0.0..=1.0).contains(&config.pipeline.suggestion_threshold) {
        anyhow::bail!("pipeline.suggestion_threshold must be in [0.0, 1.0]");
    }

    // Validate oracle
    if config.oracle.max_tokens == 0 {
        anyhow::bail!("oracle.max_tokens must be > 0");
    }
    if config.oracle.is_enabled() && config.oracle.model.is_none() {
        anyhow::bail!(
            "oracle.model must be specified when provider is '{}'",
            config.oracle.provider
        );
    }

    match config.oracle.provider.as_str() {
        "disabled" | "openai" | "ollama" => {}
        other => anyhow::bail!(
            "Unknown oracle provider: '{}'. Must be disabled, openai, or ollama.",
            other
        ),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &str) -> Result<Config> {
        let content = format!(
            r#"
[db]
path = "/tmp/din.sqlite"

[store]
path = "/tmp/warehouse.sqlite"
{}
"#,
            extra
        );
        let config: Config = toml::from_str(&content)?;
        validate(&config)?;
        Ok(config)
    }

    #[test]
    fn test_defaults() {
        let cfg = parse("").unwrap();
        assert_eq!(cfg.store.db_schema, "main");
        assert_eq!(cfg.store.dialect, "SQLite");
        assert_eq!(cfg.oracle.provider, "disabled");
        assert_eq!(cfg.pipeline.max_repair_attempts, 3);
        assert!(!cfg.pipeline.repair_empty_results);
    }

    #[test]
    fn test_enabled_provider_requires_model() {
        let err = parse("[oracle]\nprovider = \"openai\"").unwrap_err();
        assert!(err.to_string().contains("oracle.model"));

        let cfg = parse("[oracle]\nprovider = \"openai\"\nmodel = \"gpt-3.5-turbo\"").unwrap();
        assert!(cfg.oracle.is_enabled());
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let err = parse("[oracle]\nprovider = \"bard\"\nmodel = \"x\"").unwrap_err();
        assert!(err.to_string().contains("Unknown oracle provider"));
    }

    #[test]
    fn test_repair_budget_bounds() {
        assert!(parse("[pipeline]\nmax_repair_attempts = 0").is_err());
        assert!(parse("[pipeline]\nmax_repair_attempts = 11").is_err());
        assert!(parse("[pipeline]\nmax_repair_attempts = 5").is_ok());
    }
}
