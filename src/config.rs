use std::path::Path;

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};

const ENV_PREFIX: &str = "LLAMA_RECALL";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

impl Config {
    /// Load the configuration file, then apply `LLAMA_RECALL_*` environment overrides.
    ///
    /// A missing file is not an error; every section has defaults. Nested keys use a
    /// double underscore, e.g. `LLAMA_RECALL_GATEWAY__MODEL`.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        Self::load_with_env(path, None)
    }

    /// Same as [`Config::load`], reading variables from `env` instead of the process
    /// environment when it is given.
    pub(crate) fn load_with_env(
        path: impl AsRef<Path>,
        env: Option<config::Map<String, String>>,
    ) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let var = |name: &str| -> Option<String> {
            let value = match &env {
                Some(map) => map.get(name).cloned(),
                None => std::env::var(name).ok(),
            };
            value.filter(|value| !value.is_empty())
        };

        let builder = config::Config::builder()
            .set_default(
                "gateway.model",
                var("DEFAULT_MODEL").unwrap_or_else(default_model),
            )?
            .add_source(config::File::from(path).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .source(env.clone()),
            );

        let mut config = Self::from_builder(builder)
            .with_context(|| format!("Failed to load config from {}", path.display()))?;

        // Fall back to the conventional provider variable
        if config.gateway.api_key.is_none() {
            config.gateway.api_key = var("OPENAI_API_KEY");
        }

        Ok(config)
    }

    fn from_builder(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> anyhow::Result<Self> {
        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.gateway.base_url.trim().is_empty() {
            bail!("gateway.base_url must not be empty");
        }
        if self.gateway.model.trim().is_empty() {
            bail!("gateway.model must not be empty");
        }
        if self.gateway.timeout_secs == 0 {
            bail!("gateway.timeout_secs must be greater than 0");
        }
        if !(0.0..=2.0).contains(&self.gateway.temperature) {
            bail!(
                "gateway.temperature must be within [0, 2], got {}",
                self.gateway.temperature
            );
        }
        if self.session.history_limit == 0 {
            bail!("session.history_limit must be greater than 0");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    9068
}

/// Connection settings for the OpenAI-compatible completion service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: None,
            model: default_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_model() -> String {
    "gpt-3.5-turbo".to_string()
}

fn default_temperature() -> f64 {
    0.7
}

fn default_max_tokens() -> u32 {
    1000
}

fn default_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Initial memory mode.
    #[serde(default = "default_enable")]
    pub enable: bool,
    /// Model used for summaries; defaults to the gateway model.
    #[serde(default)]
    pub summary_model: Option<String>,
    #[serde(default = "default_summary_max_tokens")]
    pub summary_max_tokens: u32,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            enable: default_enable(),
            summary_model: None,
            summary_max_tokens: default_summary_max_tokens(),
        }
    }
}

fn default_enable() -> bool {
    true
}

fn default_summary_max_tokens() -> u32 {
    512
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Closed sessions kept in process.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            history_limit: default_history_limit(),
        }
    }
}

fn default_history_limit() -> usize {
    50
}
