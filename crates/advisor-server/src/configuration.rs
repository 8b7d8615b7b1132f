use crate::error::{to_env_var, ConfigError};
use advisor::providers::configs::{OpenAiProviderConfig, ProviderConfig};
use advisor::queue::QueueConfig;
use advisor::store::FileFallbackStore;
use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl ServerSettings {
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        let addr = format!("{}:{}", self.host, self.port);
        addr.parse()
            .map_err(|source| ConfigError::InvalidAddress { addr, source })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase", tag = "type")]
pub enum ProviderSettings {
    OpenAi {
        #[serde(default = "default_openai_host")]
        host: String,
        api_key: String,
        #[serde(default = "default_model")]
        model: String,
        #[serde(default)]
        temperature: Option<f32>,
        #[serde(default)]
        max_tokens: Option<i32>,
    },
}

impl ProviderSettings {
    // Convert to the advisor ProviderConfig
    pub fn into_config(self) -> ProviderConfig {
        match self {
            ProviderSettings::OpenAi {
                host,
                api_key,
                model,
                temperature,
                max_tokens,
            } => ProviderConfig::OpenAi(OpenAiProviderConfig {
                host,
                api_key,
                model,
                temperature,
                max_tokens,
            }),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueSettings {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_queue_size: default_max_queue_size(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            flush_interval_ms: default_flush_interval_ms(),
        }
    }
}

impl QueueSettings {
    pub fn into_config(self) -> QueueConfig {
        QueueConfig {
            batch_size: self.batch_size,
            max_queue_size: self.max_queue_size,
            max_retries: self.max_retries,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            flush_interval: Duration::from_millis(self.flush_interval_ms),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatSettings {
    /// A turn fails when the model produces nothing for this long
    #[serde(default = "default_upstream_timeout_secs")]
    pub upstream_timeout_secs: u64,
    /// How often an idle turn checks whether the client is still there
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_ms: u64,
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: usize,
    /// Most recent stored messages sent to the model with each turn
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            upstream_timeout_secs: default_upstream_timeout_secs(),
            heartbeat_ms: default_heartbeat_ms(),
            max_tool_rounds: default_max_tool_rounds(),
            history_limit: default_history_limit(),
        }
    }
}

impl ChatSettings {
    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_secs)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms.max(1))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageSettings {
    /// Where writes that ran out of retries are kept
    #[serde(default)]
    pub fallback_path: Option<PathBuf>,
}

impl StorageSettings {
    pub fn fallback_path(&self) -> anyhow::Result<PathBuf> {
        match &self.fallback_path {
            Some(path) => Ok(path.clone()),
            None => FileFallbackStore::default_path(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerSettings,
    pub provider: ProviderSettings,
    #[serde(default)]
    pub queue: QueueSettings,
    #[serde(default)]
    pub chat: ChatSettings,
    #[serde(default)]
    pub storage: StorageSettings,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        Self::load_and_validate()
    }

    fn load_and_validate() -> Result<Self, ConfigError> {
        // Start with default configuration
        let config = Config::builder()
            // Server defaults
            .set_default("server.host", default_host())?
            .set_default("server.port", default_port())?
            // Provider defaults
            .set_default("provider.type", "openai")?
            .set_default("provider.host", default_openai_host())?
            .set_default("provider.model", default_model())?
            // Optional advisord.toml in the working directory
            .add_source(File::new("advisord.toml", FileFormat::Toml).required(false))
            // Layer on the environment variables
            .add_source(
                Environment::with_prefix("ADVISOR")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        // Try to deserialize the configuration
        let result: Result<Self, config::ConfigError> = config.try_deserialize();

        // Handle missing field errors specially
        match result {
            Ok(settings) => Ok(settings),
            Err(err) => {
                tracing::debug!("Configuration error: {:?}", &err);

                if let Some(field) = missing_field_path(&err.to_string()) {
                    Err(ConfigError::MissingEnvVar {
                        env_var: to_env_var(&field),
                    })
                } else if let config::ConfigError::NotFound(field) = &err {
                    Err(ConfigError::MissingEnvVar {
                        env_var: to_env_var(field),
                    })
                } else {
                    Err(ConfigError::Other(err))
                }
            }
        }
    }
}

/// Extract the dotted path from "missing field `api_key` for key `provider`".
fn missing_field_path(message: &str) -> Option<String> {
    let rest = message.strip_prefix("missing field `")?;
    let (field, rest) = rest.split_once('`')?;
    match rest
        .strip_prefix(" for key `")
        .and_then(|key| key.split_once('`'))
    {
        Some((key, _)) => Some(format!("{}.{}", key, field)),
        None => Some(field.to_string()),
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_model() -> String {
    "gpt-4o".to_string()
}

fn default_openai_host() -> String {
    "https://api.openai.com".to_string()
}

fn default_batch_size() -> usize {
    10
}

fn default_max_queue_size() -> usize {
    100
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_flush_interval_ms() -> u64 {
    500
}

fn default_upstream_timeout_secs() -> u64 {
    120
}

fn default_heartbeat_ms() -> u64 {
    500
}

fn default_max_tool_rounds() -> usize {
    2
}

fn default_history_limit() -> usize {
    50
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    fn clean_env() {
        for (key, _) in env::vars() {
            if key.starts_with("ADVISOR_") {
                env::remove_var(&key);
            }
        }
    }

    #[test]
    #[serial]
    fn test_default_settings() {
        clean_env();

        // Set required provider settings for test
        env::set_var("ADVISOR_PROVIDER__API_KEY", "test-key");

        let settings = Settings::new().unwrap();
        assert_eq!(settings.server.host, "127.0.0.1");
        assert_eq!(settings.server.port, 3000);

        let ProviderSettings::OpenAi {
            host,
            api_key,
            model,
            temperature,
            max_tokens,
        } = settings.provider;
        assert_eq!(host, "https://api.openai.com");
        assert_eq!(api_key, "test-key");
        assert_eq!(model, "gpt-4o");
        assert_eq!(temperature, None);
        assert_eq!(max_tokens, None);

        let queue = settings.queue.into_config();
        assert_eq!(queue.batch_size, 10);
        assert_eq!(queue.max_queue_size, 100);
        assert_eq!(queue.max_retries, 3);
        assert_eq!(queue.retry_delay, Duration::from_secs(1));
        assert_eq!(queue.flush_interval, Duration::from_millis(500));

        assert_eq!(settings.chat.upstream_timeout(), Duration::from_secs(120));
        assert_eq!(settings.chat.heartbeat(), Duration::from_millis(500));
        assert!(settings.storage.fallback_path.is_none());

        // Clean up
        env::remove_var("ADVISOR_PROVIDER__API_KEY");
    }

    #[test]
    #[serial]
    fn test_missing_api_key_names_the_variable() {
        clean_env();

        match Settings::new() {
            Err(ConfigError::MissingEnvVar { env_var }) => {
                assert!(env_var.starts_with("ADVISOR_"));
                assert!(env_var.ends_with("API_KEY"));
            }
            other => panic!("Expected missing env var error, got {:?}", other),
        }
    }

    #[test]
    #[serial]
    fn test_environment_override() {
        clean_env();
        env::set_var("ADVISOR_SERVER__PORT", "8080");
        env::set_var("ADVISOR_PROVIDER__API_KEY", "test-key");
        env::set_var("ADVISOR_PROVIDER__HOST", "https://custom.openai.com");
        env::set_var("ADVISOR_PROVIDER__MODEL", "gpt-4o-mini");
        env::set_var("ADVISOR_PROVIDER__TEMPERATURE", "0.3");
        env::set_var("ADVISOR_QUEUE__BATCH_SIZE", "5");
        env::set_var("ADVISOR_QUEUE__MAX_RETRIES", "7");
        env::set_var("ADVISOR_CHAT__UPSTREAM_TIMEOUT_SECS", "30");
        env::set_var("ADVISOR_STORAGE__FALLBACK_PATH", "/tmp/advisor-failed.json");

        let settings = Settings::new().unwrap();
        assert_eq!(settings.server.port, 8080);

        let ProviderSettings::OpenAi {
            host,
            api_key,
            model,
            temperature,
            ..
        } = settings.provider;
        assert_eq!(host, "https://custom.openai.com");
        assert_eq!(api_key, "test-key");
        assert_eq!(model, "gpt-4o-mini");
        assert_eq!(temperature, Some(0.3));

        assert_eq!(settings.queue.batch_size, 5);
        assert_eq!(settings.queue.max_retries, 7);
        assert_eq!(settings.chat.upstream_timeout_secs, 30);
        assert_eq!(
            settings.storage.fallback_path().unwrap(),
            PathBuf::from("/tmp/advisor-failed.json")
        );

        // Clean up
        clean_env();
    }

    #[test]
    fn test_socket_addr_conversion() {
        let server_settings = ServerSettings {
            host: "127.0.0.1".to_string(),
            port: 3000,
        };
        let addr = server_settings.socket_addr().unwrap();
        assert_eq!(addr.to_string(), "127.0.0.1:3000");

        let bad = ServerSettings {
            host: "not a host".to_string(),
            port: 3000,
        };
        assert!(matches!(
            bad.socket_addr(),
            Err(ConfigError::InvalidAddress { .. })
        ));
    }

    #[test]
    fn test_missing_field_path() {
        assert_eq!(
            missing_field_path("missing field `api_key` for key `provider`"),
            Some("provider.api_key".to_string())
        );
        assert_eq!(
            missing_field_path("missing field `type`"),
            Some("type".to_string())
        );
        assert_eq!(missing_field_path("invalid type"), None);
    }
}
