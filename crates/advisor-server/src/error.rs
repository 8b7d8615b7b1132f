use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variable: {env_var}")]
    MissingEnvVar { env_var: String },

    #[error("Invalid server address {addr}: {source}")]
    InvalidAddress {
        addr: String,
        source: std::net::AddrParseError,
    },

    #[error("Configuration error: {0}")]
    Other(#[from] config::ConfigError),
}

/// Name of the environment variable that sets a dotted configuration path,
/// e.g. `provider.api_key` -> `ADVISOR_PROVIDER__API_KEY`.
pub fn to_env_var(field_path: &str) -> String {
    format!("ADVISOR_{}", field_path.replace('.', "__").to_uppercase())
}
