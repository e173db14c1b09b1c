//! API server configuration

use std::env;

/// Configuration errors surfaced at startup
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable {0}")]
    Missing(&'static str),
    #[error("Invalid value for {var}: {value}")]
    Invalid { var: &'static str, value: String },
}

/// Server configuration, read once from the environment
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub database_max_connections: u32,
    pub bind_address: String,
    /// HS256 secret for session JWTs issued by the auth service
    pub jwt_secret: String,
    /// HMAC key for anonymous entitlement tokens
    pub token_signing_secret: String,
    /// Usage counters fall back to process memory when unset
    pub redis_url: Option<String>,
    pub enable_billing: bool,
    pub allowed_origins: Vec<String>,
    pub public_base_url: String,
}

const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8080";
const DEFAULT_ALLOWED_ORIGINS: &str = "http://localhost:3000,http://127.0.0.1:3000";

fn required(var: &'static str) -> Result<String, ConfigError> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(ConfigError::Missing(var)),
    }
}

fn optional(var: &str) -> Option<String> {
    env::var(var).ok().filter(|v| !v.trim().is_empty())
}

fn parse_bool(var: &'static str, default: bool) -> Result<bool, ConfigError> {
    match optional(var) {
        None => Ok(default),
        Some(value) => match value.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid { var, value }),
        },
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_max_connections = match optional("DATABASE_MAX_CONNECTIONS") {
            None => 10,
            Some(value) => value
                .parse()
                .map_err(|_| ConfigError::Invalid {
                    var: "DATABASE_MAX_CONNECTIONS",
                    value,
                })?,
        };

        let allowed_origins = optional("ALLOWED_ORIGINS")
            .unwrap_or_else(|| DEFAULT_ALLOWED_ORIGINS.to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Self {
            database_url: required("DATABASE_URL")?,
            database_max_connections,
            bind_address: optional("BIND_ADDRESS").unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string()),
            jwt_secret: required("JWT_SECRET")?,
            token_signing_secret: required("TOKEN_SIGNING_SECRET")?,
            redis_url: optional("REDIS_URL"),
            enable_billing: parse_bool("ENABLE_BILLING", true)?,
            allowed_origins,
            public_base_url: optional("PUBLIC_BASE_URL")
                .unwrap_or_else(|| "http://localhost:3000".to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: &[&str] = &[
        "DATABASE_URL",
        "DATABASE_MAX_CONNECTIONS",
        "BIND_ADDRESS",
        "JWT_SECRET",
        "TOKEN_SIGNING_SECRET",
        "REDIS_URL",
        "ENABLE_BILLING",
        "ALLOWED_ORIGINS",
        "PUBLIC_BASE_URL",
    ];

    fn reset(with: &[(&str, &str)]) {
        for var in VARS {
            env::remove_var(var);
        }
        for (var, value) in with {
            env::set_var(var, value);
        }
    }

    const REQUIRED: &[(&str, &str)] = &[
        ("DATABASE_URL", "postgres://localhost/fixitflow"),
        ("JWT_SECRET", "jwt-secret"),
        ("TOKEN_SIGNING_SECRET", "token-secret"),
    ];

    #[test]
    #[serial]
    fn test_defaults() {
        reset(REQUIRED);
        let config = Config::from_env().unwrap();
        assert_eq!(config.bind_address, "0.0.0.0:8080");
        assert!(config.enable_billing);
        assert!(config.redis_url.is_none());
        assert_eq!(config.database_max_connections, 10);
        assert_eq!(config.allowed_origins.len(), 2);
    }

    #[test]
    #[serial]
    fn test_missing_token_secret_is_fatal() {
        reset(&REQUIRED[..2]);
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Missing("TOKEN_SIGNING_SECRET")));
    }

    #[test]
    #[serial]
    fn test_billing_flag_and_origins() {
        let mut vars = REQUIRED.to_vec();
        vars.push(("ENABLE_BILLING", "false"));
        vars.push(("ALLOWED_ORIGINS", "https://app.fixitflow.io, https://fixitflow.io"));
        vars.push(("REDIS_URL", "redis://localhost:6379"));
        reset(&vars);

        let config = Config::from_env().unwrap();
        assert!(!config.enable_billing);
        assert_eq!(
            config.allowed_origins,
            vec!["https://app.fixitflow.io", "https://fixitflow.io"]
        );
        assert_eq!(config.redis_url.as_deref(), Some("redis://localhost:6379"));
    }

    #[test]
    #[serial]
    fn test_invalid_bool_rejected() {
        let mut vars = REQUIRED.to_vec();
        vars.push(("ENABLE_BILLING", "maybe"));
        reset(&vars);
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Invalid { var: "ENABLE_BILLING", .. })
        ));
    }
}
