use crate::amount::MAX_TOKEN_DECIMALS;
use config::{ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;

/// Private key material. Never printed.
#[derive(Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct SecretKey(String);

impl SecretKey {
    pub fn new(value: impl Into<String>) -> Self {
        SecretKey(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey(<redacted>)")
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LedgerBackend {
    Gateway,
    Memory,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuditBackend {
    Nats,
    Memory,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Postgres,
    Memory,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub nats: NatsConfig,
    pub ledger: LedgerConfig,
    pub audit: AuditConfig,
    pub security: SecurityConfig,
    pub store: StoreConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub workers: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct NatsConfig {
    pub url: String,
    pub stream_prefix: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LedgerConfig {
    pub backend: LedgerBackend,
    pub gateway_url: String,
    pub timeout_secs: u64,
    pub operator_account_id: String,
    pub operator_private_key: SecretKey,
    pub treasury_account_id: String,
    pub treasury_private_key: SecretKey,
    pub supply_private_key: SecretKey,
    pub token_id: String,
    pub token_decimals: u32,
    pub fiat_currency: String,
    /// Age after which a PENDING deposit claim may be taken over by a forced resume
    pub stale_claim_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AuditConfig {
    pub backend: AuditBackend,
    pub topic_id: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SecurityConfig {
    pub webhook_secret: SecretKey,
    pub signature_header: String,
    pub jwt_secret: Option<SecretKey>,
    pub webhook_requests_per_minute: u32,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StoreConfig {
    pub backend: StoreBackend,
}

/// Settings the orchestrator runs with, fixed at construction
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub operator_account: String,
    pub treasury_account: String,
    pub treasury_key: SecretKey,
    pub supply_key: SecretKey,
    pub token_id: String,
    pub audit_topic_id: String,
    pub token_decimals: u32,
    pub fiat_currency: String,
    pub webhook_secret: SecretKey,
    pub stale_claim_secs: u64,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let environment = env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string());

        let mut builder = config::Config::builder()
            // Start with default configuration
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 3000)?
            .set_default("server.workers", 4)?
            .set_default("database.url", "")?
            .set_default("database.max_connections", 10)?
            .set_default("nats.url", "nats://127.0.0.1:4222")?
            .set_default("nats.stream_prefix", "issuance")?
            .set_default("ledger.backend", "gateway")?
            .set_default("ledger.gateway_url", "http://127.0.0.1:5600")?
            .set_default("ledger.timeout_secs", 120)?
            .set_default("ledger.operator_account_id", "")?
            .set_default("ledger.operator_private_key", "")?
            .set_default("ledger.treasury_account_id", "")?
            .set_default("ledger.treasury_private_key", "")?
            .set_default("ledger.supply_private_key", "")?
            .set_default("ledger.token_id", "")?
            .set_default("ledger.token_decimals", 2)?
            .set_default("ledger.fiat_currency", "NGN")?
            .set_default("ledger.stale_claim_secs", 900)?
            .set_default("audit.backend", "nats")?
            .set_default("audit.topic_id", "")?
            .set_default("security.webhook_secret", "")?
            .set_default("security.signature_header", "x-signature")?
            .set_default("security.webhook_requests_per_minute", 600)?
            .set_default("store.backend", "postgres")?;

        // Add environment-specific config file if it exists
        if let Ok(config_file) = env::var("CONFIG_FILE") {
            builder = builder.add_source(File::with_name(&config_file).required(false));
        } else {
            builder = builder.add_source(
                File::with_name(&format!("config/{}", environment)).required(false),
            );
        }

        // Override with environment variables
        builder = builder.add_source(
            Environment::with_prefix("ISSUANCE_ENGINE")
                .separator("__")
                .list_separator(","),
        );

        // Conventional names used by the deployment
        let overrides = [
            ("DATABASE_URL", "database.url"),
            ("NATS_URL", "nats.url"),
            ("PORT", "server.port"),
            ("LEDGER_GATEWAY_URL", "ledger.gateway_url"),
            ("OPERATOR_ACCOUNT_ID", "ledger.operator_account_id"),
            ("OPERATOR_PRIVATE_KEY", "ledger.operator_private_key"),
            ("TREASURY_ACCOUNT_ID", "ledger.treasury_account_id"),
            ("TREASURY_PRIVATE_KEY", "ledger.treasury_private_key"),
            ("SUPPLY_KEY_PRIVATE", "ledger.supply_private_key"),
            ("TOKEN_ID", "ledger.token_id"),
            ("HCS_TOPIC_ID", "audit.topic_id"),
            ("WEBHOOK_SECRET", "security.webhook_secret"),
            ("JWT_SECRET", "security.jwt_secret"),
        ];
        for (var, key) in overrides {
            if let Ok(value) = env::var(var) {
                builder = builder.set_override(key, value)?;
            }
        }

        builder.build()?.try_deserialize()
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.server.port == 0 {
            return Err("Server port cannot be 0".to_string());
        }

        if self.security.webhook_secret.is_empty() {
            return Err("Webhook secret is required".to_string());
        }

        if self.security.webhook_requests_per_minute == 0 {
            return Err("Webhook rate limit must be positive".to_string());
        }

        if self.ledger.token_decimals > MAX_TOKEN_DECIMALS {
            return Err(format!(
                "Token decimals cannot exceed {}",
                MAX_TOKEN_DECIMALS
            ));
        }

        if self.ledger.fiat_currency.is_empty() {
            return Err("Fiat currency is required".to_string());
        }

        // A live run can wait a full ledger timeout between checkpoints
        if self.ledger.stale_claim_secs <= self.ledger.timeout_secs {
            return Err(format!(
                "Stale claim window ({}s) must exceed the ledger timeout ({}s)",
                self.ledger.stale_claim_secs, self.ledger.timeout_secs
            ));
        }

        if self.ledger.backend == LedgerBackend::Gateway {
            let required = [
                (&self.ledger.gateway_url, "Ledger gateway URL"),
                (&self.ledger.operator_account_id, "Operator account ID"),
                (&self.ledger.treasury_account_id, "Treasury account ID"),
                (&self.ledger.token_id, "Token ID"),
            ];
            for (value, name) in required {
                if value.is_empty() {
                    return Err(format!("{} is required", name));
                }
            }

            if self.ledger.treasury_private_key.is_empty() || self.ledger.supply_private_key.is_empty() {
                return Err("Treasury and supply keys are required".to_string());
            }
        }

        if self.audit.backend == AuditBackend::Nats {
            if self.nats.url.is_empty() {
                return Err("NATS URL is required".to_string());
            }
            if self.audit.topic_id.is_empty() {
                return Err("Audit topic ID is required".to_string());
            }
        }

        if self.store.backend == StoreBackend::Postgres && self.database.url.is_empty() {
            return Err("Database URL is required".to_string());
        }

        Ok(())
    }

    /// Builds the orchestrator settings. Falls back to placeholder identifiers
    /// only for in-memory backends, where no real ledger is involved.
    pub fn pipeline(&self) -> PipelineConfig {
        let or_default = |value: &str, fallback: &str| {
            if value.is_empty() {
                fallback.to_string()
            } else {
                value.to_string()
            }
        };

        PipelineConfig {
            operator_account: or_default(&self.ledger.operator_account_id, "0.0.2"),
            treasury_account: or_default(&self.ledger.treasury_account_id, "0.0.2"),
            treasury_key: self.ledger.treasury_private_key.clone(),
            supply_key: self.ledger.supply_private_key.clone(),
            token_id: or_default(&self.ledger.token_id, "0.0.1001"),
            audit_topic_id: or_default(&self.audit.topic_id, "0.0.1002"),
            token_decimals: self.ledger.token_decimals,
            fiat_currency: self.ledger.fiat_currency.to_uppercase(),
            webhook_secret: self.security.webhook_secret.clone(),
            stale_claim_secs: self.ledger.stale_claim_secs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_config() -> Config {
        Config {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 3000,
                workers: 1,
            },
            database: DatabaseConfig {
                url: String::new(),
                max_connections: 1,
            },
            nats: NatsConfig {
                url: String::new(),
                stream_prefix: "issuance".to_string(),
            },
            ledger: LedgerConfig {
                backend: LedgerBackend::Memory,
                gateway_url: String::new(),
                timeout_secs: 30,
                operator_account_id: String::new(),
                operator_private_key: SecretKey::default(),
                treasury_account_id: String::new(),
                treasury_private_key: SecretKey::default(),
                supply_private_key: SecretKey::default(),
                token_id: String::new(),
                token_decimals: 2,
                fiat_currency: "ngn".to_string(),
                stale_claim_secs: 600,
            },
            audit: AuditConfig {
                backend: AuditBackend::Memory,
                topic_id: String::new(),
            },
            security: SecurityConfig {
                webhook_secret: SecretKey::new("whsec"),
                signature_header: "x-signature".to_string(),
                jwt_secret: None,
                webhook_requests_per_minute: 60,
            },
            store: StoreConfig {
                backend: StoreBackend::Memory,
            },
        }
    }

    #[test]
    fn test_memory_config_is_valid() {
        let config = memory_config();
        assert!(config.validate().is_ok());

        let pipeline = config.pipeline();
        assert_eq!(pipeline.fiat_currency, "NGN");
        assert_eq!(pipeline.token_decimals, 2);
    }

    #[test]
    fn test_gateway_backend_requires_ledger_identifiers() {
        let mut config = memory_config();
        config.ledger.backend = LedgerBackend::Gateway;
        config.ledger.gateway_url = "http://127.0.0.1:5600".to_string();
        assert!(config.validate().is_err());

        config.ledger.operator_account_id = "0.0.2".to_string();
        config.ledger.treasury_account_id = "0.0.3".to_string();
        config.ledger.token_id = "0.0.5005".to_string();
        config.ledger.treasury_private_key = SecretKey::new("302e...");
        config.ledger.supply_private_key = SecretKey::new("302e...");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_webhook_secret_is_rejected() {
        let mut config = memory_config();
        config.security.webhook_secret = SecretKey::default();
        assert_eq!(
            config.validate().unwrap_err(),
            "Webhook secret is required"
        );
    }

    #[test]
    fn test_stale_claim_window_must_outlast_ledger_timeout() {
        let mut config = memory_config();
        config.ledger.stale_claim_secs = config.ledger.timeout_secs;
        assert!(config.validate().is_err());

        config.ledger.stale_claim_secs = config.ledger.timeout_secs + 1;
        assert!(config.validate().is_ok());
        assert_eq!(config.pipeline().stale_claim_secs, config.ledger.timeout_secs + 1);
    }

    #[test]
    fn test_secret_key_debug_is_redacted() {
        let key = SecretKey::new("302e020100300506032b657004220420");
        assert!(!format!("{:?}", key).contains("302e"));
        assert_eq!(key.expose(), "302e020100300506032b657004220420");
    }
}
