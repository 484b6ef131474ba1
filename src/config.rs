//! Gateway configuration, consumed at construction and immutable at
//! runtime.
//!
//! Key material never appears inline: every key is a [`SecretRef`]
//! resolved through indirection (environment variable first, OS keyring
//! second) when the gateway is built.

use std::time::Duration;

use crate::error::GatewayError;
use crate::keys::{ApiKey, Secret};
use crate::Result;

/// Indirect reference to secret key material.
#[derive(Debug, Clone)]
pub enum SecretRef {
    /// Read from an environment variable.
    Env(String),
    /// Read from the OS keyring.
    Keyring { service: String, account: String },
}

impl SecretRef {
    pub fn env(name: impl Into<String>) -> Self {
        SecretRef::Env(name.into())
    }

    pub fn keyring(service: impl Into<String>, account: impl Into<String>) -> Self {
        SecretRef::Keyring {
            service: service.into(),
            account: account.into(),
        }
    }

    pub fn resolve(&self) -> Result<Secret> {
        match self {
            SecretRef::Env(name) => std::env::var(name).map(Secret::new).map_err(|_| {
                GatewayError::internal(format!(
                    "secret environment variable '{}' is not set",
                    name
                ))
            }),
            SecretRef::Keyring { service, account } => {
                let entry = keyring::Entry::new(service, account).map_err(|e| {
                    GatewayError::internal(format!("keyring entry '{}' unavailable: {}", service, e))
                })?;
                entry.get_password().map(Secret::new).map_err(|e| {
                    GatewayError::internal(format!(
                        "keyring lookup failed for '{}/{}': {}",
                        service, account, e
                    ))
                })
            }
        }
    }
}

/// One configured credential for a provider.
#[derive(Debug, Clone)]
pub struct KeyConfig {
    pub secret: SecretRef,
    pub weight: f64,
    /// Models this key may serve; empty means all.
    pub models: Vec<String>,
}

impl KeyConfig {
    pub fn new(secret: SecretRef) -> Self {
        Self {
            secret,
            weight: 1.0,
            models: Vec::new(),
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_models(mut self, models: Vec<String>) -> Self {
        self.models = models;
        self
    }

    pub(crate) fn resolve(&self) -> Result<ApiKey> {
        Ok(ApiKey::new(self.secret.resolve()?, self.weight).with_models(self.models.clone()))
    }
}

/// Per-provider runtime knobs.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub name: String,
    /// Worker count for the provider's pool.
    pub concurrency: usize,
    /// Bounded queue depth in front of the workers.
    pub queue_depth: usize,
    /// Per-attempt network deadline.
    pub network_timeout: Duration,
    /// In-worker retries for transient upstream failures.
    pub max_retries: u32,
    pub keys: Vec<KeyConfig>,
}

impl ProviderConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            concurrency: 4,
            queue_depth: 32,
            network_timeout: Duration::from_secs(30),
            max_retries: 2,
            keys: Vec::new(),
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth.max(1);
        self
    }

    pub fn with_network_timeout(mut self, timeout: Duration) -> Self {
        self.network_timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_key(mut self, key: KeyConfig) -> Self {
        self.keys.push(key);
        self
    }

    pub(crate) fn resolve_keys(&self) -> Result<Vec<ApiKey>> {
        self.keys.iter().map(|k| k.resolve()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_secret_resolution() {
        std::env::set_var("AI_GATEWAY_TEST_KEY_A", "sk-resolved");
        let secret = SecretRef::env("AI_GATEWAY_TEST_KEY_A").resolve().unwrap();
        assert_eq!(secret.expose(), "sk-resolved");
        std::env::remove_var("AI_GATEWAY_TEST_KEY_A");
    }

    #[test]
    fn test_missing_env_secret_fails() {
        let err = SecretRef::env("AI_GATEWAY_TEST_KEY_MISSING")
            .resolve()
            .unwrap_err();
        assert!(err.message.contains("not set"));
    }

    #[test]
    fn test_provider_config_floors() {
        let cfg = ProviderConfig::new("openai")
            .with_concurrency(0)
            .with_queue_depth(0);
        assert_eq!(cfg.concurrency, 1);
        assert_eq!(cfg.queue_depth, 1);
    }
}
