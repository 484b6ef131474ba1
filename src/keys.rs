//! Weighted, health-aware API key selection.
//!
//! Each provider owns one [`KeySelector`]. Selection filters keys by the
//! requested model's allow-list, scales configured weights by a health
//! factor derived from consecutive failures, and samples by weighted
//! uniform draw. Unhealthy keys are deprioritized down to a weight floor,
//! never excluded; isolation from a truly dead credential comes from the
//! fallback chain, not from ejection here.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use arc_swap::ArcSwap;
use rand::Rng;

use crate::error::GatewayError;
use crate::Result;

/// Minimum health factor. A key that keeps failing still receives one
/// tenth of its configured weight.
const HEALTH_FLOOR: f64 = 0.1;
/// Health lost per consecutive failure.
const HEALTH_DECAY: f64 = 0.1;

/// Secret key material. Redacted in `Debug` and never logged.
#[derive(Clone)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Access the raw value. Call sites are the adapter `prepare` step only.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// One configured credential.
#[derive(Debug, Clone)]
pub struct ApiKey {
    pub value: Secret,
    /// Non-negative sampling weight.
    pub weight: f64,
    /// Models this key may serve; empty means all.
    pub models: Vec<String>,
}

impl ApiKey {
    pub fn new(value: Secret, weight: f64) -> Self {
        Self {
            value,
            weight: weight.max(0.0),
            models: Vec::new(),
        }
    }

    pub fn with_models(mut self, models: Vec<String>) -> Self {
        self.models = models;
        self
    }

    fn serves(&self, model: &str) -> bool {
        self.models.is_empty() || self.models.iter().any(|m| m == model)
    }
}

#[derive(Debug, Default)]
struct KeyHealth {
    consecutive_failures: u32,
    last_failure: Option<Instant>,
}

impl KeyHealth {
    fn factor(&self) -> f64 {
        (1.0 - self.consecutive_failures as f64 * HEALTH_DECAY).max(HEALTH_FLOOR)
    }
}

/// A key plus its mutable health record.
///
/// Health is written only by the selector, behind a short per-key lock.
#[derive(Debug)]
pub struct KeyEntry {
    pub key: ApiKey,
    health: Mutex<KeyHealth>,
}

impl KeyEntry {
    fn new(key: ApiKey) -> Self {
        Self {
            key,
            health: Mutex::new(KeyHealth::default()),
        }
    }

    fn effective_weight(&self) -> f64 {
        let health = self.health.lock().unwrap_or_else(|e| e.into_inner());
        self.key.weight * health.factor()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.health
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .consecutive_failures
    }
}

/// The selected key handed to a job.
#[derive(Debug, Clone)]
pub struct SelectedKey {
    pub entry: Arc<KeyEntry>,
    /// Position in configuration order, for logging.
    pub index: usize,
}

impl SelectedKey {
    pub fn secret(&self) -> &Secret {
        &self.entry.key.value
    }
}

/// Per-provider weighted key selector.
pub struct KeySelector {
    provider: String,
    keys: ArcSwap<Vec<Arc<KeyEntry>>>,
}

impl KeySelector {
    pub fn new(provider: impl Into<String>, keys: Vec<ApiKey>) -> Self {
        let entries: Vec<Arc<KeyEntry>> =
            keys.into_iter().map(|k| Arc::new(KeyEntry::new(k))).collect();
        Self {
            provider: provider.into(),
            keys: ArcSwap::new(Arc::new(entries)),
        }
    }

    /// Swap in a new key set (credential rotation). Health starts fresh.
    pub fn replace_keys(&self, keys: Vec<ApiKey>) {
        let entries: Vec<Arc<KeyEntry>> =
            keys.into_iter().map(|k| Arc::new(KeyEntry::new(k))).collect();
        self.keys.store(Arc::new(entries));
    }

    /// Pick one key for the model, or fail with `no_viable_key`.
    ///
    /// Weighted uniform sampling over effective weights; when every
    /// effective weight is zero the first eligible key wins
    /// (configuration-order tie-break).
    pub fn select(&self, model: &str) -> Result<SelectedKey> {
        let keys = self.keys.load_full();
        let eligible: Vec<(usize, &Arc<KeyEntry>)> = keys
            .iter()
            .enumerate()
            .filter(|(_, e)| e.key.serves(model))
            .collect();

        if eligible.is_empty() {
            return Err(GatewayError::provider_unavailable(format!(
                "no_viable_key: no key serves model '{}'",
                model
            ))
            .with_provider(self.provider.clone())
            .with_model(model));
        }

        let weights: Vec<f64> = eligible.iter().map(|(_, e)| e.effective_weight()).collect();
        let total: f64 = weights.iter().sum();

        let pick = if total <= 0.0 {
            0
        } else {
            let mut roll = rand::rng().random_range(0.0..total);
            let mut chosen = weights.len() - 1;
            for (i, w) in weights.iter().enumerate() {
                if roll < *w {
                    chosen = i;
                    break;
                }
                roll -= w;
            }
            chosen
        };

        let (index, entry) = eligible[pick];
        Ok(SelectedKey {
            entry: Arc::clone(entry),
            index,
        })
    }

    /// Record a provider-side retryable failure against a key.
    pub fn report_failure(&self, selected: &SelectedKey) {
        let mut health = selected
            .entry
            .health
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        health.consecutive_failures = health.consecutive_failures.saturating_add(1);
        health.last_failure = Some(Instant::now());
        tracing::debug!(
            provider = self.provider.as_str(),
            key_index = selected.index,
            consecutive_failures = health.consecutive_failures,
            "key health degraded"
        );
    }

    /// Reset a key's health after a successful call.
    pub fn report_success(&self, selected: &SelectedKey) {
        let mut health = selected
            .entry
            .health
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        health.consecutive_failures = 0;
        health.last_failure = None;
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }
}

impl fmt::Debug for KeySelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeySelector")
            .field("provider", &self.provider)
            .field("key_count", &self.keys.load().len())
            .finish()
    }
}
