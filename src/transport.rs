//! Shared HTTP client construction.
//!
//! One `reqwest::Client` is built at gateway construction and shared by
//! every adapter and tool source. Per-request deadlines are enforced at
//! the call site, so the client itself only carries connection-level
//! defaults (env-overridable).

use std::env;
use std::time::Duration;

use reqwest::Proxy;

use crate::error::GatewayError;
use crate::Result;

pub fn build_http_client() -> Result<reqwest::Client> {
    let connect_timeout_secs = env::var("AI_GATEWAY_CONNECT_TIMEOUT_SECS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(10);

    let mut builder = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(connect_timeout_secs))
        .pool_max_idle_per_host(
            env::var("AI_GATEWAY_POOL_MAX_IDLE_PER_HOST")
                .ok()
                .and_then(|s| s.parse::<usize>().ok())
                .unwrap_or(32),
        )
        .pool_idle_timeout(Some(Duration::from_secs(
            env::var("AI_GATEWAY_POOL_IDLE_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(90),
        )))
        // Conservative HTTP/2 keepalive defaults for long-lived connections.
        .http2_adaptive_window(true)
        .http2_keep_alive_interval(Some(Duration::from_secs(30)))
        .http2_keep_alive_timeout(Duration::from_secs(10));

    if let Ok(proxy_url) = env::var("AI_GATEWAY_PROXY_URL") {
        if let Ok(proxy) = Proxy::all(&proxy_url) {
            builder = builder.proxy(proxy);
        }
    }

    builder
        .build()
        .map_err(|e| GatewayError::internal(format!("failed to build HTTP client: {}", e)))
}
