//! Cooperative cancellation threaded through every suspension point.
//!
//! One [`CancelToken`] travels with a request from ingress to the worker
//! and tool layers. The paired [`CancelHandle`] is held by the caller;
//! firing it aborts in-flight HTTP calls, drops queued jobs, and cancels
//! pending tool invocations.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

use crate::error::GatewayError;
use crate::Result;

#[derive(Debug)]
struct Shared {
    canceled: AtomicBool,
    notify: Notify,
}

/// Caller-side handle that fires cancellation exactly once.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    shared: Arc<Shared>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.shared.canceled.store(true, Ordering::SeqCst);
        self.shared.notify.notify_waiters();
    }

    pub fn is_canceled(&self) -> bool {
        self.shared.canceled.load(Ordering::SeqCst)
    }
}

/// Request-side token observed by workers, adapters, and tool sources.
#[derive(Debug, Clone)]
pub struct CancelToken {
    shared: Arc<Shared>,
}

impl CancelToken {
    /// A token that can never fire. Default for requests without a handle.
    pub fn never() -> Self {
        cancel_pair().1
    }

    pub fn is_canceled(&self) -> bool {
        self.shared.canceled.load(Ordering::SeqCst)
    }

    /// Fail fast if the token has fired.
    pub fn check(&self) -> Result<()> {
        if self.is_canceled() {
            Err(GatewayError::canceled())
        } else {
            Ok(())
        }
    }

    /// Resolve when the token fires. Safe to await from any number of tasks.
    pub async fn cancelled(&self) {
        loop {
            // Register interest before the flag check so a concurrent
            // cancel() between check and await is not missed.
            let notified = self.shared.notify.notified();
            if self.is_canceled() {
                return;
            }
            notified.await;
        }
    }
}

/// Create a linked handle/token pair.
pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let shared = Arc::new(Shared {
        canceled: AtomicBool::new(false),
        notify: Notify::new(),
    });
    (
        CancelHandle {
            shared: shared.clone(),
        },
        CancelToken { shared },
    )
}
