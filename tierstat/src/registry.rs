//! Process-wide registry of [`Metrics`] instances.
//!
//! Instances are keyed by the canonical encoding of a tag map (for example
//! `{"owner": "acme", "service": "api"}`), so callers that describe the same
//! instance share one buffer. The registry is an ordinary value: create one at
//! startup and pass it to whatever needs it.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{error, info};

use crate::dimensions::{self, Dimensions};
use crate::error::Result;
use crate::metrics::Metrics;

/// Keyed cache of live metrics instances.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    instances: Mutex<HashMap<String, Arc<Metrics>>>,
}

impl MetricsRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `metrics` under `tags`, replacing any previous instance.
    pub fn allocate(&self, tags: &Dimensions, metrics: Metrics) -> Arc<Metrics> {
        let metrics = Arc::new(metrics);
        self.instances
            .lock()
            .insert(dimensions::encode(tags), Arc::clone(&metrics));
        metrics
    }

    /// Returns the instance registered under `tags`.
    pub fn get(&self, tags: &Dimensions) -> Option<Arc<Metrics>> {
        self.instances.lock().get(&dimensions::encode(tags)).cloned()
    }

    /// Returns the instance under `tags`, creating it with `create` if absent.
    ///
    /// # Errors
    ///
    /// Returns the error from `create`; nothing is registered in that case.
    pub fn get_or_create<F>(&self, tags: &Dimensions, create: F) -> Result<Arc<Metrics>>
    where
        F: FnOnce() -> Result<Metrics>,
    {
        let mut instances = self.instances.lock();
        let key = dimensions::encode(tags);
        if let Some(existing) = instances.get(&key) {
            return Ok(Arc::clone(existing));
        }
        let metrics = Arc::new(create()?);
        instances.insert(key, Arc::clone(&metrics));
        Ok(metrics)
    }

    /// Removes the instance under `tags`, flushing its buffer first.
    /// Returns whether an instance was registered.
    ///
    /// # Errors
    ///
    /// Returns the flush error; the instance is removed regardless.
    pub async fn free(&self, tags: &Dimensions) -> Result<bool> {
        let removed = self.instances.lock().remove(&dimensions::encode(tags));
        match removed {
            Some(metrics) => {
                metrics.flush().await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Number of registered instances.
    pub fn len(&self) -> usize {
        self.instances.lock().len()
    }

    /// Whether no instances are registered.
    pub fn is_empty(&self) -> bool {
        self.instances.lock().is_empty()
    }

    /// Flushes every registered instance. Returns the total number of writes.
    ///
    /// # Errors
    ///
    /// Returns the first flush error after attempting every instance.
    pub async fn flush_all(&self) -> Result<usize> {
        let instances: Vec<Arc<Metrics>> = self.instances.lock().values().cloned().collect();
        let mut first_error = None;
        let mut written = 0;

        for metrics in instances {
            match metrics.flush().await {
                Ok(n) => written += n,
                Err(e) => {
                    error!(owner = %metrics.config().owner, error = %e, "flush failed");
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(written),
        }
    }

    /// Waits for Ctrl-C or SIGTERM, then flushes every instance.
    ///
    /// # Errors
    ///
    /// Returns the first flush error.
    pub async fn flush_on_shutdown(&self) -> Result<usize> {
        shutdown_signal().await;
        let written = self.flush_all().await?;
        info!(written, "flushed buffered metrics on shutdown");
        Ok(written)
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("shutdown signal received");
}
