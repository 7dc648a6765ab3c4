//! Ordered resource release and interrupt handling.

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::future::Future;
use std::io;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

type Release = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>;

/// Lifecycle phase of the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Running,
    Draining,
    Terminated,
}

/// Outcome of releasing every resource.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Every resource in the order its release ran.
    pub released: Vec<String>,
    /// Resources whose release failed, with the error.
    pub failures: Vec<(String, String)>,
}

impl ShutdownReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Acquired resources, released in reverse order of acquisition.
#[derive(Default)]
pub struct ResourceStack {
    entries: Vec<(String, Release)>,
}

impl ResourceStack {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a resource together with the action that releases it.
    pub fn push<F, Fut>(&mut self, label: impl Into<String>, release: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let label = label.into();
        debug!(resource = %label, "Resource acquired");
        self.entries.push((label, Box::new(move || release().boxed())));
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Release everything, newest first. A failed release is logged and
    /// the remaining resources are still released.
    pub async fn release_all(&mut self) -> ShutdownReport {
        let mut report = ShutdownReport::default();

        while let Some((label, release)) = self.entries.pop() {
            match release().await {
                Ok(()) => info!(resource = %label, "Released"),
                Err(e) => {
                    warn!(resource = %label, error = %e, "Failed to release");
                    report.failures.push((label.clone(), e.to_string()));
                }
            }
            report.released.push(label);
        }

        report
    }
}

/// Interrupt notifications. An `Err` means the handler could not be
/// installed and no interrupt will ever arrive.
pub type Interrupts = mpsc::UnboundedReceiver<io::Result<()>>;

/// Forward every Ctrl-C to the returned receiver.
#[must_use]
pub fn interrupts() -> Interrupts {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        loop {
            let result = signal::ctrl_c().await;
            let failed = result.is_err();
            if tx.send(result).is_err() || failed {
                break;
            }
        }
    });
    rx
}
