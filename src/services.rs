//! Background service lifecycle
//!
//! Cache refresh loops run as services: started once, driven by a timer, and
//! stopped through a broadcast shutdown signal.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};

/// A long-running background task
#[async_trait::async_trait]
pub trait Service: Send + Sync {
    /// Run until `shutdown` fires
    async fn start(&self, shutdown: broadcast::Receiver<()>) -> Result<()>;

    /// Service name for logging and lookup
    fn name(&self) -> &'static str;

    /// Current status
    fn status(&self) -> ServiceStatus;
}

/// Status of a service
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceStatus {
    /// Registered, loop not yet entered
    Starting,
    /// Loop running
    Running,
    /// Loop exited cleanly
    Stopped,
    /// Loop exited with an error
    Failed(String),
}

impl ServiceStatus {
    /// Whether the service is running
    pub fn is_healthy(&self) -> bool {
        matches!(self, ServiceStatus::Running)
    }

    /// Whether the service has stopped (normally or due to failure)
    pub fn is_stopped(&self) -> bool {
        matches!(self, ServiceStatus::Stopped | ServiceStatus::Failed(_))
    }
}

struct ServiceHandle {
    service: Arc<dyn Service>,
    task: Option<JoinHandle<Result<()>>>,
}

/// Starts and stops a set of services together
pub struct ServiceManager {
    services: RwLock<HashMap<&'static str, ServiceHandle>>,
    shutdown_tx: broadcast::Sender<()>,
    shutdown_timeout: Duration,
}

impl ServiceManager {
    /// Create a manager waiting at most `shutdown_timeout` for services to stop
    pub fn new(shutdown_timeout: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            services: RwLock::new(HashMap::new()),
            shutdown_tx,
            shutdown_timeout,
        }
    }

    /// Register a service
    pub fn register(&self, service: Arc<dyn Service>) -> Result<()> {
        let name = service.name();
        let mut services = self.services.write();
        if services.contains_key(name) {
            return Err(Error::Configuration(format!("service '{}' already registered", name)));
        }
        services.insert(name, ServiceHandle { service, task: None });
        tracing::debug!(service = name, "Service registered");
        Ok(())
    }

    /// Spawn every registered service that is not running yet
    pub fn start_all(&self) {
        let mut services = self.services.write();
        for (name, handle) in services.iter_mut() {
            if handle.task.is_some() {
                continue;
            }
            let service = Arc::clone(&handle.service);
            let shutdown_rx = self.shutdown_tx.subscribe();
            handle.task = Some(tokio::spawn(async move { service.start(shutdown_rx).await }));
            tracing::debug!(service = *name, "Service started");
        }
    }

    /// Signal shutdown and wait for every service
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());

        let tasks: Vec<(&'static str, JoinHandle<Result<()>>)> = {
            let mut services = self.services.write();
            services
                .iter_mut()
                .filter_map(|(name, handle)| handle.task.take().map(|task| (*name, task)))
                .collect()
        };

        let deadline = tokio::time::Instant::now() + self.shutdown_timeout;
        for (name, task) in tasks {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match tokio::time::timeout(remaining, task).await {
                Ok(Ok(Ok(()))) => tracing::debug!(service = name, "Service stopped"),
                Ok(Ok(Err(e))) => tracing::warn!(service = name, error = %e, "Service stopped with error"),
                Ok(Err(e)) => tracing::error!(service = name, error = %e, "Service task panicked"),
                Err(_) => tracing::warn!(service = name, "Service shutdown timed out"),
            }
        }
    }

    /// Status of every service
    pub fn status(&self) -> HashMap<&'static str, ServiceStatus> {
        self.services
            .read()
            .iter()
            .map(|(name, handle)| (*name, handle.service.status()))
            .collect()
    }
}

impl Default for ServiceManager {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

/// Wait for the next tick or for shutdown; `false` once shutdown fired
///
/// Lagged receivers keep running.
pub async fn tick_or_shutdown(
    interval: &mut tokio::time::Interval,
    shutdown: &mut broadcast::Receiver<()>,
) -> bool {
    loop {
        tokio::select! {
            result = shutdown.recv() => match result {
                Ok(()) | Err(broadcast::error::RecvError::Closed) => return false,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::debug!(missed, "Shutdown receiver lagged");
                },
            },
            _ = interval.tick() => return true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Ticker {
        ticks: Arc<AtomicUsize>,
        status: RwLock<ServiceStatus>,
    }

    #[async_trait::async_trait]
    impl Service for Ticker {
        async fn start(&self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
            *self.status.write() = ServiceStatus::Running;
            let mut interval = tokio::time::interval(Duration::from_millis(5));
            while tick_or_shutdown(&mut interval, &mut shutdown).await {
                self.ticks.fetch_add(1, Ordering::SeqCst);
            }
            *self.status.write() = ServiceStatus::Stopped;
            Ok(())
        }

        fn name(&self) -> &'static str {
            "ticker"
        }

        fn status(&self) -> ServiceStatus {
            self.status.read().clone()
        }
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let service = Arc::new(Ticker {
            ticks: Arc::clone(&ticks),
            status: RwLock::new(ServiceStatus::Starting),
        });
        let manager = ServiceManager::default();
        manager.register(service.clone()).unwrap();
        assert!(manager.register(service.clone()).is_err());

        manager.start_all();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(manager.status()["ticker"].is_healthy());

        manager.shutdown().await;
        assert!(service.status().is_stopped());
        assert!(ticks.load(Ordering::SeqCst) >= 1);
    }
}
