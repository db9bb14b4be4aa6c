//! Graceful shutdown handling for a governance node
//!
//! Turns SIGINT/SIGTERM (or a manual request) into a broadcast shutdown signal
//! and bounds the time spent releasing resources, resigning leadership and
//! stopping background loops.

use crate::config::GovernanceConfig;
use crate::log::log_shutdown;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::timeout;

/// Shutdown signal types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// SIGINT (Ctrl+C)
    Interrupt,
    /// SIGTERM
    Terminate,
    /// Manual shutdown request
    Manual,
    /// Shutdown work exceeded its deadline
    Timeout,
}

impl ShutdownSignal {
    pub fn reason(&self) -> &'static str {
        match self {
            ShutdownSignal::Interrupt => "SIGINT received",
            ShutdownSignal::Terminate => "SIGTERM received",
            ShutdownSignal::Manual => "Manual shutdown",
            ShutdownSignal::Timeout => "Shutdown timeout",
        }
    }
}

/// Shutdown coordinator for the node process
pub struct ShutdownCoordinator {
    shutdown_tx: broadcast::Sender<ShutdownSignal>,
    is_shutting_down: Arc<AtomicBool>,
    received: Arc<Mutex<Option<ShutdownSignal>>>,
    timeout: Duration,
    signal_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// Handle for background tasks that need to observe shutdown
pub struct ShutdownHandle {
    shutdown_rx: broadcast::Receiver<ShutdownSignal>,
    received: Arc<Mutex<Option<ShutdownSignal>>>,
}

impl ShutdownHandle {
    /// Wait for the shutdown signal. Returns immediately if shutdown was
    /// already triggered.
    pub async fn wait_for_shutdown(&mut self) -> ShutdownSignal {
        if let Some(signal) = *self.received.lock().unwrap_or_else(|p| p.into_inner()) {
            return signal;
        }
        self.shutdown_rx.recv().await.unwrap_or(ShutdownSignal::Manual)
    }
}

impl ShutdownCoordinator {
    pub fn new(shutdown_timeout: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(16);
        Self {
            shutdown_tx,
            is_shutting_down: Arc::new(AtomicBool::new(false)),
            received: Arc::new(Mutex::new(None)),
            timeout: shutdown_timeout,
            signal_task: Mutex::new(None),
        }
    }

    pub fn from_config(config: &GovernanceConfig) -> Self {
        Self::new(config.shutdown_duration())
    }

    /// Spawn the task translating process signals into shutdown signals
    pub fn listen_for_signals(&self) {
        let coordinator = self.trigger_handle();
        let task = tokio::spawn(async move {
            handle_signals(coordinator).await;
        });
        *self.signal_task.lock().unwrap_or_else(|p| p.into_inner()) = Some(task);
    }

    fn trigger_handle(&self) -> Trigger {
        Trigger {
            shutdown_tx: self.shutdown_tx.clone(),
            is_shutting_down: Arc::clone(&self.is_shutting_down),
            received: Arc::clone(&self.received),
        }
    }

    /// Request shutdown. Returns false if shutdown was already requested.
    pub fn trigger(&self, signal: ShutdownSignal) -> bool {
        self.trigger_handle().fire(signal)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.is_shutting_down.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> ShutdownHandle {
        ShutdownHandle {
            shutdown_rx: self.shutdown_tx.subscribe(),
            received: Arc::clone(&self.received),
        }
    }

    /// Wait until shutdown is requested
    pub async fn wait_for_shutdown(&self) -> ShutdownSignal {
        self.subscribe().wait_for_shutdown().await
    }

    /// Run the shutdown work for `signal`, bounded by the configured timeout.
    /// Returns whether the work finished in time.
    pub async fn run_shutdown<F>(&self, signal: ShutdownSignal, work: F) -> bool
    where
        F: Future<Output = ()>,
    {
        tracing::info!("Initiating graceful shutdown: {}", signal.reason());
        log_shutdown(signal.reason());

        let completed = match timeout(self.timeout, work).await {
            Ok(()) => {
                tracing::info!("Graceful shutdown completed successfully");
                true
            }
            Err(_) => {
                tracing::warn!(
                    "Shutdown timeout reached after {:?}, forcing shutdown",
                    self.timeout
                );
                log_shutdown(ShutdownSignal::Timeout.reason());
                false
            }
        };

        if let Some(task) = self.signal_task.lock().unwrap_or_else(|p| p.into_inner()).take() {
            task.abort();
        }
        completed
    }
}

#[derive(Clone)]
struct Trigger {
    shutdown_tx: broadcast::Sender<ShutdownSignal>,
    is_shutting_down: Arc<AtomicBool>,
    received: Arc<Mutex<Option<ShutdownSignal>>>,
}

impl Trigger {
    fn fire(&self, signal: ShutdownSignal) -> bool {
        if self.is_shutting_down.swap(true, Ordering::SeqCst) {
            return false;
        }
        *self.received.lock().unwrap_or_else(|p| p.into_inner()) = Some(signal);
        let _ = self.shutdown_tx.send(signal);
        true
    }
}

#[cfg(unix)]
async fn handle_signals(trigger: Trigger) {
    use tokio::signal::unix::{signal, SignalKind};

    let handlers = (
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
    );
    let (mut interrupt, mut terminate) = match handlers {
        (Ok(interrupt), Ok(terminate)) => (interrupt, terminate),
        (Err(e), _) | (_, Err(e)) => {
            tracing::error!("Failed to install signal handlers: {}", e);
            return;
        }
    };

    loop {
        tokio::select! {
            _ = interrupt.recv() => {
                tracing::info!("Received SIGINT, initiating graceful shutdown");
                trigger.fire(ShutdownSignal::Interrupt);
            }
            _ = terminate.recv() => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown");
                trigger.fire(ShutdownSignal::Terminate);
            }
        }
    }
}

#[cfg(not(unix))]
async fn handle_signals(trigger: Trigger) {
    if tokio::signal::ctrl_c().await.is_ok() {
        tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        trigger.fire(ShutdownSignal::Interrupt);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_trigger_once() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(1));
        let mut handle = coordinator.subscribe();
        assert!(!coordinator.is_shutting_down());

        assert!(coordinator.trigger(ShutdownSignal::Manual));
        assert!(!coordinator.trigger(ShutdownSignal::Terminate));
        assert!(coordinator.is_shutting_down());
        assert_eq!(handle.wait_for_shutdown().await, ShutdownSignal::Manual);
    }

    #[tokio::test]
    async fn test_late_subscriber_sees_signal() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(1));
        coordinator.trigger(ShutdownSignal::Terminate);
        assert_eq!(coordinator.wait_for_shutdown().await, ShutdownSignal::Terminate);
    }

    #[tokio::test]
    async fn test_run_shutdown_is_bounded() {
        let coordinator = ShutdownCoordinator::new(Duration::from_millis(50));
        assert!(coordinator.run_shutdown(ShutdownSignal::Manual, async {}).await);
        assert!(
            !coordinator
                .run_shutdown(ShutdownSignal::Manual, tokio::time::sleep(Duration::from_secs(5)))
                .await
        );
    }
}
