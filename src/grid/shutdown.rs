//! Cooperative shutdown signal
//!
//! The engine checks the signal between discrete exchange calls, so an
//! individual order placement is never interrupted.

use tokio::sync::watch;

/// Sending half, held by whoever decides to stop (e.g. a Ctrl-C handler)
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }
}

/// Receiving half, cheap to clone into every component that issues exchange calls
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Create a linked trigger/signal pair
    pub fn new() -> (ShutdownTrigger, ShutdownSignal) {
        let (tx, rx) = watch::channel(false);
        (ShutdownTrigger { tx }, ShutdownSignal { rx })
    }

    /// A signal that never fires
    pub fn never() -> ShutdownSignal {
        let (_, signal) = Self::new();
        signal
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown has been requested
    pub async fn wait(&mut self) {
        // An error means the trigger was dropped without firing: never resolve
        if self.rx.wait_for(|stop| *stop).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
