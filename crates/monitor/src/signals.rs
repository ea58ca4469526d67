//! Shutdown and wake requests for the control loop.
//!
//! SIGINT/SIGTERM request shutdown; SIGUSR1 cuts the current sleep short.
//! Nothing here touches hardware: the loop checks for shutdown only at
//! iteration boundaries and while sleeping, then tears down itself.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{watch, Notify};
use tracing::info;

/// How a [`LoopSignals::sleep`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SleepOutcome {
    Elapsed,
    Woken,
    Shutdown,
}

/// Sending half, held by whoever observes the outside world.
#[derive(Clone)]
pub(crate) struct SignalSource {
    shutdown: Arc<watch::Sender<bool>>,
    wake: Arc<Notify>,
}

impl SignalSource {
    pub(crate) fn request_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Wake a sleep in progress. Not remembered if nothing is sleeping.
    pub(crate) fn wake(&self) {
        self.wake.notify_waiters();
    }
}

/// Receiving half, owned by the control loop.
pub(crate) struct LoopSignals {
    shutdown: watch::Receiver<bool>,
    wake: Arc<Notify>,
}

impl LoopSignals {
    pub(crate) fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Sleep for `duration` unless shutdown is requested first, or, when
    /// `wakeable`, a wake arrives.
    pub(crate) async fn sleep(&mut self, duration: Duration, wakeable: bool) -> SleepOutcome {
        if self.is_shutdown() {
            return SleepOutcome::Shutdown;
        }

        let wake = &self.wake;
        let woken = async {
            if wakeable {
                wake.notified().await
            } else {
                std::future::pending().await
            }
        };

        tokio::select! {
            _ = tokio::time::sleep(duration) => SleepOutcome::Elapsed,
            _ = shutdown_requested(&mut self.shutdown) => SleepOutcome::Shutdown,
            _ = woken => SleepOutcome::Woken,
        }
    }
}

async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    // A dropped sender can never request shutdown.
    if rx.wait_for(|requested| *requested).await.is_err() {
        std::future::pending::<()>().await;
    }
}

pub(crate) fn channel() -> (SignalSource, LoopSignals) {
    let (tx, rx) = watch::channel(false);
    let wake = Arc::new(Notify::new());
    (
        SignalSource {
            shutdown: Arc::new(tx),
            wake: Arc::clone(&wake),
        },
        LoopSignals { shutdown: rx, wake },
    )
}

/// Route process signals into a fresh channel.
pub(crate) fn install() -> Result<LoopSignals> {
    let mut sigint = signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;
    let mut sigterm =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let mut sigusr1 =
        signal(SignalKind::user_defined1()).context("failed to install SIGUSR1 handler")?;

    let (source, signals) = channel();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = sigint.recv() => {
                    info!("caught SIGINT, exiting");
                    source.request_shutdown();
                }
                _ = sigterm.recv() => {
                    info!("caught SIGTERM, exiting");
                    source.request_shutdown();
                }
                _ = sigusr1.recv() => {
                    info!("caught SIGUSR1, waking");
                    source.wake();
                }
            }
        }
    });

    Ok(signals)
}
