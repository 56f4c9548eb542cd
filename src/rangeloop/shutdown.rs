//! Signal handling for the pass driver
//!
//! SIGINT and SIGTERM cancel the token shared by every pass, so the running
//! pass stops at its next batch boundary and the periodic driver returns.
//!
//! ```rust,no_run
//! use rangeloop::rangeloop::shutdown::cancel_on_signal;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() {
//! let cancel = CancellationToken::new();
//! let _signals = cancel_on_signal(cancel.clone());
//! cancel.cancelled().await;
//! # }
//! ```

use log::{error, info};
use std::fmt;
use std::io;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// The signal that requested shutdown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// SIGINT (Ctrl+C)
    Interrupt,
    /// SIGTERM (kill, Kubernetes, Docker)
    Terminate,
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownSignal::Interrupt => write!(f, "SIGINT (Ctrl+C)"),
            ShutdownSignal::Terminate => write!(f, "SIGTERM"),
        }
    }
}

/// Wait for SIGINT or SIGTERM
#[cfg(unix)]
pub async fn shutdown_signal() -> io::Result<ShutdownSignal> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let received = tokio::select! {
        _ = sigterm.recv() => ShutdownSignal::Terminate,
        _ = sigint.recv() => ShutdownSignal::Interrupt,
    };
    Ok(received)
}

/// Wait for Ctrl+C
#[cfg(not(unix))]
pub async fn shutdown_signal() -> io::Result<ShutdownSignal> {
    tokio::signal::ctrl_c().await?;
    Ok(ShutdownSignal::Interrupt)
}

/// Cancel `cancel` on the first shutdown signal.
///
/// The task also ends, without cancelling, when the token is cancelled by
/// someone else first.
pub fn cancel_on_signal(cancel: CancellationToken) -> JoinHandle<Option<ShutdownSignal>> {
    tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => None,
            received = shutdown_signal() => match received {
                Ok(signal) => {
                    info!("Received {}, stopping the ranged loop", signal);
                    cancel.cancel();
                    Some(signal)
                }
                Err(e) => {
                    // without handlers the loop can only be stopped externally
                    error!("Failed to install shutdown signal handlers: {}", e);
                    None
                }
            },
        }
    })
}
