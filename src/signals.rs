/// Signal handling for graceful shutdown.
///
/// SIGINT (Ctrl-C) and SIGTERM both request shutdown: stop accepting
/// viewers, stop the worker, release the lock.
use tokio::signal::unix::{signal, SignalKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Interrupt,
    Terminate,
}

/// Resolves on the first SIGINT or SIGTERM.
pub async fn wait_for_shutdown() -> ShutdownSignal {
    let mut term = match signal(SignalKind::terminate()) {
        Ok(s) => Some(s),
        Err(e) => {
            tracing::warn!(error = %e, "failed to install SIGTERM handler");
            None
        }
    };
    let terminate = async {
        match term.as_mut() {
            Some(s) => {
                s.recv().await;
            }
            None => std::future::pending::<()>().await,
        }
    };

    let received = tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::warn!(error = %e, "failed to listen for SIGINT");
                std::future::pending::<()>().await;
            }
            ShutdownSignal::Interrupt
        }
        _ = terminate => ShutdownSignal::Terminate,
    };
    tracing::info!(signal = ?received, "shutdown requested");
    received
}
