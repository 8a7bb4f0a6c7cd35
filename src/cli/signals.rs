//! Process signals that end a running command.

use std::future::Future;

use tracing::warn;

/// Start listening for SIGTERM. The handler is installed when this is
/// called, so a signal arriving before the future is polled is not lost.
///
/// Must be called inside a tokio runtime.
#[cfg(unix)]
pub fn terminate_signal() -> impl Future<Output = ()> {
    use tokio::signal::unix::{signal, SignalKind};

    let listener = signal(SignalKind::terminate());
    async move {
        match listener {
            Ok(mut listener) => {
                listener.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "could not listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    }
}

/// No SIGTERM on this platform; never resolves.
#[cfg(not(unix))]
pub fn terminate_signal() -> impl Future<Output = ()> {
    std::future::pending::<()>()
}
