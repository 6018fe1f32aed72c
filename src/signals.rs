//! OS signal routing.
//!
//! Translates external termination signals into one cancellation of the root
//! scope. The router never signals children itself; executors observe the
//! cancellation and walk their own termination path.

use tokio_util::sync::CancellationToken;

/// Spawns the signal router.
///
/// The first interrupt or termination signal cancels `root` and lets the
/// graceful shutdown run; a second signal exits the process immediately with
/// the conventional interrupt code.
pub fn spawn_router(root: CancellationToken) {
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("received interrupt signal, shutting down");
        root.cancel();
        wait_for_signal().await;
        tracing::warn!("second signal, exiting immediately");
        std::process::exit(130);
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
