use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Install a handler that listens for SIGTERM and SIGINT.
///
/// Returns a `CancellationToken` that is cancelled on the first signal. The
/// batch runner watches it and stops the active batch, so reconstruction
/// processes are terminated instead of orphaned.
pub fn install_shutdown_handler() -> std::io::Result<CancellationToken> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let token = CancellationToken::new();
    let token_clone = token.clone();

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, stopping batch");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, stopping batch");
            }
        }

        token_clone.cancel();
    });

    Ok(token)
}
