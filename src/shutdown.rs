use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Install a shutdown handler listening for SIGTERM and SIGINT.
///
/// Returns a `CancellationToken` that fires when either signal arrives.
/// Every long-running loop (dispatch, materialization, subscriptions, the
/// servers themselves) watches this token and drains gracefully, which is
/// what makes a clean exit code 0 possible.
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let handler_token = token.clone();

    tokio::spawn(async move {
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }

        handler_token.cancel();
    });

    token
}
