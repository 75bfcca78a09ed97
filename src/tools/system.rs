//! Process level signal handling.

use tokio::signal::unix::{SignalKind, signal};

/// Waits until the process receives SIGINT, SIGTERM or SIGHUP.
///
/// Signals which cannot be subscribed to are skipped. If none can be
/// subscribed to, this falls back to waiting for CTRL-C.
pub async fn await_termination(purpose: &str) {
    let mut sig_int = signal(SignalKind::interrupt()).ok();
    let mut sig_term = signal(SignalKind::terminate()).ok();
    let mut sig_hup = signal(SignalKind::hangup()).ok();

    if sig_int.is_none() && sig_term.is_none() && sig_hup.is_none() {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Received CTRL-C. Shutting down: '{}'...", purpose);
        return;
    }

    tokio::select! {
        Some(_) = async { sig_int.as_mut()?.recv().await } => {
            tracing::info!("Received SIGINT. Shutting down: '{}'...", purpose);
        },
        Some(_) = async { sig_term.as_mut()?.recv().await } => {
            tracing::info!("Received SIGTERM. Shutting down: '{}'...", purpose);
        },
        Some(_) = async { sig_hup.as_mut()?.recv().await } => {
            tracing::info!("Received SIGHUP. Shutting down: '{}'...", purpose);
        },
        else => {
            tracing::warn!("Signal listeners closed. Shutting down: '{}'...", purpose);
        }
    }
}
