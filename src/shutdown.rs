use tokio::signal::unix::{signal, SignalKind};

/// Which signal asked the process to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Terminate,
    Interrupt,
}

/// Resolves on the first SIGTERM or SIGINT.
///
/// The caller is expected to hand off to
/// [`Orchestrator::shutdown`](crate::Orchestrator::shutdown) so that running
/// attempts drain within the grace period.
pub async fn wait_for_signal() -> std::io::Result<ShutdownSignal> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let received = tokio::select! {
        _ = sigterm.recv() => ShutdownSignal::Terminate,
        _ = sigint.recv() => ShutdownSignal::Interrupt,
    };
    tracing::info!(signal = ?received, "Received shutdown signal, draining");
    Ok(received)
}
