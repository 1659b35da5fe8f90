use owo_colors::OwoColorize;
use tokio_util::sync::CancellationToken;

/// Cancels `token` once the process receives SIGINT (Ctrl+C) or SIGTERM
/// (pod shutdown). Spawned once at controller startup; everything that must
/// wind down on shutdown selects against the token, so the leader loop,
/// in-flight reconciles and the lease all observe one signal.
pub fn trigger_on_signal(token: CancellationToken) {
    tokio::spawn(async move {
        wait_for_signal().await;
        token.cancel();
    });
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigint = signal(SignalKind::interrupt()).expect("install SIGINT handler");
        let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");

        tokio::select! {
            _ = sigint.recv()  => eprintln!("{}", "🛑 Shutting down on SIGINT".red()),
            _ = sigterm.recv() => eprintln!("{}", "🛑 Shutting down on SIGTERM".red()),
        }
    }

    #[cfg(not(unix))]
    {
        // Only Ctrl+C is available off Unix.
        tokio::signal::ctrl_c()
            .await
            .expect("install Ctrl+C handler");
        eprintln!("{}", "🛑 Shutting down on Ctrl+C".red());
    }
}
