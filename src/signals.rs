use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use tokio::sync::watch;

/// Flip `shutdown` to `true` on the first SIGINT or SIGTERM.
pub fn handle_shutdown(shutdown: watch::Sender<bool>) -> std::io::Result<()> {
    let mut signals = Signals::new([SIGINT, SIGTERM])?;

    std::thread::spawn(move || {
        if let Some(signal) = signals.forever().next() {
            log::info!("Received signal {}, shutting down", signal);
            let _ = sd_notify::notify(true, &[sd_notify::NotifyState::Stopping]);
            let _ = shutdown.send(true);
        }
    });

    Ok(())
}
