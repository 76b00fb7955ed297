use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::fs::ops::Dispatcher;

/// Start a background thread that periodically force-releases write locks
/// older than `max_age`. A holder that died without closing its file would
/// otherwise keep the path locked forever.
pub fn start_lock_sweeper(
    dispatcher: Dispatcher,
    max_age: Duration,
    shutdown: Arc<AtomicBool>,
) -> std::io::Result<std::thread::JoinHandle<()>> {
    let check_interval = Duration::from_secs(60);

    std::thread::Builder::new()
        .name("rowfs-lock-sweeper".to_string())
        .spawn(move || {
            debug!("Lock sweeper started, max_age={:?}", max_age);
            while !shutdown.load(Ordering::Relaxed) {
                // Sleep in 1-second ticks so we notice the shutdown flag promptly.
                let mut remaining = check_interval;
                let tick = Duration::from_secs(1);
                while remaining > Duration::ZERO {
                    if shutdown.load(Ordering::Relaxed) {
                        break;
                    }
                    let sleep_time = remaining.min(tick);
                    std::thread::sleep(sleep_time);
                    remaining = remaining.saturating_sub(sleep_time);
                }
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
                match dispatcher.sweep_stale_locks(max_age) {
                    Ok(swept) if !swept.is_empty() => {
                        info!("Lock sweep released {} stale lock(s)", swept.len());
                    }
                    Ok(_) => {}
                    Err(e) => error!("Lock sweep failed: {}", e),
                }
            }
            debug!("Lock sweeper shutting down");
        })
}
