//! Graceful shutdown support via atomic flag
//!
//! The pipeline checks the flag between batches, so an interrupted run stops
//! at a batch boundary and leaves freshness metadata untouched.

use std::sync::atomic::{AtomicBool, Ordering};

/// Global shutdown flag, set by the SIGTERM/SIGINT handler
fn shutdown_flag() -> &'static AtomicBool {
    static FLAG: AtomicBool = AtomicBool::new(false);
    &FLAG
}

/// Check if shutdown was requested
pub fn is_shutdown_requested() -> bool {
    shutdown_flag().load(Ordering::Relaxed)
}

/// Request shutdown (for signal handlers)
pub fn request_shutdown() {
    shutdown_flag().store(true, Ordering::Relaxed);
}

/// Route SIGINT/SIGTERM to [`request_shutdown`].
///
/// A second signal while the flag is already set exits immediately.
pub fn install_signal_handlers() -> std::io::Result<()> {
    use signal_hook::consts::{SIGINT, SIGTERM};

    for signal in [SIGINT, SIGTERM] {
        // SAFETY: the handler only touches an atomic and calls
        // `low_level::exit` (`_exit`); neither allocates or takes locks.
        unsafe {
            signal_hook::low_level::register(signal, || {
                if is_shutdown_requested() {
                    signal_hook::low_level::exit(130);
                }
                request_shutdown();
            })?;
        }
    }
    Ok(())
}
