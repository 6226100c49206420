//! Process-wide signal dispositions.
//!
//! A peer that resets a half-written socket raises SIGPIPE, whose default
//! action kills the process. SIGALRM and SIGCHLD defaults are equally hostile
//! to long-lived I/O threads. [`ignore_disruptive_signals`] sets all three to
//! `SIG_IGN` exactly once per process; the dispositions are never restored.

use std::sync::Once;

use log::{debug, warn};

static IGNORE_SIGNALS: Once = Once::new();

/// Ignores SIGPIPE, SIGALRM and SIGCHLD for the whole process.
///
/// Safe to call any number of times from any thread; only the first call
/// touches the dispositions. [`NetworkEngine::new`](crate::NetworkEngine::new)
/// calls it before any I/O thread exists.
pub fn ignore_disruptive_signals() {
    IGNORE_SIGNALS.call_once(install);
}

/// Whether the dispositions have been installed in this process.
pub fn signals_ignored() -> bool {
    IGNORE_SIGNALS.is_completed()
}

#[cfg(unix)]
fn install() {
    for (signal, name) in [
        (libc::SIGPIPE, "SIGPIPE"),
        (libc::SIGALRM, "SIGALRM"),
        (libc::SIGCHLD, "SIGCHLD"),
    ] {
        // SAFETY: SIG_IGN installs no handler code, and this runs once under `Once`.
        let previous = unsafe { libc::signal(signal, libc::SIG_IGN) };
        if previous == libc::SIG_ERR {
            warn!("failed to ignore {}", name);
        } else {
            debug!("{} disposition set to SIG_IGN", name);
        }
    }
}

#[cfg(not(unix))]
fn install() {}
