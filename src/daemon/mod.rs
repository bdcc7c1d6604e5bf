//! Supervision of an isolated Tor daemon.
//!
//! The daemon is driven entirely through POSIX signals and observed through
//! its stdout: every state change is confirmed by a log marker.
//!
//! | Marker | Meaning |
//! |---|---|
//! | `Done` | bootstrap complete |
//! | `Received reload signal` | identity rotation acknowledged |
//! | `exiting cleanly` | graceful shutdown acknowledged |

mod marker;
mod process;
pub mod signal;
mod supervisor;

pub use marker::{
    await_marker, LogStream, Marker, MarkerMatcher, MarkerSet, MarkerWatch, SubstringMatcher,
};
pub use process::{ManagedProcess, ProcessState};
pub use signal::DaemonSignal;
pub use supervisor::{ProcessSupervisor, RetryPolicy, DEFAULT_MAX_ATTEMPTS, DEFAULT_SETTLE_DELAY};
