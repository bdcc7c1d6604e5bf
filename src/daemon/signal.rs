//! POSIX signals understood by the daemon.

use std::fmt;

use crate::error::{Error, Result};

/// Signals the supervisor sends to the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonSignal {
    /// SIGHUP: reload config and build fresh circuits.
    RotateIdentity,
    /// SIGINT: graceful shutdown.
    Shutdown,
    /// SIGKILL: used only when bootstrap times out.
    Kill,
}

impl DaemonSignal {
    pub fn name(self) -> &'static str {
        match self {
            DaemonSignal::RotateIdentity => "SIGHUP",
            DaemonSignal::Shutdown => "SIGINT",
            DaemonSignal::Kill => "SIGKILL",
        }
    }

    #[cfg(unix)]
    fn raw(self) -> libc::c_int {
        match self {
            DaemonSignal::RotateIdentity => libc::SIGHUP,
            DaemonSignal::Shutdown => libc::SIGINT,
            DaemonSignal::Kill => libc::SIGKILL,
        }
    }
}

impl fmt::Display for DaemonSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Deliver `signal` to `pid`.
#[cfg(unix)]
pub fn send(pid: u32, signal: DaemonSignal) -> Result<()> {
    let pid_t = libc::pid_t::try_from(pid).map_err(|_| Error::Signal {
        signal: signal.name(),
        pid,
        source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "pid out of range"),
    })?;

    // SAFETY: kill(2) has no memory-safety preconditions.
    let rc = unsafe { libc::kill(pid_t, signal.raw()) };
    if rc != 0 {
        return Err(Error::Signal {
            signal: signal.name(),
            pid,
            source: std::io::Error::last_os_error(),
        });
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn send(pid: u32, signal: DaemonSignal) -> Result<()> {
    Err(Error::Signal {
        signal: signal.name(),
        pid,
        source: std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "POSIX signals are not available on this platform",
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_names() {
        assert_eq!(DaemonSignal::RotateIdentity.to_string(), "SIGHUP");
        assert_eq!(DaemonSignal::Shutdown.to_string(), "SIGINT");
        assert_eq!(DaemonSignal::Kill.to_string(), "SIGKILL");
    }

    #[cfg(unix)]
    #[test]
    fn test_send_to_missing_pid_fails() {
        // pid_max on Linux is at most 2^22
        let err = send(u32::MAX >> 1, DaemonSignal::RotateIdentity).unwrap_err();
        assert!(matches!(err, Error::Signal { signal: "SIGHUP", .. }));
    }
}
