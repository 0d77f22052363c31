//! Async-signal-safe interruption flags.
//!
//! Handlers only store the signal number; the pipeline polls it at its state
//! transitions and the executor while waiting for sandboxed processes. The
//! handlers are installed without `SA_RESTART`, so a blocking `waitpid` or
//! terminal read returns `EINTR` and the caller gets to look at the flag.

#![allow(unsafe_code)]

use std::sync::atomic::{AtomicI32, Ordering};

use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use tracing::debug;

use crate::error::ExecError;

/// Signals that interrupt the tool.
pub const HANDLED_SIGNALS: &[Signal] = &[
    Signal::SIGINT,
    Signal::SIGTERM,
    Signal::SIGHUP,
    Signal::SIGQUIT,
];

/// Last signal received, 0 if none is pending.
static PENDING: AtomicI32 = AtomicI32::new(0);

extern "C" fn record_signal(signal: libc::c_int) {
    PENDING.store(signal, Ordering::SeqCst);
}

/// Installs the handlers for [`HANDLED_SIGNALS`].
///
/// # Errors
///
/// Returns `ExecError::Process` if a handler cannot be installed.
pub fn install() -> Result<(), ExecError> {
    let action = SigAction::new(
        SigHandler::Handler(record_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );

    for sig in HANDLED_SIGNALS {
        // SAFETY: the handler only performs an atomic store.
        unsafe { signal::sigaction(*sig, &action) }
            .map_err(|e| ExecError::Process(format!("failed to install {sig} handler: {e}")))?;
    }

    debug!("Signal handlers installed");
    Ok(())
}

/// Takes the pending signal, if any.
pub fn take() -> Option<Signal> {
    match PENDING.swap(0, Ordering::SeqCst) {
        0 => None,
        raw => Signal::try_from(raw).ok(),
    }
}

/// True for signals that ask the whole tool to stop. Keyboard signals are
/// delivered to the sandboxed command directly and are not forwarded.
#[must_use]
pub fn is_termination(sig: Signal) -> bool {
    matches!(sig, Signal::SIGTERM | Signal::SIGHUP)
}

/// Shell-style exit status for a run stopped by `sig`.
#[must_use]
pub fn interrupted_exit_code(sig: i32) -> i32 {
    128 + sig
}
