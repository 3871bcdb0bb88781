use std::io;

use signal_hook::consts::SIGUSR1;

/// Signal used to interrupt a stage thread blocked in a syscall.
///
/// The handler does nothing; its only purpose is to make the interrupted
/// syscall return `EINTR` so the stage gets a chance to observe its cancel
/// flag. Stages must therefore treat `EINTR` as "re-check state", never as a
/// hard error.
pub const WAKEUP_SIGNAL: libc::c_int = SIGUSR1;

extern "C" fn noop_handler(_: libc::c_int) {}

/// Install the process-wide no-op handler for [`WAKEUP_SIGNAL`].
///
/// Registered through raw `sigaction` instead of the signal-hook registry:
/// the registry sets `SA_RESTART`, which would transparently restart the
/// very syscalls this signal exists to break out of.
///
/// Must be called before the first chain runs; failing to install it is
/// fatal for the embedding process because cancellation of blocked stages
/// would deadlock.
pub fn install_wakeup_handler() -> io::Result<()> {
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = noop_handler as extern "C" fn(libc::c_int) as usize;
        sa.sa_flags = 0;
        libc::sigemptyset(&mut sa.sa_mask);
        if libc::sigaction(WAKEUP_SIGNAL, &sa, std::ptr::null_mut()) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Identity of a running stage thread, kept so the chain can poke it out of
/// a blocking read/write during cancelled teardown.
#[derive(Clone, Copy, Debug)]
pub struct ThreadKick {
    tid: libc::pthread_t,
}

impl ThreadKick {
    pub fn current() -> Self {
        Self { tid: unsafe { libc::pthread_self() } }
    }

    /// Deliver [`WAKEUP_SIGNAL`] to the thread. Returns false when the
    /// thread is already gone, which is fine during teardown races.
    pub fn kick(&self) -> bool {
        unsafe { libc::pthread_kill(self.tid, WAKEUP_SIGNAL) == 0 }
    }
}
