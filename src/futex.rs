//! Raw Linux futex wait/wake wrappers.
//!
//! Cross-process synchronization here is a shared 32-bit atomic word and
//! the kernel wait/wake primitive directly — the literal `futex(2)`
//! syscall, not an abstraction layered over it, so this module is a thin
//! `libc::syscall(SYS_futex, ...)` wrapper rather than a dependency.

use core::sync::atomic::AtomicU32;
use std::io;

#[cfg(target_os = "linux")]
const FUTEX_WAIT: libc::c_int = libc::FUTEX_WAIT;
#[cfg(target_os = "linux")]
const FUTEX_WAKE: libc::c_int = libc::FUTEX_WAKE;
#[cfg(target_os = "linux")]
const FUTEX_PRIVATE_FLAG: libc::c_int = 0; // shared across processes: no PRIVATE flag

/// Blocks the calling thread while `word` still equals `expected`.
///
/// Returns `Ok(())` on a real wakeup, a spurious return, *or* `EAGAIN`
/// (meaning the word had already changed by the time the kernel looked) —
/// all three are indistinguishable to the caller, which is expected to
/// re-check the word itself and loop. Any other errno is fatal and is
/// returned so the caller can log it before aborting.
#[cfg(target_os = "linux")]
pub fn futex_wait(word: &AtomicU32, expected: u32) -> io::Result<()> {
    let rc = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word as *const AtomicU32 as *const u32,
            FUTEX_WAIT | FUTEX_PRIVATE_FLAG,
            expected,
            std::ptr::null::<libc::timespec>(),
        )
    };
    if rc == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::EAGAIN) | Some(libc::EINTR) => Ok(()),
        _ => Err(err),
    }
}

/// Wakes up to `n` waiters blocked on `word`. Release paths here wake all
/// waiters unconditionally (the expected waiter count is small and
/// eviction is cheap), so callers pass `i32::MAX` for "all".
#[cfg(target_os = "linux")]
pub fn futex_wake(word: &AtomicU32, n: i32) -> io::Result<()> {
    let rc = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word as *const AtomicU32 as *const u32,
            FUTEX_WAKE | FUTEX_PRIVATE_FLAG,
            n,
        )
    };
    if rc >= 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Wakes every waiter blocked on `word`.
#[cfg(target_os = "linux")]
#[inline]
pub fn futex_wake_all(word: &AtomicU32) -> io::Result<()> {
    futex_wake(word, i32::MAX)
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn wake_without_waiters_is_a_noop() {
        let word = AtomicU32::new(0);
        futex_wake_all(&word).unwrap();
    }

    #[test]
    fn wait_returns_immediately_when_value_already_changed() {
        let word = AtomicU32::new(1);
        // expected=0 but word is 1: kernel sees mismatch -> EAGAIN -> Ok(()).
        futex_wait(&word, 0).unwrap();
    }

    #[test]
    fn wake_unblocks_a_waiting_thread() {
        let word = Arc::new(AtomicU32::new(0));
        let waiter = {
            let word = Arc::clone(&word);
            thread::spawn(move || {
                futex_wait(&word, 0).unwrap();
            })
        };
        // Give the waiter a moment to actually block.
        thread::sleep(Duration::from_millis(50));
        word.store(1, Ordering::SeqCst);
        futex_wake_all(&word).unwrap();
        waiter.join().unwrap();
    }
}
