//! Utility code that doesn't belong anywhere specific.

use std::thread::JoinHandle;

use anyhow::{Error, bail};

/// Join a worker thread, turning a panic into an error.
pub fn join_worker<T>(handle: JoinHandle<Result<T, Error>>) -> Result<T, Error> {
    match handle.join() {
        Ok(result) => result,
        Err(panic) => {
            let msg = match (panic.downcast_ref::<&str>(), panic.downcast_ref::<String>()) {
                (Some(&s), _) => s,
                (_, Some(s)) => s,
                (None, None) => "<No panic message>",
            };
            bail!("Capture worker panic: {msg}");
        }
    }
}

/// Convert 60MHz clock ticks to nanoseconds, rounding down.
pub fn ticks_to_ns(ticks: u64) -> u64 {
    const TABLE: [u64; 3] = [0, 16, 33];
    let quotient = ticks / 3;
    let remainder = ticks % 3;
    quotient * 50 + TABLE[remainder as usize]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_conversion() {
        assert_eq!(ticks_to_ns(0), 0);
        assert_eq!(ticks_to_ns(1), 16);
        assert_eq!(ticks_to_ns(2), 33);
        assert_eq!(ticks_to_ns(60_000_000), 1_000_000_000);
    }

    #[test]
    fn worker_panic_is_error() {
        let handle = std::thread::spawn(|| -> Result<(), Error> { panic!("boom") });
        let err = join_worker(handle).unwrap_err();
        assert!(err.to_string().contains("boom"));

        let handle = std::thread::spawn(|| -> Result<u8, Error> { Ok(7) });
        assert_eq!(join_worker(handle).unwrap(), 7);
    }
}
