use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

use crate::sys;

static PIPE_SERIAL: AtomicU32 = AtomicU32::new(0);

/// Returns the unique part of a pipe name:
/// `<pid:4hex><tid:4hex><tick:8hex><serial:8hex>`.
///
/// The serial is a process-wide counter, so two calls in the same process
/// never return the same token until it wraps; the pid, thread and tick
/// salts separate processes that reuse a pipe directory.
pub fn next_pipe_token() -> String {
    let serial = PIPE_SERIAL.fetch_add(1, Ordering::Relaxed);
    format_token(
        std::process::id(),
        sys::current_thread_id(),
        sys::tick_count(),
        serial,
    )
}

fn format_token(pid: u32, tid: u32, tick: u32, serial: u32) -> String {
    format!(
        "{:04x}{:04x}{tick:08x}{serial:08x}",
        pid & 0xffff,
        tid & 0xffff
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashSet;

    #[test]
    fn token_layout_is_fixed_width_hex() {
        assert_eq!(
            format_token(0x1_2345, 0xabcd_ef01, 0xdead_beef, 7),
            "2345ef01deadbeef00000007"
        );
    }

    #[test]
    fn tokens_are_unique_across_threads() {
        let handles: Vec<_> = (0..4)
            .map(|_| std::thread::spawn(|| (0..250).map(|_| next_pipe_token()).collect::<Vec<_>>()))
            .collect();
        let mut seen = HashSet::new();
        for handle in handles {
            let Ok(tokens) = handle.join() else {
                panic!("token thread panicked");
            };
            for token in tokens {
                assert_eq!(token.len(), 24);
                assert!(seen.insert(token), "duplicate pipe token");
            }
        }
        assert_eq!(seen.len(), 1000);
    }
}
