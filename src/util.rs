//! # Utility Functions and Helper Module
//!
//! Small building blocks shared across the engine:
//!
//! - **Cancellable timers**: single-shot and refreshable deadline timers
//!   backed by abortable tasks
//! - **Identifier generation**: url-safe session ids and cache-busting
//!   request tokens
//!
//! The refreshable timer deliberately re-checks the wall clock on every
//! wakeup: if the runtime was throttled past the deadline, expiry is
//! detected lazily on the next observation instead of being missed.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::RngCore;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// A single-shot cancellable timer.
///
/// Runs the given future once the delay elapses. `cancel` is safe from any
/// context and idempotent; dropping the timer cancels it as well.
#[derive(Debug)]
pub struct Timer {
    handle: JoinHandle<()>,
}

impl Timer {
    /// Schedule `task` to run after `delay`
    pub fn after<F>(delay: Duration, task: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            task.await;
        });
        Self { handle }
    }

    /// Cancel the timer; the task will not run if it has not started yet
    pub fn cancel(&self) {
        self.handle.abort();
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// A refreshable deadline timer.
///
/// Fires its expiry future once the deadline passes without a refresh.
/// Resetting moves the deadline without churning the underlying task. The
/// expiry check compares against the clock on every wakeup, so a deadline
/// that should have fired during a stall is honored on the next wakeup.
#[derive(Debug)]
pub struct RefreshableTimer {
    deadline: Arc<Mutex<Instant>>,
    notify: Arc<Notify>,
    handle: JoinHandle<()>,
}

impl RefreshableTimer {
    /// Start the timer with an initial window
    pub fn start<F>(window: Duration, on_expire: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let deadline = Arc::new(Mutex::new(Instant::now() + window));
        let notify = Arc::new(Notify::new());

        let task_deadline = Arc::clone(&deadline);
        let task_notify = Arc::clone(&notify);
        let handle = tokio::spawn(async move {
            loop {
                let target = *task_deadline.lock().expect("deadline lock");
                if Instant::now() >= target {
                    break;
                }
                tokio::select! {
                    _ = tokio::time::sleep_until(target) => {}
                    _ = task_notify.notified() => {}
                }
            }
            on_expire.await;
        });

        Self {
            deadline,
            notify,
            handle,
        }
    }

    /// Push the deadline out to `window` from now
    pub fn reset(&self, window: Duration) {
        *self.deadline.lock().expect("deadline lock") = Instant::now() + window;
        self.notify.notify_one();
    }

    /// Cancel the timer; expiry will not run. Idempotent.
    pub fn cancel(&self) {
        self.handle.abort();
    }
}

impl Drop for RefreshableTimer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Generate a fresh session id: 15 random bytes in url-safe base64,
/// yielding a 20-character opaque token
pub fn generate_sid() -> String {
    let mut bytes = [0u8; 15];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Alphabet for compact timestamp tokens, ordered so tokens sort by time
const TOKEN_ALPHABET: &[u8; 64] =
    b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz-_";

/// Generate a cache-busting request token: the current epoch milliseconds
/// in a compact base-64 alphabet, plus two random characters so that two
/// requests within the same millisecond still differ
pub fn timestamp_token() -> String {
    let millis = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;

    let mut out = String::with_capacity(10);
    let mut value = millis;
    loop {
        out.insert(0, TOKEN_ALPHABET[(value % 64) as usize] as char);
        value /= 64;
        if value == 0 {
            break;
        }
    }

    let mut rng = rand::thread_rng();
    for _ in 0..2 {
        out.push(TOKEN_ALPHABET[(rng.next_u32() % 64) as usize] as char);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn timer_fires_after_delay() {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        let _timer = Timer::after(Duration::from_millis(10), async move {
            flag.store(true, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn cancelled_timer_does_not_fire() {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        let timer = Timer::after(Duration::from_millis(10), async move {
            flag.store(true, Ordering::SeqCst);
        });
        timer.cancel();
        timer.cancel(); // idempotent
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn refreshable_timer_reset_extends_the_deadline() {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        let timer = RefreshableTimer::start(Duration::from_millis(40), async move {
            flag.store(true, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(25)).await;
        timer.reset(Duration::from_millis(40));
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert!(!fired.load(Ordering::SeqCst));

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn session_ids_are_urlsafe_and_unique() {
        let a = generate_sid();
        let b = generate_sid();
        assert_eq!(a.len(), 20);
        assert_ne!(a, b);
        assert!(a
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn timestamp_tokens_differ() {
        assert_ne!(timestamp_token(), timestamp_token());
    }
}
