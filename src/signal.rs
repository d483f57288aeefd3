//! One-shot broadcast signals.
//!
//! A task announces its delivery decision through these: initially unfired,
//! fired at most effectively-once, observed by any number of waiters past and
//! future. The closed-channel idiom, as a latch.

use tokio_util::sync::CancellationToken;

/// A one-shot broadcast latch.
///
/// `fire` is idempotent and wakes every current and future observer;
/// [`Signal::fired`] resolves immediately once the latch has been fired.
/// Clones observe the same latch.
#[derive(Debug, Clone, Default)]
pub struct Signal {
    token: CancellationToken,
}

impl Signal {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Fires the signal. Subsequent calls are no-ops.
    pub fn fire(&self) {
        self.token.cancel();
    }

    /// Whether the signal has already been fired.
    pub fn is_fired(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the signal fires.
    pub async fn fired(&self) {
        self.token.cancelled().await;
    }
}
