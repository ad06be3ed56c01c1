//! Bounded exponential-backoff reconnect controller.
//!
//! Wraps a "time to try again" notification channel. `try_schedule` arms
//! a one-shot timer for `min(3600s, base << tries)` and bumps the try
//! counter; the owner hears the expiry on the receiver and attempts its
//! connect. A successful connect calls `reset`, which also cancels any
//! timer still pending. Dropping the controller cancels the timer.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Hard ceiling on a single backoff delay.
const MAX_DELAY: Duration = Duration::from_secs(3600);

pub struct Reconnect {
    base: Duration,
    /// 0 means unlimited tries.
    max_tries: u32,
    current_try: u32,
    pending: Option<JoinHandle<()>>,
    fire_tx: mpsc::Sender<()>,
}

impl Reconnect {
    /// Returns the controller and the channel on which scheduled tries
    /// fire.
    pub fn new(base: Duration, max_tries: u32) -> (Self, mpsc::Receiver<()>) {
        let (fire_tx, fire_rx) = mpsc::channel(1);
        (
            Reconnect {
                base,
                max_tries,
                current_try: 0,
                pending: None,
                fire_tx,
            },
            fire_rx,
        )
    }

    /// Whether the try budget is exhausted.
    pub fn too_much(&self) -> bool {
        self.max_tries > 0 && self.current_try >= self.max_tries
    }

    /// The delay the next `try_schedule` would arm.
    pub fn next_delay(&self) -> Duration {
        delay_for_try(self.base, self.current_try)
    }

    /// Schedule the next try. Returns `false` when the budget is spent;
    /// `true` when a try is pending (newly armed or already in flight).
    pub fn try_schedule(&mut self) -> bool {
        if self.too_much() {
            return false;
        }
        if let Some(pending) = &self.pending {
            if !pending.is_finished() {
                return true;
            }
        }
        let delay = self.next_delay();
        let tx = self.fire_tx.clone();
        self.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(()).await;
        }));
        self.current_try += 1;
        true
    }

    /// Cancel any pending try and zero the counter; called after a
    /// successful connect.
    pub fn reset(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.abort();
        }
        self.current_try = 0;
    }
}

impl Drop for Reconnect {
    fn drop(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.abort();
        }
    }
}

/// `min(3600s, base * 2^tries)`, saturating.
fn delay_for_try(base: Duration, tries: u32) -> Duration {
    let factor = 1u64.checked_shl(tries).unwrap_or(u64::MAX);
    let delay = base
        .checked_mul(factor.min(u32::MAX as u64) as u32)
        .unwrap_or(MAX_DELAY);
    delay.min(MAX_DELAY)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
