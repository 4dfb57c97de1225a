//! The per-connection retransmission timer.
//!
//! Exactly one timer is logically active per connection.  It is split in two
//! halves joined by a `tokio::sync::watch` channel:
//! - [`TimerHandle`] lives inside the locked connection state.  Any task that
//!   holds the lock may [`arm`](TimerHandle::arm), [`cancel`](TimerHandle::cancel)
//!   or [`shutdown`](TimerHandle::shutdown) it.  Every arm bumps a generation
//!   counter, superseding whatever deadline was pending.
//! - [`TimerEvents`] is owned by the connection's receive loop, which awaits
//!   [`TimerEvents::expired`] alongside inbound datagrams.
//!
//! An expiry reports the generation it was armed with.  By the time the loop
//! re-acquires the lock the timer may have been re-armed or cancelled, so the
//! handler must check [`TimerHandle::is_current`] before acting.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

/// What the timer is currently doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerState {
    Idle,
    Armed { generation: u64, deadline: Instant },
    Shutdown,
}

/// Why the timer was armed; decides what an expiry means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerPurpose {
    /// Oldest in-flight segment has not been acknowledged.
    Retransmit,
    /// Peer advertised a zero window; time to probe it.
    Persist,
    /// TIME_WAIT linger elapsed.
    TimeWait,
}

/// Control half, held under the connection lock.
#[derive(Debug)]
pub struct TimerHandle {
    tx: watch::Sender<TimerState>,
    generation: u64,
    purpose: Option<TimerPurpose>,
}

/// Expiry half, owned by the receive loop.
#[derive(Debug)]
pub struct TimerEvents {
    rx: watch::Receiver<TimerState>,
    last_fired: Option<u64>,
}

/// Create a linked handle/events pair in the idle state.
pub fn timer() -> (TimerHandle, TimerEvents) {
    let (tx, rx) = watch::channel(TimerState::Idle);
    (
        TimerHandle {
            tx,
            generation: 0,
            purpose: None,
        },
        TimerEvents {
            rx,
            last_fired: None,
        },
    )
}

impl TimerHandle {
    /// Arm (or re-arm) the timer to fire `after` from now.
    ///
    /// Returns the new generation.
    pub fn arm(&mut self, after: Duration, purpose: TimerPurpose) -> u64 {
        if self.is_shut_down() {
            return self.generation;
        }
        self.generation += 1;
        self.purpose = Some(purpose);
        let deadline = Instant::now() + after;
        self.tx.send_replace(TimerState::Armed {
            generation: self.generation,
            deadline,
        });
        self.generation
    }

    /// Disarm without firing.
    pub fn cancel(&mut self) {
        if self.is_shut_down() {
            return;
        }
        self.generation += 1;
        self.purpose = None;
        self.tx.send_replace(TimerState::Idle);
    }

    /// Stop the timer for good; the receive loop sees `None` from
    /// [`TimerEvents::expired`] and exits.
    pub fn shutdown(&mut self) {
        self.generation += 1;
        self.purpose = None;
        self.tx.send_replace(TimerState::Shutdown);
    }

    /// `true` if `generation` is the most recent arm and has not been
    /// cancelled.
    pub fn is_current(&self, generation: u64) -> bool {
        self.purpose.is_some() && generation == self.generation
    }

    /// Purpose of the pending deadline, or `None` when idle.
    pub fn purpose(&self) -> Option<TimerPurpose> {
        self.purpose
    }

    pub fn is_shut_down(&self) -> bool {
        matches!(*self.tx.borrow(), TimerState::Shutdown)
    }
}

impl TimerEvents {
    /// Wait for the armed deadline to pass.
    ///
    /// Returns the generation that expired, or `None` once the timer has been
    /// shut down (or its handle dropped).  Cancel-safe: dropping the future
    /// loses nothing, the next call re-reads the current state.
    pub async fn expired(&mut self) -> Option<u64> {
        loop {
            let state = *self.rx.borrow_and_update();
            match state {
                TimerState::Shutdown => return None,
                TimerState::Armed {
                    generation,
                    deadline,
                } if self.last_fired != Some(generation) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(deadline) => {
                            self.last_fired = Some(generation);
                            return Some(generation);
                        }
                        changed = self.rx.changed() => changed.ok()?,
                    }
                }
                // Idle, or this deadline already fired: wait for a new arm.
                _ => self.rx.changed().await.ok()?,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn fires_with_the_armed_generation() {
        let (mut handle, mut events) = timer();
        let generation = handle.arm(Duration::from_millis(100), TimerPurpose::Retransmit);

        let fired = events.expired().await;
        assert_eq!(fired, Some(generation));
        assert!(handle.is_current(generation));
    }

    #[tokio::test(start_paused = true)]
    async fn rearm_supersedes_previous_deadline() {
        let (mut handle, mut events) = timer();
        let first = handle.arm(Duration::from_millis(50), TimerPurpose::Retransmit);
        let second = handle.arm(Duration::from_millis(500), TimerPurpose::Retransmit);
        assert_ne!(first, second);

        let start = Instant::now();
        assert_eq!(events.expired().await, Some(second));
        assert!(start.elapsed() >= Duration::from_millis(500));
        assert!(!handle.is_current(first));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_timer_does_not_fire() {
        let (mut handle, mut events) = timer();
        let generation = handle.arm(Duration::from_millis(10), TimerPurpose::Retransmit);
        handle.cancel();
        assert!(!handle.is_current(generation));
        assert_eq!(handle.purpose(), None);

        let waited = tokio::time::timeout(Duration::from_secs(5), events.expired()).await;
        assert!(waited.is_err(), "idle timer must not expire");
    }

    #[tokio::test(start_paused = true)]
    async fn same_generation_fires_once() {
        let (mut handle, mut events) = timer();
        let generation = handle.arm(Duration::from_millis(10), TimerPurpose::Persist);
        assert_eq!(events.expired().await, Some(generation));

        let again = tokio::time::timeout(Duration::from_secs(5), events.expired()).await;
        assert!(again.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_ends_the_event_stream() {
        let (mut handle, mut events) = timer();
        handle.arm(Duration::from_secs(1), TimerPurpose::TimeWait);
        handle.shutdown();
        assert_eq!(events.expired().await, None);

        // Arming after shutdown is a no-op.
        let generation = handle.arm(Duration::from_millis(1), TimerPurpose::Retransmit);
        assert!(!handle.is_current(generation));
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_handle_ends_the_event_stream() {
        let (handle, mut events) = timer();
        drop(handle);
        assert_eq!(events.expired().await, None);
    }
}
