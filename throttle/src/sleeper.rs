//! Blocking suspension used by the synchronous throttling path.
//!
//! The throttler never sleeps directly; it hands the computed pause to a [`Sleeper`]. The default
//! [`ThreadSleeper`] parks the calling thread. [`InterruptibleSleeper`] additionally lets another
//! thread cut the pause short through an [`Interrupter`] handle, which surfaces as
//! [`Error::Interrupted`](crate::Error::Interrupted) from the throttle call.

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

/// The pause ended before the requested duration elapsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interrupted;

/// Suspends the calling thread.
pub trait Sleeper: Send + Sync + std::fmt::Debug {
    fn sleep(&self, duration: Duration) -> Result<(), Interrupted>;
}

/// Plain `std::thread::sleep`; cannot be interrupted.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) -> Result<(), Interrupted> {
        std::thread::sleep(duration);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Interrupts {
    // bumped by every interrupt, a pause fails once it changes
    generation: u64,
    sleeping: usize,
    // interrupt raised while nobody was sleeping
    pending: bool,
}

#[derive(Debug, Default)]
struct InterruptState {
    interrupts: Mutex<Interrupts>,
    wakeup: Condvar,
}

/// A sleeper whose pauses can be interrupted from other threads.
///
/// An interrupt fails every pause in progress on this sleeper or its clones. Interrupting while
/// nobody is sleeping makes the next pause fail immediately.
#[derive(Debug, Default, Clone)]
pub struct InterruptibleSleeper {
    state: Arc<InterruptState>,
}

impl InterruptibleSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interrupter(&self) -> Interrupter {
        Interrupter {
            state: self.state.clone(),
        }
    }
}

impl Sleeper for InterruptibleSleeper {
    fn sleep(&self, duration: Duration) -> Result<(), Interrupted> {
        // None when the pause is too long to be represented, then only an interrupt ends it
        let deadline = std::time::Instant::now().checked_add(duration);
        let mut interrupts = self
            .state
            .interrupts
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if interrupts.pending {
            interrupts.pending = false;
            return Err(Interrupted);
        }
        let generation = interrupts.generation;
        interrupts.sleeping += 1;
        let result = loop {
            if interrupts.generation != generation {
                break Err(Interrupted);
            }
            // spurious wakeups just loop around and wait for the remainder
            interrupts = match deadline {
                Some(deadline) => {
                    let now = std::time::Instant::now();
                    if now >= deadline {
                        break Ok(());
                    }
                    self.state
                        .wakeup
                        .wait_timeout(interrupts, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
                None => self
                    .state
                    .wakeup
                    .wait(interrupts)
                    .unwrap_or_else(PoisonError::into_inner),
            };
        };
        interrupts.sleeping -= 1;
        result
    }
}

/// Handle used to interrupt an [`InterruptibleSleeper`].
#[derive(Debug, Clone)]
pub struct Interrupter {
    state: Arc<InterruptState>,
}

impl Interrupter {
    pub fn interrupt(&self) {
        let mut interrupts = self
            .state
            .interrupts
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        interrupts.generation = interrupts.generation.wrapping_add(1);
        if interrupts.sleeping == 0 {
            interrupts.pending = true;
        }
        self.state.wakeup.notify_all();
    }
}
