//! OS abstraction
//!
//! The manager needs very little from its environment: a counting signal
//! to wake the task that delivers completions, a delay for blocking
//! transfers, and a way to tell whether interrupts can make progress
//! while the caller spins.
//!
//! - [`BareMetal`] delivers completions inline, from whatever context
//!   observed them.
//! - [`TaskSignal`] defers them to a task, which calls
//!   [`SerialManager::poll`](crate::SerialManager::poll) or
//!   [`SerialManager::run_task`](crate::SerialManager::run_task).

use portable_atomic::{AtomicU32, Ordering};

use crate::config::{CFG_CPU_CLOCK_HZ, CFG_HOST_SPINS_PER_MS};
use crate::critical::is_isr_context;
use crate::error::SerialResult;

/// Services the manager consumes from the surrounding OS
pub trait Osa {
    /// Completions go through the semaphore and a task rather than inline
    fn deferred(&self) -> bool;

    fn semaphore_create(&self) -> SerialResult<()> {
        Ok(())
    }

    fn semaphore_destroy(&self) {}

    fn semaphore_post(&self);

    /// Take one count if available
    fn semaphore_try_wait(&self) -> bool;

    /// Take one count, waiting as long as needed
    fn semaphore_wait(&self) -> bool {
        while !self.semaphore_try_wait() {
            core::hint::spin_loop();
        }
        true
    }

    fn time_delay(&self, ms: u32);

    /// A spinning caller must service the backend itself, because no
    /// interrupt can preempt it
    fn need_polling_isr(&self) -> bool {
        interrupts_unavailable()
    }
}

/// Interrupts cannot run: either we are inside a handler, or there is no
/// interrupt controller at all (host builds)
#[inline]
fn interrupts_unavailable() -> bool {
    cfg!(not(target_arch = "arm")) || is_isr_context()
}

fn busy_delay(ms: u32) {
    #[cfg(target_arch = "arm")]
    {
        cortex_m::asm::delay((CFG_CPU_CLOCK_HZ / 1_000).saturating_mul(ms));
    }

    #[cfg(not(target_arch = "arm"))]
    {
        let _ = CFG_CPU_CLOCK_HZ;
        for _ in 0..ms.saturating_mul(CFG_HOST_SPINS_PER_MS) {
            core::hint::spin_loop();
        }
    }
}

// ============ Bare metal ============

/// No OS: completions are delivered from the callback that observed them
#[derive(Debug, Clone, Copy, Default)]
pub struct BareMetal;

impl Osa for BareMetal {
    fn deferred(&self) -> bool {
        false
    }

    fn semaphore_post(&self) {}

    fn semaphore_try_wait(&self) -> bool {
        false
    }

    fn semaphore_wait(&self) -> bool {
        false
    }

    fn time_delay(&self, ms: u32) {
        busy_delay(ms);
    }
}

// ============ Task signal ============

/// Counting semaphore for a cooperative serial manager task
///
/// Callbacks post, the task takes. The count saturates instead of
/// wrapping.
#[derive(Debug, Default)]
pub struct TaskSignal {
    count: AtomicU32,
}

impl TaskSignal {
    pub const fn new() -> Self {
        TaskSignal {
            count: AtomicU32::new(0),
        }
    }

    /// Posts not taken yet
    pub fn pending(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }
}

impl Osa for TaskSignal {
    fn deferred(&self) -> bool {
        true
    }

    fn semaphore_create(&self) -> SerialResult<()> {
        self.count.store(0, Ordering::Release);
        Ok(())
    }

    fn semaphore_destroy(&self) {
        self.count.store(0, Ordering::Release);
    }

    fn semaphore_post(&self) {
        let _ = self
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_add(1));
    }

    fn semaphore_try_wait(&self) -> bool {
        self.count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }

    fn semaphore_wait(&self) -> bool {
        while !self.semaphore_try_wait() {
            #[cfg(target_arch = "arm")]
            cortex_m::asm::wfi();
            #[cfg(not(target_arch = "arm"))]
            core::hint::spin_loop();
        }
        true
    }

    fn time_delay(&self, ms: u32) {
        busy_delay(ms);
    }
}
