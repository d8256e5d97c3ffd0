//! Core type definitions for the serial manager
//!
//! These types provide strong typing for manager, handle and transfer state.

use core::ptr::NonNull;

use crate::error::SerialManagerStatus;

/// Completion callback
///
/// Invoked with the parameter registered alongside it, the transferred
/// region and the terminal status. Backends call the manager through the
/// same signature.
pub type SerialCallback = fn(param: *mut (), message: &CallbackMessage, status: SerialManagerStatus);

/// Low-power constraint hook, receives the power mode and returns a
/// backend-defined code
pub type LowpowerCriticalFn = fn(power_mode: i32) -> i32;

/// Pair of hooks that keep the system out of low power while a write is
/// in flight
#[derive(Debug, Clone, Copy, Default)]
pub struct LowpowerCriticalCallbacks {
    /// Called when a write is handed to the backend
    pub enter_critical: Option<LowpowerCriticalFn>,
    /// Called when a write completion has been delivered
    pub exit_critical: Option<LowpowerCriticalFn>,
}

/// Region handed to a completion callback
#[derive(Debug, Clone, Copy)]
pub struct CallbackMessage {
    /// Start of the region, `None` for ring buffer notifications
    pub buffer: Option<NonNull<u8>>,
    /// Number of bytes transferred or available
    pub length: usize,
}

impl CallbackMessage {
    pub const fn new(buffer: Option<NonNull<u8>>, length: usize) -> Self {
        CallbackMessage { buffer, length }
    }

    /// Message that only carries a byte count
    pub const fn notify(length: usize) -> Self {
        CallbackMessage { buffer: None, length }
    }

    /// View the transferred bytes
    ///
    /// # Safety
    /// `buffer` must still point to `length` initialized bytes. This holds
    /// for the duration of the callback the message was passed to.
    pub unsafe fn data(&self) -> &[u8] {
        match self.buffer {
            Some(ptr) => unsafe { core::slice::from_raw_parts(ptr.as_ptr(), self.length) },
            None => &[],
        }
    }
}

/// Whether the manager runs the queued, interrupt-driven machinery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u16)]
pub enum HandleType {
    /// Queued transfers, ring buffer, completion callbacks
    NonBlocking = 0x0000,
    /// Direct synchronous calls into the backend only
    Blocking = 0x8F41,
}

/// How a single transfer waits for completion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum TransmissionMode {
    /// The caller spins until the transfer finishes
    Blocking = 0,
    /// The caller returns immediately, completion goes to the callback
    NonBlocking = 1,
}

/// Transfer lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum TransferState {
    /// No transfer, the handle accepts a new request
    Idle = 0,
    /// Waiting in the running write queue behind another write
    Queued = 1,
    /// Handed to the backend
    InFlight = 2,
    /// Finished, completion not delivered yet
    Completed = 3,
}

/// Event counters shared between callbacks and the serial manager task
pub mod event {
    pub const DATA_RECEIVED: usize = 0;
    pub const DATA_SENT: usize = 1;
    pub const DATA_START_SEND: usize = 2;
    pub const DATA_RX_NOTIFY: usize = 3;
}
