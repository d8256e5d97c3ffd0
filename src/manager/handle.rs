//! Write and read handles
//!
//! Handles are caller-owned blocks the manager links into its queues, so
//! they must live at a fixed address for as long as they are open. In
//! practice they are `static`s.

use core::ptr::NonNull;

use crate::core::cs_cell::CsCell;
use crate::critical::critical_section;
use crate::error::SerialManagerStatus;
use crate::list::ListElement;
use crate::types::{CallbackMessage, SerialCallback, TransferState, TransmissionMode};

/// One outstanding request on a handle
#[derive(Debug, Clone, Copy)]
pub(crate) struct Transfer {
    pub buffer: Option<NonNull<u8>>,
    pub length: usize,
    pub so_far: usize,
    pub mode: TransmissionMode,
    pub status: SerialManagerStatus,
    pub state: TransferState,
    /// The low-power constraint was taken when this write went in flight
    pub lp_held: bool,
}

impl Transfer {
    pub const IDLE: Transfer = Transfer {
        buffer: None,
        length: 0,
        so_far: 0,
        mode: TransmissionMode::NonBlocking,
        status: SerialManagerStatus::Success,
        state: TransferState::Idle,
        lp_held: false,
    };

    pub fn start(buffer: NonNull<u8>, length: usize, mode: TransmissionMode, state: TransferState) -> Self {
        Transfer {
            buffer: Some(buffer),
            length,
            so_far: 0,
            mode,
            status: SerialManagerStatus::Success,
            state,
            lp_held: false,
        }
    }

    #[inline]
    pub fn is_idle(&self) -> bool {
        self.state == TransferState::Idle
    }

    /// Return to idle and hand back the message for the completion callback
    pub fn finish(&mut self) -> CallbackMessage {
        let message = CallbackMessage::new(self.buffer.take(), self.so_far);
        self.state = TransferState::Idle;
        message
    }
}

pub(crate) struct HandleState {
    pub transfer: Transfer,
    pub manager: *const (),
    pub callback: Option<SerialCallback>,
    pub callback_param: *mut (),
    pub tag: u32,
}

impl HandleState {
    pub const CLOSED: HandleState = HandleState {
        transfer: Transfer::IDLE,
        manager: core::ptr::null(),
        callback: None,
        callback_param: core::ptr::null_mut(),
        tag: 0,
    };

    pub fn open(manager: *const (), tag: u32) -> Self {
        HandleState {
            manager,
            tag,
            ..HandleState::CLOSED
        }
    }
}

macro_rules! handle_accessors {
    () => {
        /// Lifecycle of the current request
        pub fn state(&self) -> TransferState {
            critical_section(|cs| self.inner.get(cs).transfer.state)
        }

        /// Bytes transferred by the current or last request
        pub fn so_far(&self) -> usize {
            critical_section(|cs| self.inner.get(cs).transfer.so_far)
        }

        /// Requested length of the current or last request
        pub fn length(&self) -> usize {
            critical_section(|cs| self.inner.get(cs).transfer.length)
        }

        /// Status of the last finished request
        pub fn status(&self) -> SerialManagerStatus {
            critical_section(|cs| self.inner.get(cs).transfer.status)
        }

        /// Whether a request is attached (the buffer is held)
        pub fn is_busy(&self) -> bool {
            critical_section(|cs| self.inner.get(cs).transfer.buffer.is_some())
        }

        pub fn is_open(&self) -> bool {
            critical_section(|cs| self.inner.get(cs).tag != 0)
        }
    };
}

/// Write handle
///
/// `link` comes first so the address of a queued element is the address
/// of its handle.
#[repr(C)]
pub struct WriteHandle {
    pub(crate) link: ListElement,
    pub(crate) inner: CsCell<HandleState>,
}

impl WriteHandle {
    pub const fn new() -> Self {
        WriteHandle {
            link: ListElement::new(),
            inner: CsCell::new(HandleState::CLOSED),
        }
    }

    /// Recover the handle from its queue link
    ///
    /// # Safety
    /// `link` must point to the `link` field of a live `WriteHandle`.
    #[inline]
    pub(crate) unsafe fn from_link<'a>(link: NonNull<ListElement>) -> &'a WriteHandle {
        unsafe { link.cast::<WriteHandle>().as_ref() }
    }

    handle_accessors!();
}

impl Default for WriteHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Read handle, at most one open per manager
pub struct ReadHandle {
    pub(crate) inner: CsCell<HandleState>,
}

impl ReadHandle {
    pub const fn new() -> Self {
        ReadHandle {
            inner: CsCell::new(HandleState::CLOSED),
        }
    }

    handle_accessors!();
}

impl Default for ReadHandle {
    fn default() -> Self {
        Self::new()
    }
}
