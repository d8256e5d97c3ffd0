//! Error types for the serial manager
//!
//! Operations return a `Result` whose error half is the status. The numeric
//! values follow the status groups of the serial manager (136) and the
//! generic list (142).

/// Status group number of serial manager codes
const GROUP_SERIAL_MANAGER: u32 = 136;

/// Status group number of list codes
const GROUP_LIST: u32 = 142;

const fn make_status(group: u32, code: u32) -> u32 {
    group * 100 + code
}

/// Serial manager status
///
/// Returned as the error half of [`SerialResult`] and passed as-is to
/// completion callbacks, where `Success` and `Notify` are not failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u32)]
pub enum SerialManagerStatus {
    /// Success
    Success = 0,
    /// Generic failure
    Error = make_status(GROUP_SERIAL_MANAGER, 1),
    /// Handle already has an outstanding operation, or a resource is open
    Busy = make_status(GROUP_SERIAL_MANAGER, 2),
    /// Ring buffer holds data
    Notify = make_status(GROUP_SERIAL_MANAGER, 3),
    /// The non-blocking request was canceled
    Canceled = make_status(GROUP_SERIAL_MANAGER, 4),
    /// The handle is already opened
    HandleConflict = make_status(GROUP_SERIAL_MANAGER, 5),
    /// The ring buffer overflowed and the oldest byte was dropped
    RingBufferOverflow = make_status(GROUP_SERIAL_MANAGER, 6),
    /// The host is not connected
    NotConnected = make_status(GROUP_SERIAL_MANAGER, 7),
}

/// Result type alias for serial manager operations
pub type SerialResult<T> = Result<T, SerialManagerStatus>;

impl SerialManagerStatus {
    #[inline]
    pub fn is_ok(self) -> bool {
        self == SerialManagerStatus::Success
    }

    #[inline]
    pub fn is_err(self) -> bool {
        self != SerialManagerStatus::Success
    }

    /// Fold into a [`SerialResult`]
    #[inline]
    pub fn into_result(self) -> SerialResult<()> {
        if self.is_ok() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl From<SerialResult<()>> for SerialManagerStatus {
    fn from(result: SerialResult<()>) -> Self {
        match result {
            Ok(()) => SerialManagerStatus::Success,
            Err(status) => status,
        }
    }
}

/// List operation status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u32)]
pub enum ListStatus {
    /// Element is already in the list
    DuplicateError = make_status(GROUP_LIST, 1),
    /// List reached its capacity
    Full = make_status(GROUP_LIST, 2),
    /// List is empty
    Empty = make_status(GROUP_LIST, 3),
    /// Element is not linked into any list
    OrphanElement = make_status(GROUP_LIST, 4),
    /// Operation not supported in this list mode
    NotSupport = make_status(GROUP_LIST, 5),
}

/// Result type alias for list operations
pub type ListResult<T> = Result<T, ListStatus>;
