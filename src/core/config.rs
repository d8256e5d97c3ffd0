//! Compile-time configuration for the serial manager
//!
//! These constants control the behavior and defaults of the manager.
//! Per-instance settings live in [`SerialManagerConfig`](crate::manager::SerialManagerConfig).

/// Sentinel stored in an opened write handle
pub const CFG_WRITE_TAG: u32 = 0xAABB_5754;

/// Sentinel stored in an opened read handle
pub const CFG_READ_TAG: u32 = 0xBBAA_5244;

/// Default ring buffer watermark, in percent of the ring size
pub const CFG_RINGBUFFER_WATERMARK_PERCENT: u8 = 95;

/// Poll period of a blocking write, in milliseconds
pub const CFG_WRITE_TIME_DELAY_MS: u32 = 1;

/// Poll period of a blocking read, in milliseconds
pub const CFG_READ_TIME_DELAY_MS: u32 = 1;

/// Power mode passed to the low-power constraint callbacks
pub const CFG_LP_CONSTRAINT: i32 = 0;

/// Number of event counters shared with the serial manager task
pub const CFG_EVENT_NUMBER: usize = 4;

/// Whether list insertion scans for an already linked element
pub const CFG_LIST_DUPLICATE_CHECK: bool = cfg!(feature = "list-duplicate-check");

/// Core clock assumed by the busy-wait delay of the bare-metal adapters
pub const CFG_CPU_CLOCK_HZ: u32 = 84_000_000;

/// Spin iterations per millisecond when no cycle counter is available
pub const CFG_HOST_SPINS_PER_MS: u32 = 1_000;
