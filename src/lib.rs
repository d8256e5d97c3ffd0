//! Serial Manager for embedded Rust
//!
//! A non-blocking serial I/O multiplexer providing:
//! - An intrusive, allocation-free linked list
//! - FIFO write queues with one transfer in flight per port
//! - A lossy ring buffer absorbing received bytes, with optional flow control
//! - One handle-based API over interchangeable backends (UART, USB-CDC, SPI, ...)

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

// ============ Critical Section ============

#[cfg(all(target_arch = "arm", feature = "cs-impl"))]
mod cs_impl {
    use cortex_m::interrupt;
    use cortex_m::register::primask;
    use critical_section::{set_impl, Impl, RawRestoreState};

    struct SingleCoreCriticalSection;
    set_impl!(SingleCoreCriticalSection);

    unsafe impl Impl for SingleCoreCriticalSection {
        unsafe fn acquire() -> RawRestoreState {
            let was_active = primask::read().is_active();
            interrupt::disable();
            was_active
        }

        unsafe fn release(was_active: RawRestoreState) {
            if was_active {
                unsafe { interrupt::enable() }
            }
        }
    }
}

// ============ Modules ============

#[macro_use]
pub mod log;

pub mod core;
pub mod list;
pub mod manager;
pub mod osa;
pub mod port;

// ============ Re-exports ============

pub use self::core::config;
pub use self::core::config::*;
pub use self::core::critical;
pub use self::core::error;
pub use self::core::error::{ListResult, ListStatus, SerialManagerStatus, SerialResult};
pub use self::core::types;
pub use self::core::types::*;
pub use list::{List, ListElement};
pub use manager::{ReadHandle, SerialManager, SerialManagerConfig, WriteHandle};
pub use manager::ring_buffer::{RingBuffer, Watermark};
pub use osa::{BareMetal, Osa, TaskSignal};
pub use port::{PortType, SerialPort};
pub use port::loopback::{LoopbackConfig, LoopbackPort};

#[cfg(feature = "pac")]
pub use stm32_metapac as pac;
