//! Port layer - backend implementations
//!
//! A backend moves bytes over one physical or virtual link and reports
//! completions through the callbacks the manager installs. The manager
//! never touches hardware itself.

use core::ptr::NonNull;

use crate::error::{SerialManagerStatus, SerialResult};
use crate::types::SerialCallback;

pub mod loopback;

#[cfg(feature = "pac")]
pub mod stm32_usart;

/// Kind of link behind a manager instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum PortType {
    None = 0,
    Uart,
    UsbCdc,
    Swo,
    Virtual,
    Rpmsg,
    UartDma,
    SpiMaster,
    SpiSlave,
    BleWu,
}

impl PortType {
    /// Received data arrives as whole packets straight into the reader's
    /// buffer instead of through the ring
    #[inline]
    pub fn is_packet_based(self) -> bool {
        matches!(self, PortType::SpiMaster | PortType::SpiSlave)
    }

    /// Reception must be re-armed whenever a reader is open, and single
    /// byte reads go through the general path
    #[inline]
    pub fn is_host_driven(self) -> bool {
        matches!(self, PortType::UsbCdc | PortType::Virtual)
    }
}

/// Backend contract
///
/// Methods take `&self`: a backend is shared between the manager and the
/// interrupt handler that drives it, so mutable state goes behind a
/// critical section. Completion callbacks may run synchronously from
/// inside `write`, `read` or `cancel_write`.
pub trait SerialPort {
    /// Backend specific settings, consumed by `init`
    type Config;

    /// Link kind this backend implements
    fn port_type(&self) -> PortType;

    fn init(&self, config: Self::Config) -> SerialResult<()>;

    fn deinit(&self) -> SerialResult<()>;

    /// Start transmitting `length` bytes
    ///
    /// Exactly one completion must follow through the TX callback, with
    /// the number of bytes sent and `Success`, `Canceled` or an error.
    ///
    /// # Safety
    /// `buffer` must stay valid for `length` bytes until that completion.
    unsafe fn write(&self, buffer: NonNull<u8>, length: usize) -> SerialResult<()>;

    /// Arm reception
    ///
    /// Stream backends get `None` and report data through the RX callback
    /// with a message pointing to their own storage. Packet backends get
    /// the reader's buffer and report the filled part of it.
    ///
    /// # Safety
    /// A provided `buffer` must stay valid for `length` bytes until the RX
    /// callback reports it.
    unsafe fn read(&self, buffer: Option<NonNull<u8>>, length: usize) -> SerialResult<()>;

    /// Abort the write in flight; the TX callback follows with `Canceled`
    fn cancel_write(&self) -> SerialResult<()>;

    fn install_tx_callback(&self, callback: SerialCallback, param: *mut ()) -> SerialResult<()>;

    fn install_rx_callback(&self, callback: SerialCallback, param: *mut ()) -> SerialResult<()>;

    /// Service the hardware as the interrupt handler would
    fn isr_function(&self);

    fn enter_lowpower(&self) -> SerialResult<()> {
        Err(SerialManagerStatus::Error)
    }

    fn exit_lowpower(&self) -> SerialResult<()> {
        Err(SerialManagerStatus::Error)
    }

    /// Synchronous transmit for managers of [`HandleType::Blocking`](crate::types::HandleType)
    fn write_blocking(&self, _data: &[u8]) -> SerialResult<()> {
        Err(SerialManagerStatus::Error)
    }

    /// Synchronous receive for managers of [`HandleType::Blocking`](crate::types::HandleType)
    fn read_blocking(&self, _buffer: &mut [u8]) -> SerialResult<()> {
        Err(SerialManagerStatus::Error)
    }
}
