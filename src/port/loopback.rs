//! Virtual loopback backend
//!
//! A software link with no hardware behind it. Transmissions stay pending
//! until [`LoopbackPort::complete_tx`] (or the ISR entry) finishes them,
//! received data is fed in with [`LoopbackPort::inject_rx`]. With
//! loopback enabled, every completed transmission is also received.
//!
//! The reported port type is configurable, so the same backend can stand
//! in for a packet link such as an SPI slave.
//!
//! Without an RX callback (a blocking-type manager) received bytes are
//! staged in a small FIFO that `read_blocking` serves.

use core::ptr::NonNull;

use crate::core::cs_cell::CsCell;
use crate::critical::critical_section;
use crate::error::{SerialManagerStatus, SerialResult};
use crate::port::{PortType, SerialPort};
use crate::types::{CallbackMessage, SerialCallback};

/// Bytes kept for `read_blocking` when no RX callback is installed
pub const LOOPBACK_STAGING_SIZE: usize = 64;

/// Settings of a [`LoopbackPort`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopbackConfig {
    /// Feed completed transmissions back into reception
    pub loopback: bool,
    /// Start with the host side connected
    pub connected: bool,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        LoopbackConfig {
            loopback: false,
            connected: true,
        }
    }
}

#[derive(Clone, Copy)]
struct Hook {
    callback: SerialCallback,
    param: *mut (),
}

impl Hook {
    fn call(self, message: &CallbackMessage, status: SerialManagerStatus) {
        (self.callback)(self.param, message, status)
    }
}

struct LoopbackState {
    initialized: bool,
    config: LoopbackConfig,
    tx: Option<(NonNull<u8>, usize)>,
    tx_hook: Option<Hook>,
    rx_hook: Option<Hook>,
    rx_armed: bool,
    rx_room: usize,
    rx_packet: Option<(NonNull<u8>, usize)>,
    lowpower: bool,
    writes_started: u32,
    bytes_sent: usize,
    fail_writes: Option<SerialManagerStatus>,
    fail_deinit: Option<SerialManagerStatus>,
    async_cancel: bool,
    cancel_pending: bool,
    staged: [u8; LOOPBACK_STAGING_SIZE],
    staged_len: usize,
}

impl LoopbackState {
    const fn new() -> Self {
        LoopbackState {
            initialized: false,
            config: LoopbackConfig {
                loopback: false,
                connected: true,
            },
            tx: None,
            tx_hook: None,
            rx_hook: None,
            rx_armed: false,
            rx_room: 0,
            rx_packet: None,
            lowpower: false,
            writes_started: 0,
            bytes_sent: 0,
            fail_writes: None,
            fail_deinit: None,
            async_cancel: false,
            cancel_pending: false,
            staged: [0; LOOPBACK_STAGING_SIZE],
            staged_len: 0,
        }
    }

    /// Append to the staging FIFO, dropping what does not fit
    fn stage(&mut self, data: &[u8]) {
        let count = data.len().min(LOOPBACK_STAGING_SIZE - self.staged_len);
        self.staged[self.staged_len..self.staged_len + count].copy_from_slice(&data[..count]);
        self.staged_len += count;
    }
}

/// In-memory serial link
pub struct LoopbackPort {
    port_type: PortType,
    state: CsCell<LoopbackState>,
}

impl LoopbackPort {
    /// Create a backend reporting [`PortType::Virtual`]
    pub const fn new() -> Self {
        Self::with_type(PortType::Virtual)
    }

    /// Create a backend reporting `port_type`
    pub const fn with_type(port_type: PortType) -> Self {
        LoopbackPort {
            port_type,
            state: CsCell::new(LoopbackState::new()),
        }
    }

    /// Finish the pending transmission with `Success`, or with `Canceled`
    /// if an asynchronous abort was requested
    ///
    /// Returns `false` if nothing was pending.
    pub fn complete_tx(&self) -> bool {
        let aborted = critical_section(|cs| {
            let state = self.state.get(cs);
            if !core::mem::take(&mut state.cancel_pending) {
                return None;
            }
            state.tx.take().map(|(buffer, _)| (buffer, state.tx_hook))
        });
        if let Some((buffer, hook)) = aborted {
            if let Some(hook) = hook {
                hook.call(&CallbackMessage::new(Some(buffer), 0), SerialManagerStatus::Canceled);
            }
            return true;
        }

        let pending = critical_section(|cs| {
            let state = self.state.get(cs);
            let (buffer, length) = state.tx.take()?;
            state.bytes_sent += length;
            let echo = if state.config.loopback { state.rx_hook } else { None };
            Some((buffer, length, state.tx_hook, echo))
        });

        let Some((buffer, length, tx_hook, echo)) = pending else {
            return false;
        };
        if echo.is_some() {
            // SAFETY: the writer keeps the buffer alive until the TX
            // completion below.
            let data = unsafe { core::slice::from_raw_parts(buffer.as_ptr(), length) };
            self.inject_rx(data);
        }
        if let Some(hook) = tx_hook {
            hook.call(&CallbackMessage::new(Some(buffer), length), SerialManagerStatus::Success);
        }
        true
    }

    /// Deliver bytes as if they arrived on the link
    ///
    /// Stream links hand the bytes over as one chunk. Packet links copy
    /// them into the armed reader buffer, truncated to its length, and are
    /// ignored when nothing is armed.
    pub fn inject_rx(&self, data: &[u8]) {
        if self.port_type.is_packet_based() {
            let packet = critical_section(|cs| {
                let state = self.state.get(cs);
                let (buffer, length) = state.rx_packet.take()?;
                state.rx_armed = false;
                Some((buffer, length, state.rx_hook))
            });
            let Some((buffer, length, hook)) = packet else {
                return;
            };
            let count = length.min(data.len());
            // SAFETY: the reader armed `buffer` for `length` bytes.
            unsafe { core::ptr::copy_nonoverlapping(data.as_ptr(), buffer.as_ptr(), count) };
            if let Some(hook) = hook {
                hook.call(&CallbackMessage::new(Some(buffer), count), SerialManagerStatus::Success);
            }
            return;
        }

        let hook = critical_section(|cs| {
            let state = self.state.get(cs);
            state.rx_armed = false;
            if state.rx_hook.is_none() {
                state.stage(data);
            }
            state.rx_hook
        });
        if let Some(hook) = hook {
            let message = CallbackMessage::new(NonNull::new(data.as_ptr() as *mut u8), data.len());
            hook.call(&message, SerialManagerStatus::Success);
        }
    }

    /// Simulate the host attaching or detaching
    pub fn set_connected(&self, connected: bool) {
        critical_section(|cs| self.state.get(cs).config.connected = connected);
    }

    /// Make every following `write` fail with `status`, `None` to heal
    pub fn fail_writes(&self, status: Option<SerialManagerStatus>) {
        critical_section(|cs| self.state.get(cs).fail_writes = status);
    }

    /// Make the next `deinit` fail with `status`, `None` to heal
    pub fn fail_deinit(&self, status: Option<SerialManagerStatus>) {
        critical_section(|cs| self.state.get(cs).fail_deinit = status);
    }

    /// Let `cancel_write` only request the abort; the `Canceled`
    /// completion follows on the next `complete_tx` or ISR pass, as with
    /// a DMA channel
    pub fn set_async_cancel(&self, enabled: bool) {
        critical_section(|cs| self.state.get(cs).async_cancel = enabled);
    }

    /// Bytes waiting for `read_blocking`
    pub fn staged_len(&self) -> usize {
        critical_section(|cs| self.state.get(cs).staged_len)
    }

    /// Length of the transmission in progress
    pub fn pending_tx_len(&self) -> Option<usize> {
        critical_section(|cs| self.state.get(cs).tx.map(|(_, length)| length))
    }

    /// Copy of the first byte of the transmission in progress
    pub fn pending_tx_first(&self) -> Option<u8> {
        critical_section(|cs| {
            let (buffer, length) = self.state.get(cs).tx?;
            // SAFETY: a pending buffer is valid until its completion.
            (length > 0).then(|| unsafe { buffer.as_ptr().read() })
        })
    }

    /// Whether reception is currently armed
    pub fn is_rx_armed(&self) -> bool {
        critical_section(|cs| self.state.get(cs).rx_armed)
    }

    /// Room announced by the last stream re-arm
    pub fn rx_room(&self) -> usize {
        critical_section(|cs| self.state.get(cs).rx_room)
    }

    pub fn is_initialized(&self) -> bool {
        critical_section(|cs| self.state.get(cs).initialized)
    }

    pub fn is_lowpower(&self) -> bool {
        critical_section(|cs| self.state.get(cs).lowpower)
    }

    /// Number of transmissions handed over by the manager
    pub fn writes_started(&self) -> u32 {
        critical_section(|cs| self.state.get(cs).writes_started)
    }

    /// Total bytes of successfully completed transmissions
    pub fn bytes_sent(&self) -> usize {
        critical_section(|cs| self.state.get(cs).bytes_sent)
    }
}

impl Default for LoopbackPort {
    fn default() -> Self {
        Self::new()
    }
}

impl SerialPort for LoopbackPort {
    type Config = LoopbackConfig;

    fn port_type(&self) -> PortType {
        self.port_type
    }

    fn init(&self, config: LoopbackConfig) -> SerialResult<()> {
        critical_section(|cs| {
            let state = self.state.get(cs);
            *state = LoopbackState::new();
            state.config = config;
            state.initialized = true;
        });
        Ok(())
    }

    fn deinit(&self) -> SerialResult<()> {
        critical_section(|cs| {
            let state = self.state.get(cs);
            if let Some(status) = state.fail_deinit.take() {
                return Err(status);
            }
            state.initialized = false;
            state.tx = None;
            state.rx_armed = false;
            state.rx_packet = None;
            state.staged_len = 0;
            Ok(())
        })
    }

    unsafe fn write(&self, buffer: NonNull<u8>, length: usize) -> SerialResult<()> {
        critical_section(|cs| {
            let state = self.state.get(cs);
            if let Some(status) = state.fail_writes {
                return Err(status);
            }
            if !state.config.connected {
                return Err(SerialManagerStatus::NotConnected);
            }
            if state.tx.is_some() {
                return Err(SerialManagerStatus::Busy);
            }
            state.tx = Some((buffer, length));
            state.writes_started += 1;
            Ok(())
        })
    }

    unsafe fn read(&self, buffer: Option<NonNull<u8>>, length: usize) -> SerialResult<()> {
        critical_section(|cs| {
            let state = self.state.get(cs);
            state.rx_armed = true;
            match buffer {
                Some(buffer) => state.rx_packet = Some((buffer, length)),
                None => state.rx_room = length,
            }
        });
        Ok(())
    }

    fn cancel_write(&self) -> SerialResult<()> {
        let canceled = critical_section(|cs| {
            let state = self.state.get(cs);
            if state.async_cancel {
                state.cancel_pending = state.tx.is_some();
                return None;
            }
            state.tx.take().map(|(buffer, _)| (buffer, state.tx_hook))
        });
        if let Some((buffer, Some(hook))) = canceled {
            hook.call(&CallbackMessage::new(Some(buffer), 0), SerialManagerStatus::Canceled);
        }
        Ok(())
    }

    fn install_tx_callback(&self, callback: SerialCallback, param: *mut ()) -> SerialResult<()> {
        critical_section(|cs| self.state.get(cs).tx_hook = Some(Hook { callback, param }));
        Ok(())
    }

    fn install_rx_callback(&self, callback: SerialCallback, param: *mut ()) -> SerialResult<()> {
        critical_section(|cs| self.state.get(cs).rx_hook = Some(Hook { callback, param }));
        Ok(())
    }

    fn isr_function(&self) {
        self.complete_tx();
    }

    fn enter_lowpower(&self) -> SerialResult<()> {
        critical_section(|cs| self.state.get(cs).lowpower = true);
        Ok(())
    }

    fn exit_lowpower(&self) -> SerialResult<()> {
        critical_section(|cs| self.state.get(cs).lowpower = false);
        Ok(())
    }

    fn write_blocking(&self, data: &[u8]) -> SerialResult<()> {
        critical_section(|cs| {
            let state = self.state.get(cs);
            if !state.config.connected {
                return Err(SerialManagerStatus::NotConnected);
            }
            state.bytes_sent += data.len();
            if state.config.loopback {
                state.stage(data);
            }
            Ok(())
        })
    }

    fn read_blocking(&self, buffer: &mut [u8]) -> SerialResult<()> {
        critical_section(|cs| {
            let state = self.state.get(cs);
            // Nothing can arrive while the caller spins, so a short FIFO is
            // an error rather than a wait.
            let count = buffer.len();
            if count > state.staged_len {
                return Err(SerialManagerStatus::Error);
            }
            buffer.copy_from_slice(&state.staged[..count]);
            state.staged.copy_within(count..state.staged_len, 0);
            state.staged_len -= count;
            Ok(())
        })
    }
}
