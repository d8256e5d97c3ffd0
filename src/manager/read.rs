//! Read path: servicing reads from the ring buffer and receive completion

use core::ptr::NonNull;

use super::handle::{ReadHandle, Transfer};
use super::SerialManager;
use crate::config::CFG_READ_TIME_DELAY_MS;
use crate::critical::{critical_section, CriticalSection};
use crate::error::{SerialManagerStatus, SerialResult};
use crate::osa::Osa;
use crate::port::SerialPort;
use crate::types::{event, CallbackMessage, HandleType, SerialCallback, TransferState, TransmissionMode};

/// How a read request waits
#[derive(Clone, Copy, PartialEq, Eq)]
enum ReadKind {
    Blocking,
    NonBlocking,
    /// Take what the ring holds and return
    Try,
}

impl ReadKind {
    fn mode(self) -> TransmissionMode {
        match self {
            ReadKind::NonBlocking => TransmissionMode::NonBlocking,
            ReadKind::Blocking | ReadKind::Try => TransmissionMode::Blocking,
        }
    }
}

impl<P: SerialPort, O: Osa> SerialManager<P, O> {
    /// Fill `buffer` completely, waiting for data as needed
    pub fn read_blocking(&self, handle: &ReadHandle, buffer: &mut [u8]) -> SerialResult<()> {
        if self.handle_type() == HandleType::Blocking {
            self.check_read(handle);
            return self.port.read_blocking(buffer);
        }
        self.read(handle, buffer.as_mut_ptr(), buffer.len(), ReadKind::Blocking)
            .map(|_| ())
    }

    /// Start filling `buffer`; the RX callback reports when it is full
    ///
    /// If the ring buffer already holds enough data, the callback runs
    /// before this returns.
    pub fn read_non_blocking(&self, handle: &ReadHandle, buffer: &'static mut [u8]) -> SerialResult<()> {
        if self.handle_type() == HandleType::Blocking {
            return Err(SerialManagerStatus::Error);
        }
        self.read(handle, buffer.as_mut_ptr(), buffer.len(), ReadKind::NonBlocking)
            .map(|_| ())
    }

    /// Copy whatever the ring buffer holds, up to `buffer.len()`
    ///
    /// Returns the number of bytes copied, possibly zero.
    pub fn try_read(&self, handle: &ReadHandle, buffer: &mut [u8]) -> SerialResult<usize> {
        if self.handle_type() == HandleType::Blocking {
            return Err(SerialManagerStatus::Error);
        }
        self.read(handle, buffer.as_mut_ptr(), buffer.len(), ReadKind::Try)
    }

    fn read(&self, handle: &ReadHandle, buffer: *mut u8, length: usize, kind: ReadKind) -> SerialResult<usize> {
        self.check_read(handle);
        let buffer = NonNull::new(buffer)
            .filter(|_| length > 0)
            .ok_or(SerialManagerStatus::Error)?;

        if self.port_type().is_packet_based() && kind != ReadKind::Try {
            return self.read_packet(handle, buffer, length, kind);
        }

        let cs = CriticalSection::enter();
        let inner = handle.inner.get(&cs);
        if !inner.transfer.is_idle() {
            return Err(SerialManagerStatus::Busy);
        }
        if kind == ReadKind::NonBlocking && inner.callback.is_none() {
            return Err(SerialManagerStatus::Error);
        }

        let state = self.state.get(&cs);
        let so_far = if length == 1 && !state.port_type.is_host_driven() {
            match state.ring.pop() {
                Some(byte) => {
                    // SAFETY: `buffer` is valid for `length` (1) bytes.
                    unsafe { buffer.as_ptr().write(byte) };
                    1
                }
                None => 0,
            }
        } else {
            // SAFETY: `buffer` comes from a slice of `length` bytes that
            // the caller lends for the whole request.
            let dst = unsafe { core::slice::from_raw_parts_mut(buffer.as_ptr(), length) };
            state.ring.drain_into(dst)
        };
        let rearm = state.flow_control.map_or(true, |mark| state.ring.below(mark));
        let room = state.ring.free();

        let done = kind == ReadKind::Try || so_far >= length;
        inner.transfer = Transfer::start(buffer, length, kind.mode(), TransferState::InFlight);
        inner.transfer.so_far = so_far;
        let notify = if done {
            inner.transfer.buffer = None;
            inner.transfer.state = TransferState::Idle;
            match (kind, inner.callback) {
                (ReadKind::NonBlocking, Some(callback)) => Some((callback, inner.callback_param)),
                _ => None,
            }
        } else {
            None
        };

        if rearm {
            // SAFETY: stream backends receive into their own storage.
            let _ = unsafe { self.port.read(None, room) };
        }
        drop(cs);

        if let Some((callback, param)) = notify {
            callback(param, &CallbackMessage::new(Some(buffer), so_far), SerialManagerStatus::Success);
        }

        match kind {
            ReadKind::Blocking if !done => self.wait_read(handle),
            _ => Ok(so_far),
        }
    }

    /// Packet links receive straight into the reader's buffer
    fn read_packet(&self, handle: &ReadHandle, buffer: NonNull<u8>, length: usize, kind: ReadKind) -> SerialResult<usize> {
        critical_section(|cs| {
            let inner = handle.inner.get(cs);
            if !inner.transfer.is_idle() {
                return Err(SerialManagerStatus::Busy);
            }
            if kind == ReadKind::NonBlocking && inner.callback.is_none() {
                return Err(SerialManagerStatus::Error);
            }
            inner.transfer = Transfer::start(buffer, length, kind.mode(), TransferState::InFlight);
            Ok(())
        })?;

        // SAFETY: the caller lends `buffer` for the whole request.
        if let Err(status) = unsafe { self.port.read(Some(buffer), length) } {
            critical_section(|cs| handle.inner.get(cs).transfer = Transfer::IDLE);
            return Err(status);
        }

        match kind {
            ReadKind::Blocking => self.wait_read(handle),
            _ => Ok(0),
        }
    }

    fn wait_read(&self, handle: &ReadHandle) -> SerialResult<usize> {
        loop {
            let transfer = critical_section(|cs| handle.inner.get(cs).transfer);
            if transfer.is_idle() {
                return transfer.status.into_result().map(|()| transfer.so_far);
            }
            if self.osa.need_polling_isr() {
                self.isr_function();
                if self.osa.deferred() {
                    self.poll();
                }
            } else {
                self.osa.time_delay(CFG_READ_TIME_DELAY_MS);
            }
        }
    }

    /// Cancel the outstanding read of `handle`
    ///
    /// A non-blocking read in progress completes with `Canceled` and the
    /// bytes received so far.
    ///
    /// # Returns
    /// * `Err(SerialManagerStatus::Error)` - The read is a blocking one
    pub fn cancel_reading(&self, handle: &ReadHandle) -> SerialResult<()> {
        self.check_read(handle);

        let canceled = critical_section(|cs| {
            let inner = handle.inner.get(cs);
            let transfer = &mut inner.transfer;
            if !transfer.is_idle() && transfer.mode == TransmissionMode::Blocking {
                return Err(SerialManagerStatus::Error);
            }
            if transfer.is_idle() {
                return Ok(None);
            }
            transfer.status = SerialManagerStatus::Canceled;
            let message = transfer.finish();
            transfer.length = 0;
            Ok(inner.callback.map(|callback| (callback, inner.callback_param, message)))
        })?;

        if let Some((callback, param, message)) = canceled {
            debug!("serial manager: read canceled after {} bytes", message.length);
            callback(param, &message, SerialManagerStatus::Canceled);
        }
        Ok(())
    }

    /// RX completion entry installed with the backend
    ///
    /// `param` is the manager registered during `init`.
    pub fn rx_callback(param: *mut (), message: &CallbackMessage, status: SerialManagerStatus) {
        // SAFETY: `init` registers a 'static manager of exactly this type.
        let manager = unsafe { &*(param as *const Self) };
        if manager.port_type().is_packet_based() {
            manager.on_rx_packet(message, status);
        } else {
            manager.on_rx_stream(message);
        }
    }

    fn on_rx_packet(&self, message: &CallbackMessage, status: SerialManagerStatus) {
        let done = critical_section(|cs| {
            let reader = self.state.get(cs).opened_read?;
            // SAFETY: the open reader is 'static until it is closed.
            let transfer = &mut unsafe { reader.as_ref() }.inner.get(cs).transfer;
            if transfer.state != TransferState::InFlight {
                return None;
            }
            transfer.buffer = message.buffer;
            transfer.length = message.length;
            transfer.so_far = message.length;
            transfer.status = status;
            match transfer.mode {
                TransmissionMode::NonBlocking => {
                    transfer.state = TransferState::Completed;
                    Some(())
                }
                TransmissionMode::Blocking => {
                    transfer.buffer = None;
                    transfer.state = TransferState::Idle;
                    None
                }
            }
        });
        if done.is_some() {
            self.signal(event::DATA_RECEIVED);
        }
    }

    fn on_rx_stream(&self, message: &CallbackMessage) {
        let cs = CriticalSection::enter();
        let state = self.state.get(&cs);

        // SAFETY: the backend's message is valid for this callback.
        let dropped = state.ring.push(unsafe { message.data() });
        let status = if dropped > 0 {
            warn!("serial manager: ring buffer overflow, {} bytes lost", dropped);
            SerialManagerStatus::RingBufferOverflow
        } else {
            SerialManagerStatus::Notify
        };

        let mut reader_done = false;
        let mut notify: Option<(SerialCallback, *mut ())> = None;
        if let Some(reader) = state.opened_read {
            // SAFETY: the open reader is 'static until it is closed.
            let inner = unsafe { reader.as_ref() }.inner.get(&cs);
            let transfer = &mut inner.transfer;
            if transfer.state == TransferState::InFlight {
                if let Some(buffer) = transfer.buffer {
                    if transfer.length > transfer.so_far {
                        // SAFETY: the reader lent `buffer` for `length` bytes.
                        let dst = unsafe {
                            core::slice::from_raw_parts_mut(
                                buffer.as_ptr().add(transfer.so_far),
                                transfer.length - transfer.so_far,
                            )
                        };
                        transfer.so_far += state.ring.drain_into(dst);
                    }
                    if transfer.so_far >= transfer.length {
                        transfer.status = SerialManagerStatus::Success;
                        match transfer.mode {
                            TransmissionMode::Blocking => {
                                transfer.buffer = None;
                                transfer.state = TransferState::Idle;
                            }
                            TransmissionMode::NonBlocking => {
                                transfer.state = TransferState::Completed;
                                reader_done = true;
                            }
                        }
                    }
                }
            }
            notify = inner.callback.map(|callback| (callback, inner.callback_param));
        }

        let available = state.ring.len();
        let below_mark = state.flow_control.map_or(true, |mark| state.ring.below(mark));
        let rearm = below_mark && (state.opened_read.is_some() || !state.port_type.is_host_driven());
        let room = state.ring.free();
        let task_notify = state.task_handles_rx_notify && self.osa.deferred();

        if reader_done {
            self.signal(event::DATA_RECEIVED);
        }
        if rearm {
            // SAFETY: stream backends receive into their own storage.
            let _ = unsafe { self.port.read(None, room) };
        }
        if available == 0 {
            return;
        }
        if task_notify {
            self.signal_rx_notify();
        } else if let Some((callback, param)) = notify {
            drop(cs);
            callback(param, &CallbackMessage::notify(available), status);
        }
    }
}
