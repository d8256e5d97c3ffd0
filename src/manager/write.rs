//! Write path: queueing, starting, completing and canceling writes

use core::ptr::NonNull;

use super::handle::{Transfer, WriteHandle};
use super::SerialManager;
use crate::config::CFG_WRITE_TIME_DELAY_MS;
use crate::critical::critical_section;
use crate::error::{SerialManagerStatus, SerialResult};
use crate::osa::Osa;
use crate::port::SerialPort;
use crate::types::{event, CallbackMessage, HandleType, TransferState, TransmissionMode};

enum CancelAction {
    Nothing,
    Dequeued,
    Abort,
}

impl<P: SerialPort, O: Osa> SerialManager<P, O> {
    /// Write `data` and wait until the backend is done with it
    ///
    /// On a blocking-type manager this goes straight to the backend.
    pub fn write_blocking(&self, handle: &WriteHandle, data: &[u8]) -> SerialResult<()> {
        if self.handle_type() == HandleType::Blocking {
            self.check_write(handle);
            return self.port.write_blocking(data);
        }
        let buffer = Self::request_buffer(data)?;
        self.write(handle, buffer, data.len(), TransmissionMode::Blocking)
    }

    /// Queue `data` and return; the handle's TX callback reports completion
    ///
    /// # Returns
    /// * `Err(SerialManagerStatus::Busy)` - The handle has a write outstanding
    /// * `Err(SerialManagerStatus::Error)` - Blocking-type manager, empty data
    ///   or no callback installed
    pub fn write_non_blocking(&self, handle: &WriteHandle, data: &'static [u8]) -> SerialResult<()> {
        if self.handle_type() == HandleType::Blocking {
            return Err(SerialManagerStatus::Error);
        }
        let buffer = Self::request_buffer(data)?;
        self.write(handle, buffer, data.len(), TransmissionMode::NonBlocking)
    }

    fn request_buffer(data: &[u8]) -> SerialResult<NonNull<u8>> {
        if data.is_empty() {
            return Err(SerialManagerStatus::Error);
        }
        NonNull::new(data.as_ptr() as *mut u8).ok_or(SerialManagerStatus::Error)
    }

    fn write(&self, handle: &WriteHandle, buffer: NonNull<u8>, length: usize, mode: TransmissionMode) -> SerialResult<()> {
        self.check_write(handle);

        let first = critical_section(|cs| {
            let inner = handle.inner.get(cs);
            if !inner.transfer.is_idle() {
                return Err(SerialManagerStatus::Busy);
            }
            if mode == TransmissionMode::NonBlocking && inner.callback.is_none() {
                return Err(SerialManagerStatus::Error);
            }
            let first = self.running.is_empty();
            // SAFETY: open handles are 'static and stay put while queued,
            // and the manager itself is 'static since `init`.
            unsafe { self.running.add_tail(&handle.link) }.map_err(|_| SerialManagerStatus::Error)?;
            inner.transfer = Transfer::start(buffer, length, mode, TransferState::Queued);
            Ok(first)
        })?;
        trace!("serial manager: write of {} bytes queued", length);

        if first {
            if self.task_handles_tx() {
                self.signal(event::DATA_START_SEND);
            } else {
                self.start_writing(false)?;
            }
        }

        match mode {
            TransmissionMode::Blocking => self.wait_write(handle),
            TransmissionMode::NonBlocking => Ok(()),
        }
    }

    /// Hand the head of the running queue to the backend
    ///
    /// A refused head leaves the queue. With `report` set it completes with
    /// the backend's status and the next head is tried; otherwise it goes
    /// back to idle and the status is returned to the writer.
    pub(crate) fn start_writing(&self, report: bool) -> SerialResult<()> {
        loop {
            if critical_section(|cs| self.state.get(cs).tx_aborting) {
                return Ok(());
            }
            let Some(link) = self.running.head() else {
                return Ok(());
            };
            // SAFETY: only write handles are linked into the running queue.
            let handle = unsafe { WriteHandle::from_link(link) };

            let request = critical_section(|cs| {
                let transfer = &mut handle.inner.get(cs).transfer;
                if transfer.state != TransferState::Queued {
                    return None;
                }
                transfer.state = TransferState::InFlight;
                transfer.lp_held = true;
                let length = transfer.length;
                transfer.buffer.map(|buffer| (buffer, length))
            });
            let Some((buffer, length)) = request else {
                return Ok(());
            };

            self.lp_enter();
            // SAFETY: the buffer is held by the transfer until it completes.
            let status = match unsafe { self.port.write(buffer, length) } {
                Ok(()) => return Ok(()),
                Err(status) => status,
            };
            warn!("serial manager: backend refused a write: {}", status);

            if self.running.head() == Some(link) {
                let _ = handle.link.remove();
            }
            self.lp_exit();

            let deliver = critical_section(|cs| {
                let transfer = &mut handle.inner.get(cs).transfer;
                transfer.lp_held = false;
                transfer.status = status;
                transfer.so_far = 0;
                if report && transfer.mode == TransmissionMode::NonBlocking {
                    transfer.state = TransferState::Completed;
                    true
                } else {
                    transfer.buffer = None;
                    transfer.state = TransferState::Idle;
                    false
                }
            });

            if !report {
                return Err(status);
            }
            if deliver {
                // SAFETY: see `write`.
                let _ = unsafe { self.completed.add_tail(&handle.link) };
                self.signal(event::DATA_SENT);
            }
        }
    }

    /// Start the next queued write, from the task if configured so
    pub(crate) fn kick_writing(&self) {
        if self.running.is_empty() {
            return;
        }
        if self.task_handles_tx() {
            self.signal(event::DATA_START_SEND);
        } else {
            let _ = self.start_writing(true);
        }
    }

    fn wait_write(&self, handle: &WriteHandle) -> SerialResult<()> {
        loop {
            let transfer = critical_section(|cs| handle.inner.get(cs).transfer);
            if transfer.is_idle() {
                return transfer.status.into_result();
            }
            if self.osa.need_polling_isr() {
                self.isr_function();
                if self.osa.deferred() {
                    self.poll();
                }
            } else {
                self.osa.time_delay(CFG_WRITE_TIME_DELAY_MS);
            }
        }
    }

    /// Cancel the outstanding write of `handle`
    ///
    /// A queued write is completed right away with `Canceled`. The write in
    /// flight is aborted in the backend, whose `Canceled` completion follows.
    ///
    /// # Returns
    /// * `Err(SerialManagerStatus::Error)` - The write is a blocking one
    pub fn cancel_writing(&self, handle: &WriteHandle) -> SerialResult<()> {
        self.check_write(handle);

        let action = critical_section(|cs| {
            let transfer = &mut handle.inner.get(cs).transfer;
            if !transfer.is_idle() && transfer.mode == TransmissionMode::Blocking {
                return Err(SerialManagerStatus::Error);
            }
            if handle.link.list() != Some(NonNull::from(&self.running)) {
                return Ok(CancelAction::Nothing);
            }
            if transfer.state == TransferState::InFlight {
                return Ok(CancelAction::Abort);
            }
            let _ = handle.link.remove();
            transfer.so_far = 0;
            transfer.status = SerialManagerStatus::Canceled;
            transfer.state = TransferState::Completed;
            Ok(CancelAction::Dequeued)
        })?;

        match action {
            CancelAction::Nothing => return Ok(()),
            CancelAction::Dequeued => {
                debug!("serial manager: queued write canceled");
                // SAFETY: see `write`.
                let _ = unsafe { self.completed.add_tail(&handle.link) };
                self.signal(event::DATA_SENT);
            }
            CancelAction::Abort => {
                debug!("serial manager: aborting write in flight");
                self.port.cancel_write()?;
            }
        }

        self.kick_writing();
        Ok(())
    }

    /// TX completion entry installed with the backend
    ///
    /// `param` is the manager registered during `init`.
    pub fn tx_callback(param: *mut (), message: &CallbackMessage, status: SerialManagerStatus) {
        // SAFETY: `init` registers a 'static manager of exactly this type.
        let manager = unsafe { &*(param as *const Self) };
        manager.on_tx_complete(message, status);
    }

    fn on_tx_complete(&self, message: &CallbackMessage, status: SerialManagerStatus) {
        let finished = critical_section(|cs| {
            let link = self.running.head()?;
            // SAFETY: only write handles are linked into the running queue.
            let handle = unsafe { WriteHandle::from_link(link) };
            let transfer = &mut handle.inner.get(cs).transfer;
            if transfer.state != TransferState::InFlight {
                return None;
            }
            let _ = self.running.remove_head();

            transfer.so_far = message.length;
            transfer.status = status;
            let release_lp = match transfer.mode {
                TransmissionMode::NonBlocking => {
                    transfer.state = TransferState::Completed;
                    false
                }
                TransmissionMode::Blocking => {
                    transfer.buffer = None;
                    transfer.state = TransferState::Idle;
                    core::mem::take(&mut transfer.lp_held)
                }
            };
            Some((handle, transfer.mode, release_lp))
        });
        let Some((handle, mode, release_lp)) = finished else {
            // Late completion of a write closed while the backend was still
            // aborting it; the queue waited for the link to go idle.
            let aborted = critical_section(|cs| core::mem::take(&mut self.state.get(cs).tx_aborting));
            if aborted {
                self.kick_writing();
            }
            return;
        };
        trace!("serial manager: write of {} bytes done: {}", message.length, status);

        if mode == TransmissionMode::NonBlocking {
            // SAFETY: see `write`.
            let _ = unsafe { self.completed.add_tail(&handle.link) };
        } else if release_lp {
            self.lp_exit();
        }

        self.kick_writing();

        if mode == TransmissionMode::NonBlocking {
            self.signal(event::DATA_SENT);
        }
    }
}
