//! Completion delivery
//!
//! Callbacks from the backend only count events. The counters are drained
//! by [`SerialManager::process_events`], which runs inline right after the
//! count under [`BareMetal`](crate::osa::BareMetal), or from the serial
//! manager task when the [`Osa`] defers.

use super::handle::{ReadHandle, WriteHandle};
use super::SerialManager;
use crate::critical::critical_section;
use crate::error::SerialManagerStatus;
use crate::osa::Osa;
use crate::port::SerialPort;
use crate::types::{event, CallbackMessage, TransferState};

impl<P: SerialPort, O: Osa> SerialManager<P, O> {
    /// Queued writes are started by the task rather than the TX callback
    pub(crate) fn task_handles_tx(&self) -> bool {
        self.osa.deferred() && critical_section(|cs| self.state.get(cs).task_handles_tx)
    }

    /// Count an event and get it processed
    pub(crate) fn signal(&self, index: usize) {
        critical_section(|cs| {
            let count = &mut self.state.get(cs).events[index];
            *count = count.saturating_add(1);
        });
        if self.osa.deferred() {
            self.osa.semaphore_post();
        } else {
            self.process_events();
        }
    }

    /// Count a ring buffer notification unless one is already pending
    pub(crate) fn signal_rx_notify(&self) {
        let first = critical_section(|cs| {
            let count = &mut self.state.get(cs).events[event::DATA_RX_NOTIFY];
            let first = *count == 0;
            if first {
                *count = 1;
            }
            first
        });
        if first {
            self.osa.semaphore_post();
        }
    }

    fn take_event(&self, index: usize) -> bool {
        critical_section(|cs| {
            let count = &mut self.state.get(cs).events[index];
            let pending = *count > 0;
            *count = count.saturating_sub(1);
            pending
        })
    }

    /// Deliver everything the event counters announce
    pub fn process_events(&self) {
        if self.take_event(event::DATA_START_SEND) {
            let _ = self.start_writing(true);
        }

        if self.take_event(event::DATA_SENT) {
            self.deliver_writes();
        }

        if self.take_event(event::DATA_RECEIVED) {
            self.deliver_read();
        }

        let notify = critical_section(|cs| {
            let state = self.state.get(cs);
            let count = core::mem::take(&mut state.events[event::DATA_RX_NOTIFY]);
            (count > 0).then(|| (state.opened_read, state.ring.len()))
        });
        if let Some((Some(reader), available)) = notify {
            if available > 0 {
                // SAFETY: the open reader is 'static until it is closed.
                let reader: &ReadHandle = unsafe { reader.as_ref() };
                let callback = critical_section(|cs| {
                    let inner = reader.inner.get(cs);
                    inner.callback.map(|callback| (callback, inner.callback_param))
                });
                if let Some((callback, param)) = callback {
                    callback(param, &CallbackMessage::notify(available), SerialManagerStatus::Notify);
                }
            }
        }
    }

    /// Drain the completed queue, oldest first
    fn deliver_writes(&self) {
        while let Some(link) = self.completed.remove_head() {
            // SAFETY: only write handles are linked into the completed queue.
            let handle = unsafe { WriteHandle::from_link(link) };
            let (message, status, lp_held, callback) = critical_section(|cs| {
                let inner = handle.inner.get(cs);
                let lp_held = core::mem::take(&mut inner.transfer.lp_held);
                let status = inner.transfer.status;
                let message = inner.transfer.finish();
                (message, status, lp_held, inner.callback.map(|callback| (callback, inner.callback_param)))
            });
            trace!("serial manager: delivering write completion: {}", status);

            if let Some((callback, param)) = callback {
                callback(param, &message, status);
            }
            if lp_held {
                self.lp_exit();
            }
        }
    }

    fn deliver_read(&self) {
        let done = critical_section(|cs| {
            let reader = self.state.get(cs).opened_read?;
            // SAFETY: the open reader is 'static until it is closed.
            let inner = unsafe { reader.as_ref() }.inner.get(cs);
            if inner.transfer.state != TransferState::Completed {
                return None;
            }
            let status = inner.transfer.status;
            let message = inner.transfer.finish();
            Some((message, status, inner.callback.map(|callback| (callback, inner.callback_param))))
        });
        if let Some((message, status, Some((callback, param)))) = done {
            callback(param, &message, status);
        }
    }

    /// One step of the serial manager task
    ///
    /// Takes one semaphore count and processes the pending events.
    /// Returns `false` if nothing was signaled.
    pub fn poll(&self) -> bool {
        if !self.osa.semaphore_try_wait() {
            return false;
        }
        self.process_events();
        true
    }

    /// Body of the serial manager task
    pub fn run_task(&self) -> ! {
        loop {
            if self.osa.semaphore_wait() {
                self.process_events();
            }
        }
    }
}
