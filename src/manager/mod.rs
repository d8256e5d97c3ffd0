//! Serial manager dispatcher
//!
//! A [`SerialManager`] owns one backend, the receive ring buffer and two
//! write queues:
//! - the running queue, whose head is the one write in flight and whose
//!   other members wait behind it in FIFO order
//! - the completed queue, holding finished non-blocking writes until their
//!   callbacks are delivered
//!
//! Backends report completions through [`SerialManager::tx_callback`] and
//! [`SerialManager::rx_callback`], installed during [`SerialManager::init`].
//! Application callbacks then run either inline or from the serial manager
//! task, depending on the [`Osa`].
//!
//! The manager registers its own address with the backend, so it has to
//! live at a fixed address: `init` takes `&'static self`.

use core::ptr::NonNull;

use crate::config::{CFG_EVENT_NUMBER, CFG_LP_CONSTRAINT, CFG_READ_TAG, CFG_WRITE_TAG};
use crate::core::cs_cell::CsCell;
use crate::critical::critical_section;
use crate::error::{SerialManagerStatus, SerialResult};
use crate::list::List;
use crate::osa::Osa;
use crate::port::{PortType, SerialPort};
use crate::types::{HandleType, LowpowerCriticalCallbacks, SerialCallback, TransferState};

pub mod handle;
pub mod ring_buffer;

mod read;
mod task;
mod write;

pub use handle::{ReadHandle, WriteHandle};
use handle::HandleState;
use ring_buffer::{RingBuffer, Watermark};

// ============ Configuration ============

/// Settings consumed by [`SerialManager::init`]
pub struct SerialManagerConfig<C> {
    /// Must match the backend's [`SerialPort::port_type`]
    pub port_type: PortType,
    pub block_type: HandleType,
    /// Receive storage, required for [`HandleType::NonBlocking`]
    pub ring_buffer: Option<&'static mut [u8]>,
    pub port_config: C,
    /// Stop re-arming reception while the ring is at or above the mark
    pub flow_control: Option<Watermark>,
    /// Start queued writes from the task instead of the TX callback
    pub task_handles_tx: bool,
    /// Deliver "data available" notifications from the task
    pub task_handles_rx_notify: bool,
    pub lowpower_callbacks: Option<LowpowerCriticalCallbacks>,
}

impl<C> SerialManagerConfig<C> {
    /// Non-blocking manager receiving into `ring_buffer`
    pub fn new(port_type: PortType, ring_buffer: &'static mut [u8], port_config: C) -> Self {
        SerialManagerConfig {
            port_type,
            block_type: HandleType::NonBlocking,
            ring_buffer: Some(ring_buffer),
            port_config,
            flow_control: None,
            task_handles_tx: false,
            task_handles_rx_notify: false,
            lowpower_callbacks: None,
        }
    }

    /// Manager that only forwards synchronous calls to the backend
    pub fn blocking(port_type: PortType, port_config: C) -> Self {
        SerialManagerConfig {
            port_type,
            block_type: HandleType::Blocking,
            ring_buffer: None,
            port_config,
            flow_control: None,
            task_handles_tx: false,
            task_handles_rx_notify: false,
            lowpower_callbacks: None,
        }
    }

    pub fn with_flow_control(mut self, watermark: Watermark) -> Self {
        self.flow_control = Some(watermark);
        self
    }

    pub fn with_task_tx(mut self) -> Self {
        self.task_handles_tx = true;
        self
    }

    pub fn with_task_rx_notify(mut self) -> Self {
        self.task_handles_rx_notify = true;
        self
    }

    pub fn with_lowpower_callbacks(mut self, callbacks: LowpowerCriticalCallbacks) -> Self {
        self.lowpower_callbacks = Some(callbacks);
        self
    }
}

// ============ Manager ============

pub(crate) struct ManagerState {
    initialized: bool,
    handle_type: HandleType,
    port_type: PortType,
    opened_read: Option<NonNull<ReadHandle>>,
    opened_write_count: u32,
    ring: RingBuffer,
    events: [u8; CFG_EVENT_NUMBER],
    flow_control: Option<Watermark>,
    task_handles_tx: bool,
    task_handles_rx_notify: bool,
    lowpower: Option<LowpowerCriticalCallbacks>,
    /// A closed write is still being aborted by the backend
    tx_aborting: bool,
}

impl ManagerState {
    const fn new() -> Self {
        ManagerState {
            initialized: false,
            handle_type: HandleType::NonBlocking,
            port_type: PortType::None,
            opened_read: None,
            opened_write_count: 0,
            ring: RingBuffer::new(),
            events: [0; CFG_EVENT_NUMBER],
            flow_control: None,
            task_handles_tx: false,
            task_handles_rx_notify: false,
            lowpower: None,
            tx_aborting: false,
        }
    }
}

/// Serial manager instance
pub struct SerialManager<P: SerialPort, O: Osa> {
    port: P,
    osa: O,
    state: CsCell<ManagerState>,
    running: List,
    completed: List,
}

impl<P: SerialPort, O: Osa> SerialManager<P, O> {
    pub const fn new(port: P, osa: O) -> Self {
        SerialManager {
            port,
            osa,
            state: CsCell::new(ManagerState::new()),
            running: List::new(),
            completed: List::new(),
        }
    }

    /// Initialize the manager and its backend
    ///
    /// # Returns
    /// * `Err(SerialManagerStatus::Error)` - Missing ring buffer, port type
    ///   mismatch, or the backend failed to initialize
    pub fn init(&'static self, config: SerialManagerConfig<P::Config>) -> SerialResult<()> {
        let SerialManagerConfig {
            port_type,
            block_type,
            ring_buffer,
            port_config,
            flow_control,
            task_handles_tx,
            task_handles_rx_notify,
            lowpower_callbacks,
        } = config;
        let non_blocking = block_type == HandleType::NonBlocking;

        if non_blocking && ring_buffer.as_ref().map_or(true, |ring| ring.len() < 2) {
            error!("serial manager: non-blocking mode needs a ring buffer");
            return Err(SerialManagerStatus::Error);
        }
        if port_type != self.port.port_type() {
            error!("serial manager: port type {} does not match the backend", port_type);
            return Err(SerialManagerStatus::Error);
        }

        critical_section(|cs| {
            let state = self.state.get(cs);
            *state = ManagerState::new();
            state.handle_type = block_type;
            state.port_type = port_type;
            state.flow_control = flow_control;
            state.task_handles_tx = task_handles_tx;
            state.task_handles_rx_notify = task_handles_rx_notify;
            state.lowpower = lowpower_callbacks;
            if let Some(ring) = ring_buffer {
                state.ring.attach(ring);
            }
        });
        self.running.init(0);
        self.completed.init(0);

        if non_blocking {
            self.osa.semaphore_create()?;
        }

        if let Err(_status) = self.port.init(port_config) {
            error!("serial manager: backend init failed: {}", _status);
            return Err(SerialManagerStatus::Error);
        }

        if non_blocking {
            let param = self.as_param() as *mut ();
            self.port.install_tx_callback(Self::tx_callback, param)?;
            self.port.install_rx_callback(Self::rx_callback, param)?;
        }

        critical_section(|cs| self.state.get(cs).initialized = true);
        info!("serial manager: initialized on {} port", port_type);
        Ok(())
    }

    /// Tear down the backend
    ///
    /// # Returns
    /// * `Err(SerialManagerStatus::Busy)` - A read or write handle is still open
    /// * `Err(status)` - The backend refused to shut down; the manager stays
    ///   initialized and the call can be retried
    pub fn deinit(&self) -> SerialResult<()> {
        let (busy, non_blocking) = critical_section(|cs| {
            let state = self.state.get(cs);
            (
                state.opened_read.is_some() || state.opened_write_count > 0,
                state.handle_type == HandleType::NonBlocking,
            )
        });
        if busy {
            warn!("serial manager: deinit with open handles");
            return Err(SerialManagerStatus::Busy);
        }

        if let Err(status) = self.port.deinit() {
            warn!("serial manager: backend deinit failed: {}", status);
            return Err(status);
        }
        if non_blocking {
            self.osa.semaphore_destroy();
        }

        critical_section(|cs| {
            let state = self.state.get(cs);
            state.initialized = false;
            state.ring.detach();
        });
        info!("serial manager: deinitialized");
        Ok(())
    }

    // ============ Handles ============

    /// Open a write handle on this manager
    ///
    /// # Returns
    /// * `Err(SerialManagerStatus::Error)` - Manager not initialized
    /// * `Err(SerialManagerStatus::HandleConflict)` - Handle already open
    pub fn open_write_handle(&self, handle: &'static WriteHandle) -> SerialResult<()> {
        critical_section(|cs| {
            let state = self.state.get(cs);
            if !state.initialized {
                return Err(SerialManagerStatus::Error);
            }
            let inner = handle.inner.get(cs);
            if inner.tag == CFG_WRITE_TAG {
                return Err(SerialManagerStatus::HandleConflict);
            }
            *inner = HandleState::open(self.as_param(), CFG_WRITE_TAG);
            state.opened_write_count += 1;
            Ok(())
        })
    }

    /// Close a write handle, canceling its outstanding write
    pub fn close_write_handle(&self, handle: &WriteHandle) -> SerialResult<()> {
        self.check_write(handle);
        if self.handle_type() == HandleType::NonBlocking {
            let _ = self.cancel_writing(handle);
        }

        let lp_held = critical_section(|cs| {
            // A finished write still waiting for delivery is dropped. A write
            // whose abort the backend has not confirmed yet leaves the running
            // queue now; its late completion then only restarts the queue.
            let list = handle.link.list();
            let inner = handle.inner.get(cs);
            let state = self.state.get(cs);
            if list == Some(NonNull::from(&self.running)) && inner.transfer.state == TransferState::InFlight {
                state.tx_aborting = true;
            }
            if list == Some(NonNull::from(&self.completed)) || list == Some(NonNull::from(&self.running)) {
                let _ = handle.link.remove();
            }
            state.opened_write_count = state.opened_write_count.saturating_sub(1);
            let lp_held = core::mem::take(&mut inner.transfer.lp_held);
            *inner = HandleState::CLOSED;
            lp_held
        });
        if lp_held {
            self.lp_exit();
        }
        Ok(())
    }

    /// Open the reader of this manager
    ///
    /// # Returns
    /// * `Err(SerialManagerStatus::Error)` - Manager not initialized
    /// * `Err(SerialManagerStatus::Busy)` - Another reader is open
    /// * `Err(SerialManagerStatus::HandleConflict)` - Handle already open
    pub fn open_read_handle(&self, handle: &'static ReadHandle) -> SerialResult<()> {
        let room = critical_section(|cs| {
            let state = self.state.get(cs);
            if !state.initialized {
                return Err(SerialManagerStatus::Error);
            }
            if state.opened_read.is_some() {
                return Err(SerialManagerStatus::Busy);
            }
            let inner = handle.inner.get(cs);
            if inner.tag == CFG_READ_TAG {
                return Err(SerialManagerStatus::HandleConflict);
            }
            *inner = HandleState::open(self.as_param(), CFG_READ_TAG);
            state.opened_read = Some(NonNull::from(handle));

            let streams = state.handle_type == HandleType::NonBlocking && !state.port_type.is_packet_based();
            Ok(streams.then(|| state.ring.free()))
        })?;

        if let Some(room) = room {
            // SAFETY: stream backends receive into their own storage.
            let _ = unsafe { self.port.read(None, room) };
        }
        Ok(())
    }

    /// Close the reader, canceling its outstanding read
    pub fn close_read_handle(&self, handle: &ReadHandle) -> SerialResult<()> {
        self.check_read(handle);
        if self.handle_type() == HandleType::NonBlocking {
            let _ = self.cancel_reading(handle);
        }

        critical_section(|cs| {
            self.state.get(cs).opened_read = None;
            *handle.inner.get(cs) = HandleState::CLOSED;
        });
        Ok(())
    }

    /// Register the completion callback of a write handle
    pub fn install_tx_callback(&self, handle: &WriteHandle, callback: SerialCallback, param: *mut ()) -> SerialResult<()> {
        self.check_write(handle);
        critical_section(|cs| {
            let inner = handle.inner.get(cs);
            inner.callback = Some(callback);
            inner.callback_param = param;
        });
        Ok(())
    }

    /// Register the completion and notification callback of the reader
    pub fn install_rx_callback(&self, handle: &ReadHandle, callback: SerialCallback, param: *mut ()) -> SerialResult<()> {
        self.check_read(handle);
        critical_section(|cs| {
            let inner = handle.inner.get(cs);
            inner.callback = Some(callback);
            inner.callback_param = param;
        });
        Ok(())
    }

    // ============ Low power ============

    pub fn enter_lowpower(&self) -> SerialResult<()> {
        self.port.enter_lowpower()
    }

    pub fn exit_lowpower(&self) -> SerialResult<()> {
        self.port.exit_lowpower()
    }

    /// Replace the hooks that keep the system awake while writes are in flight
    pub fn set_lowpower_critical_cb(&self, callbacks: Option<LowpowerCriticalCallbacks>) -> SerialResult<()> {
        critical_section(|cs| self.state.get(cs).lowpower = callbacks);
        Ok(())
    }

    fn lp_enter(&self) {
        let hook = critical_section(|cs| self.state.get(cs).lowpower.and_then(|cb| cb.enter_critical));
        if let Some(enter) = hook {
            let _ = enter(CFG_LP_CONSTRAINT);
        }
    }

    fn lp_exit(&self) {
        let hook = critical_section(|cs| self.state.get(cs).lowpower.and_then(|cb| cb.exit_critical));
        if let Some(exit) = hook {
            let _ = exit(CFG_LP_CONSTRAINT);
        }
    }

    // ============ Misc ============

    /// Service the backend as its interrupt handler would
    pub fn isr_function(&self) {
        critical_section(|_cs| self.port.isr_function());
    }

    pub fn port(&self) -> &P {
        &self.port
    }

    pub fn osa(&self) -> &O {
        &self.osa
    }

    pub fn is_initialized(&self) -> bool {
        critical_section(|cs| self.state.get(cs).initialized)
    }

    pub fn handle_type(&self) -> HandleType {
        critical_section(|cs| self.state.get(cs).handle_type)
    }

    pub fn port_type(&self) -> PortType {
        critical_section(|cs| self.state.get(cs).port_type)
    }

    pub fn opened_write_count(&self) -> u32 {
        critical_section(|cs| self.state.get(cs).opened_write_count)
    }

    /// Bytes waiting in the ring buffer
    pub fn ring_len(&self) -> usize {
        critical_section(|cs| self.state.get(cs).ring.len())
    }

    /// Ring buffer write and read indices
    pub fn ring_indices(&self) -> (usize, usize) {
        critical_section(|cs| {
            let ring = &self.state.get(cs).ring;
            (ring.head(), ring.tail())
        })
    }

    /// Writes in flight or waiting to be started
    pub fn running_len(&self) -> u32 {
        self.running.size()
    }

    /// Finished writes whose callbacks are not delivered yet
    pub fn completed_len(&self) -> u32 {
        self.completed.size()
    }

    #[inline]
    fn as_param(&self) -> *const () {
        self as *const Self as *const ()
    }

    fn check_write(&self, handle: &WriteHandle) {
        let (tag, manager) = critical_section(|cs| {
            let inner = handle.inner.get(cs);
            (inner.tag, inner.manager)
        });
        assert!(
            tag == CFG_WRITE_TAG && manager == self.as_param(),
            "write handle is not open on this serial manager"
        );
    }

    fn check_read(&self, handle: &ReadHandle) {
        let (tag, manager) = critical_section(|cs| {
            let inner = handle.inner.get(cs);
            (inner.tag, inner.manager)
        });
        assert!(
            tag == CFG_READ_TAG && manager == self.as_param(),
            "read handle is not open on this serial manager"
        );
    }
}
