//! Serial manager scenario tests
//!
//! These tests run on the host against the loopback backend. Transmissions
//! stay pending until the test completes them, received data is injected.

#[cfg(test)]
mod common {
    use std::sync::Mutex;

    use serial_manager::{
        CallbackMessage, LoopbackConfig, LoopbackPort, Osa, PortType, ReadHandle, SerialManager,
        SerialManagerConfig, SerialManagerStatus, WriteHandle,
    };

    #[derive(Debug, Clone, PartialEq)]
    pub struct Seen {
        pub id: usize,
        pub length: usize,
        pub status: SerialManagerStatus,
        pub data: Vec<u8>,
    }

    #[derive(Default)]
    pub struct Log(Mutex<Vec<Seen>>);

    impl Log {
        pub fn take(&self) -> Vec<Seen> {
            std::mem::take(&mut *self.0.lock().unwrap())
        }

        pub fn len(&self) -> usize {
            self.0.lock().unwrap().len()
        }
    }

    struct Tag {
        id: usize,
        log: &'static Log,
    }

    pub fn record(param: *mut (), message: &CallbackMessage, status: SerialManagerStatus) {
        let tag = unsafe { &*(param as *const Tag) };
        let data = unsafe { message.data() }.to_vec();
        tag.log.0.lock().unwrap().push(Seen {
            id: tag.id,
            length: message.length,
            status,
            data,
        });
    }

    pub fn tag(log: &'static Log, id: usize) -> *mut () {
        leak(Tag { id, log }) as *const Tag as *mut ()
    }

    pub fn leak<T: 'static>(value: T) -> &'static T {
        Box::leak(Box::new(value))
    }

    pub fn log() -> &'static Log {
        leak(Log::default())
    }

    pub fn ring(size: usize) -> &'static mut [u8] {
        Box::leak(vec![0u8; size].into_boxed_slice())
    }

    pub fn bytes(data: &[u8]) -> &'static [u8] {
        Box::leak(data.to_vec().into_boxed_slice())
    }

    pub fn buffer(size: usize) -> &'static mut [u8] {
        ring(size)
    }

    pub fn config(ring_size: usize) -> SerialManagerConfig<LoopbackConfig> {
        SerialManagerConfig::new(PortType::Virtual, ring(ring_size), LoopbackConfig::default())
    }

    pub fn manager_with<O: Osa + 'static>(
        port: LoopbackPort,
        osa: O,
        config: SerialManagerConfig<LoopbackConfig>,
    ) -> &'static SerialManager<LoopbackPort, O> {
        let manager = leak(SerialManager::new(port, osa));
        manager.init(config).unwrap();
        manager
    }

    pub fn writer<O: Osa>(manager: &SerialManager<LoopbackPort, O>, log: &'static Log, id: usize) -> &'static WriteHandle {
        let handle = leak(WriteHandle::new());
        manager.open_write_handle(handle).unwrap();
        manager.install_tx_callback(handle, record, tag(log, id)).unwrap();
        handle
    }

    pub fn reader<O: Osa>(manager: &SerialManager<LoopbackPort, O>, log: &'static Log, id: usize) -> &'static ReadHandle {
        let handle = leak(ReadHandle::new());
        manager.open_read_handle(handle).unwrap();
        manager.install_rx_callback(handle, record, tag(log, id)).unwrap();
        handle
    }
}

#[cfg(test)]
mod lifecycle_tests {
    use super::common::*;
    use serial_manager::{
        BareMetal, LoopbackConfig, LoopbackPort, PortType, ReadHandle, SerialManager,
        SerialManagerConfig, SerialManagerStatus, WriteHandle,
    };

    #[test]
    fn test_init_and_deinit() {
        let m = manager_with(LoopbackPort::new(), BareMetal, config(32));
        assert!(m.is_initialized());
        assert!(m.port().is_initialized());
        assert_eq!(m.port_type(), PortType::Virtual);

        m.deinit().unwrap();
        assert!(!m.is_initialized());
        assert!(!m.port().is_initialized());
    }

    #[test]
    fn test_init_rejects_port_mismatch() {
        let m = leak(SerialManager::new(LoopbackPort::new(), BareMetal));
        let cfg = SerialManagerConfig::new(PortType::Uart, ring(32), LoopbackConfig::default());
        assert_eq!(m.init(cfg), Err(SerialManagerStatus::Error));
        assert!(!m.is_initialized());
    }

    #[test]
    fn test_init_requires_ring_buffer() {
        let m = leak(SerialManager::new(LoopbackPort::new(), BareMetal));
        let mut cfg = config(32);
        cfg.ring_buffer = None;
        assert_eq!(m.init(cfg), Err(SerialManagerStatus::Error));
    }

    #[test]
    fn test_deinit_refuses_open_handles() {
        let log = log();
        let m = manager_with(LoopbackPort::new(), BareMetal, config(32));
        let w = writer(m, log, 0);
        let r = reader(m, log, 1);

        assert_eq!(m.deinit(), Err(SerialManagerStatus::Busy));
        m.close_write_handle(w).unwrap();
        assert_eq!(m.deinit(), Err(SerialManagerStatus::Busy));
        m.close_read_handle(r).unwrap();
        m.deinit().unwrap();
    }

    #[test]
    fn test_deinit_reports_backend_failure() {
        let m = manager_with(LoopbackPort::new(), BareMetal, config(32));
        m.port().fail_deinit(Some(SerialManagerStatus::Error));

        assert_eq!(m.deinit(), Err(SerialManagerStatus::Error));
        assert!(m.is_initialized());
        assert!(m.port().is_initialized());

        m.deinit().unwrap();
        assert!(!m.is_initialized());
        assert!(!m.port().is_initialized());
    }

    #[test]
    fn test_open_handles() {
        let log = log();
        let m = manager_with(LoopbackPort::new(), BareMetal, config(32));

        let w = writer(m, log, 0);
        assert!(w.is_open());
        assert_eq!(m.opened_write_count(), 1);
        assert_eq!(m.open_write_handle(w), Err(SerialManagerStatus::HandleConflict));
        let _w2 = writer(m, log, 1);
        assert_eq!(m.opened_write_count(), 2);

        let _r = reader(m, log, 2);
        let second = leak(ReadHandle::new());
        assert_eq!(m.open_read_handle(second), Err(SerialManagerStatus::Busy));

        m.close_write_handle(w).unwrap();
        assert!(!w.is_open());
        assert_eq!(m.opened_write_count(), 1);
    }

    #[test]
    fn test_open_before_init_fails() {
        let m = leak(SerialManager::new(LoopbackPort::new(), BareMetal));
        let w = leak(WriteHandle::new());
        assert_eq!(m.open_write_handle(w), Err(SerialManagerStatus::Error));
    }

    #[test]
    #[should_panic(expected = "write handle is not open")]
    fn test_unopened_handle_is_rejected() {
        let m = manager_with(LoopbackPort::new(), BareMetal, config(32));
        let w = leak(WriteHandle::new());
        let _ = m.write_non_blocking(w, b"x");
    }

    #[test]
    #[should_panic(expected = "write handle is not open")]
    fn test_handle_of_other_manager_is_rejected() {
        let log = log();
        let a = manager_with(LoopbackPort::new(), BareMetal, config(32));
        let b = manager_with(LoopbackPort::new(), BareMetal, config(32));
        let w = writer(a, log, 0);
        let _ = b.write_non_blocking(w, b"x");
    }

    #[test]
    fn test_lowpower_forwarded() {
        let m = manager_with(LoopbackPort::new(), BareMetal, config(32));
        m.enter_lowpower().unwrap();
        assert!(m.port().is_lowpower());
        m.exit_lowpower().unwrap();
        assert!(!m.port().is_lowpower());
    }
}

#[cfg(test)]
mod write_tests {
    use super::common::*;
    use serial_manager::{BareMetal, LoopbackPort, SerialManagerStatus, TransferState};

    #[test]
    fn test_round_trip_46_bytes() {
        let log = log();
        let m = manager_with(LoopbackPort::new(), BareMetal, config(64));
        let w = writer(m, log, 0);
        let data: Vec<u8> = (0..46).collect();

        m.write_non_blocking(w, bytes(&data)).unwrap();
        assert_eq!(w.state(), TransferState::InFlight);
        assert_eq!(m.port().pending_tx_len(), Some(46));
        assert_eq!(log.len(), 0);

        assert!(m.port().complete_tx());
        let seen = log.take();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].length, 46);
        assert_eq!(seen[0].status, SerialManagerStatus::Success);
        assert_eq!(seen[0].data, data);

        assert!(!w.is_busy());
        assert_eq!(w.state(), TransferState::Idle);
        assert_eq!(w.so_far(), w.length());
        assert_eq!(m.port().bytes_sent(), 46);
    }

    #[test]
    fn test_fifo_order() {
        let log = log();
        let m = manager_with(LoopbackPort::new(), BareMetal, config(64));
        let writers: Vec<_> = (0..4).map(|id| writer(m, log, id)).collect();

        for (i, w) in writers.iter().enumerate() {
            m.write_non_blocking(w, bytes(&[i as u8; 3])).unwrap();
        }
        // Only the head is handed to the backend
        assert_eq!(m.port().writes_started(), 1);
        assert_eq!(m.running_len(), 4);
        assert_eq!(writers[1].state(), TransferState::Queued);

        while m.port().complete_tx() {}

        let ids: Vec<usize> = log.take().iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3]);
        assert_eq!(m.port().writes_started(), 4);
        assert_eq!(m.running_len(), 0);
        assert_eq!(m.completed_len(), 0);
    }

    #[test]
    fn test_busy_rejection() {
        let log = log();
        let m = manager_with(LoopbackPort::new(), BareMetal, config(64));
        let w = writer(m, log, 0);

        m.write_non_blocking(w, bytes(&[1; 10])).unwrap();
        assert_eq!(m.write_non_blocking(w, bytes(&[2; 5])), Err(SerialManagerStatus::Busy));
        assert_eq!(w.length(), 10);
        assert_eq!(w.state(), TransferState::InFlight);
        assert_eq!(m.port().pending_tx_len(), Some(10));
        assert_eq!(m.running_len(), 1);
    }

    #[test]
    fn test_cancel_before_start() {
        let log = log();
        let m = manager_with(LoopbackPort::new(), BareMetal, config(64));
        let a = writer(m, log, 0);
        let b = writer(m, log, 1);

        m.write_non_blocking(a, bytes(&[0xA; 8])).unwrap();
        m.write_non_blocking(b, bytes(&[0xB; 8])).unwrap();
        m.cancel_writing(b).unwrap();

        let seen = log.take();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].id, 1);
        assert_eq!(seen[0].status, SerialManagerStatus::Canceled);
        assert_eq!(seen[0].length, 0);
        assert_eq!(b.so_far(), 0);
        assert_eq!(b.state(), TransferState::Idle);

        // A is untouched and completes normally
        assert_eq!(a.state(), TransferState::InFlight);
        assert_eq!(m.port().writes_started(), 1);
        assert!(m.port().complete_tx());
        let seen = log.take();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].id, 0);
        assert_eq!(seen[0].status, SerialManagerStatus::Success);
        assert_eq!(seen[0].length, 8);
    }

    #[test]
    fn test_cancel_in_flight_starts_next() {
        let log = log();
        let m = manager_with(LoopbackPort::new(), BareMetal, config(64));
        let a = writer(m, log, 0);
        let b = writer(m, log, 1);

        m.write_non_blocking(a, bytes(&[0xA; 4])).unwrap();
        m.write_non_blocking(b, bytes(&[0xB; 6])).unwrap();
        m.cancel_writing(a).unwrap();

        let seen = log.take();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].id, 0);
        assert_eq!(seen[0].status, SerialManagerStatus::Canceled);

        assert_eq!(b.state(), TransferState::InFlight);
        assert_eq!(m.port().pending_tx_len(), Some(6));
        assert_eq!(m.port().pending_tx_first(), Some(0xB));
    }

    #[test]
    fn test_cancel_idle_is_noop() {
        let log = log();
        let m = manager_with(LoopbackPort::new(), BareMetal, config(64));
        let w = writer(m, log, 0);
        m.cancel_writing(w).unwrap();
        assert_eq!(log.len(), 0);
    }

    #[test]
    fn test_close_cancels_queued_write() {
        let log = log();
        let m = manager_with(LoopbackPort::new(), BareMetal, config(64));
        let a = writer(m, log, 0);
        let b = writer(m, log, 1);

        m.write_non_blocking(a, bytes(&[1; 4])).unwrap();
        m.write_non_blocking(b, bytes(&[2; 4])).unwrap();
        m.close_write_handle(b).unwrap();

        let seen = log.take();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].status, SerialManagerStatus::Canceled);
        assert_eq!(m.running_len(), 1);
        assert_eq!(m.opened_write_count(), 1);
    }

    #[test]
    fn test_close_in_flight_write_starts_next() {
        let log = log();
        let m = manager_with(LoopbackPort::new(), BareMetal, config(64));
        let a = writer(m, log, 0);
        let b = writer(m, log, 1);

        m.write_non_blocking(a, bytes(&[1; 4])).unwrap();
        m.write_non_blocking(b, bytes(&[2; 4])).unwrap();
        m.close_write_handle(a).unwrap();

        let seen = log.take();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].id, 0);
        assert_eq!(seen[0].status, SerialManagerStatus::Canceled);
        assert!(!a.is_open());
        assert_eq!(m.opened_write_count(), 1);
        assert_eq!(m.running_len(), 1);
        assert_eq!(m.completed_len(), 0);
        assert_eq!(m.port().pending_tx_first(), Some(2));
        assert_eq!(b.state(), TransferState::InFlight);
    }

    #[test]
    fn test_close_during_async_abort_holds_queue() {
        let log = log();
        let m = manager_with(LoopbackPort::new(), BareMetal, config(64));
        let a = writer(m, log, 0);
        let b = writer(m, log, 1);
        m.port().set_async_cancel(true);

        m.write_non_blocking(a, bytes(&[1; 4])).unwrap();
        m.write_non_blocking(b, bytes(&[2; 4])).unwrap();
        m.close_write_handle(a).unwrap();

        // The backend still owns the aborted buffer, nothing new starts
        assert_eq!(m.running_len(), 1);
        assert_eq!(m.port().writes_started(), 1);
        assert_eq!(m.port().pending_tx_first(), Some(1));
        assert_eq!(b.state(), TransferState::Queued);

        // The late abort confirmation of the closed write restarts the queue
        m.isr_function();
        assert_eq!(log.len(), 0);
        assert_eq!(m.port().writes_started(), 2);
        assert_eq!(m.port().pending_tx_first(), Some(2));
        assert_eq!(m.port().bytes_sent(), 0);

        m.port().complete_tx();
        let seen = log.take();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].id, 1);
        assert_eq!(seen[0].status, SerialManagerStatus::Success);
        assert_eq!(m.running_len(), 0);
    }

    #[test]
    fn test_write_after_late_abort_completion() {
        let log = log();
        let m = manager_with(LoopbackPort::new(), BareMetal, config(64));
        let a = writer(m, log, 0);
        let b = writer(m, log, 1);
        m.port().set_async_cancel(true);

        m.write_non_blocking(a, b"aa").unwrap();
        m.close_write_handle(a).unwrap();
        assert_eq!(m.running_len(), 0);
        m.isr_function();

        m.write_non_blocking(b, b"bb").unwrap();
        assert_eq!(m.running_len(), 1);
        assert_eq!(m.port().pending_tx_first(), Some(b'b'));
        m.port().complete_tx();
        assert_eq!(log.take()[0].status, SerialManagerStatus::Success);

        // The closed handle can be opened again and reused
        m.open_write_handle(a).unwrap();
        m.install_tx_callback(a, record, tag(log, 0)).unwrap();
        m.write_non_blocking(a, b"again").unwrap();
        assert_eq!(m.port().pending_tx_first(), Some(b'a'));
    }

    #[test]
    fn test_blocking_write() {
        let log = log();
        let m = manager_with(LoopbackPort::new(), BareMetal, config(64));
        let w = writer(m, log, 0);

        // Host builds service the backend while spinning
        m.write_blocking(w, b"blocking").unwrap();
        assert_eq!(w.state(), TransferState::Idle);
        assert_eq!(m.port().bytes_sent(), 8);
        assert_eq!(log.len(), 0);
    }

    #[test]
    fn test_blocking_write_behind_queued_write() {
        let log = log();
        let m = manager_with(LoopbackPort::new(), BareMetal, config(64));
        let a = writer(m, log, 0);
        let b = writer(m, log, 1);

        m.write_non_blocking(a, bytes(&[1; 5])).unwrap();
        m.write_blocking(b, &[2; 7]).unwrap();

        let seen = log.take();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].id, 0);
        assert_eq!(m.port().bytes_sent(), 12);
    }

    #[test]
    fn test_blocking_write_refused() {
        let log = log();
        let m = manager_with(LoopbackPort::new(), BareMetal, config(64));
        let a = writer(m, log, 0);
        m.port().fail_writes(Some(SerialManagerStatus::Busy));
        assert_eq!(m.write_blocking(a, b"abc"), Err(SerialManagerStatus::Busy));
        assert_eq!(a.state(), TransferState::Idle);
        m.port().fail_writes(None);
        m.write_blocking(a, b"abc").unwrap();
        m.cancel_writing(a).unwrap();
    }

    #[test]
    fn test_not_connected() {
        let log = log();
        let m = manager_with(LoopbackPort::new(), BareMetal, config(64));
        let w = writer(m, log, 0);

        m.port().set_connected(false);
        assert_eq!(m.write_non_blocking(w, b"hello"), Err(SerialManagerStatus::NotConnected));
        assert_eq!(w.state(), TransferState::Idle);
        assert!(!w.is_busy());
        assert_eq!(m.running_len(), 0);

        m.port().set_connected(true);
        m.write_non_blocking(w, b"hello").unwrap();
        assert_eq!(m.port().pending_tx_len(), Some(5));
    }

    #[test]
    fn test_refused_queued_write_reports_error() {
        let log = log();
        let m = manager_with(LoopbackPort::new(), BareMetal, config(64));
        let a = writer(m, log, 0);
        let b = writer(m, log, 1);

        m.write_non_blocking(a, bytes(&[1; 3])).unwrap();
        m.write_non_blocking(b, bytes(&[2; 3])).unwrap();
        m.port().fail_writes(Some(SerialManagerStatus::Error));
        assert!(m.port().complete_tx());

        let seen = log.take();
        assert_eq!(seen.len(), 2);
        assert_eq!((seen[0].id, seen[0].status), (0, SerialManagerStatus::Success));
        assert_eq!((seen[1].id, seen[1].status), (1, SerialManagerStatus::Error));
        assert_eq!(b.state(), TransferState::Idle);
        assert_eq!(m.running_len(), 0);
    }

    #[test]
    fn test_empty_write_rejected() {
        let log = log();
        let m = manager_with(LoopbackPort::new(), BareMetal, config(64));
        let w = writer(m, log, 0);
        assert_eq!(m.write_non_blocking(w, b""), Err(SerialManagerStatus::Error));
        assert_eq!(m.write_blocking(w, &[]), Err(SerialManagerStatus::Error));
    }

    #[test]
    fn test_non_blocking_write_needs_callback() {
        let m = manager_with(LoopbackPort::new(), BareMetal, config(64));
        let w = leak(serial_manager::WriteHandle::new());
        m.open_write_handle(w).unwrap();
        assert_eq!(m.write_non_blocking(w, b"x"), Err(SerialManagerStatus::Error));
        assert_eq!(m.running_len(), 0);
    }
}

#[cfg(test)]
mod read_tests {
    use super::common::*;
    use serial_manager::{
        BareMetal, LoopbackConfig, LoopbackPort, PortType, SerialManagerConfig, SerialManagerStatus,
        TransferState, Watermark,
    };

    #[test]
    fn test_read_from_ring_buffer() {
        let log = log();
        let m = manager_with(LoopbackPort::new(), BareMetal, config(64));
        let r = reader(m, log, 0);
        let data: Vec<u8> = (100..120).collect();

        m.port().inject_rx(&data);
        let seen = log.take();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].status, SerialManagerStatus::Notify);
        assert_eq!(seen[0].length, 20);
        assert_eq!(m.ring_len(), 20);

        m.read_non_blocking(r, buffer(20)).unwrap();
        let seen = log.take();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].status, SerialManagerStatus::Success);
        assert_eq!(seen[0].data, data);

        let (head, tail) = m.ring_indices();
        assert_eq!(head, tail);
        assert_eq!(r.state(), TransferState::Idle);
    }

    #[test]
    fn test_read_completes_as_data_arrives() {
        let log = log();
        let m = manager_with(LoopbackPort::new(), BareMetal, config(64));
        let r = reader(m, log, 0);

        m.read_non_blocking(r, buffer(8)).unwrap();
        assert_eq!(r.state(), TransferState::InFlight);
        assert_eq!(log.len(), 0);

        m.port().inject_rx(&[1, 2, 3, 4, 5]);
        assert_eq!(r.so_far(), 5);
        assert_eq!(log.len(), 0);

        m.port().inject_rx(&[6, 7, 8, 9, 10]);
        let seen = log.take();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].status, SerialManagerStatus::Success);
        assert_eq!(seen[0].data, vec![1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(seen[1].status, SerialManagerStatus::Notify);
        assert_eq!(seen[1].length, 2);
        assert_eq!(m.ring_len(), 2);
        assert_eq!(r.state(), TransferState::Idle);
    }

    #[test]
    fn test_try_read() {
        let log = log();
        let m = manager_with(LoopbackPort::new(), BareMetal, config(64));
        let r = reader(m, log, 0);
        let mut out = [0u8; 10];

        assert_eq!(m.try_read(r, &mut out), Ok(0));
        m.port().inject_rx(b"abc");
        assert_eq!(m.try_read(r, &mut out), Ok(3));
        assert_eq!(&out[..3], b"abc");
        assert_eq!(m.try_read(r, &mut out), Ok(0));
        assert!(!r.is_busy());
    }

    #[test]
    fn test_single_byte_read() {
        let log = log();
        let cfg = SerialManagerConfig::new(PortType::Uart, ring(16), LoopbackConfig::default());
        let m = manager_with(LoopbackPort::with_type(PortType::Uart), BareMetal, cfg);
        let r = reader(m, log, 0);

        m.port().inject_rx(b"xy");
        let mut out = [0u8; 1];
        assert_eq!(m.try_read(r, &mut out), Ok(1));
        assert_eq!(out[0], b'x');
        assert_eq!(m.try_read(r, &mut out), Ok(1));
        assert_eq!(out[0], b'y');
        assert_eq!(m.try_read(r, &mut out), Ok(0));
    }

    #[test]
    fn test_blocking_read_from_ring() {
        let log = log();
        let m = manager_with(LoopbackPort::new(), BareMetal, config(64));
        let r = reader(m, log, 0);

        m.port().inject_rx(b"data");
        let mut out = [0u8; 4];
        m.read_blocking(r, &mut out).unwrap();
        assert_eq!(&out, b"data");
        assert_eq!(r.state(), TransferState::Idle);
    }

    #[test]
    fn test_busy_read() {
        let log = log();
        let m = manager_with(LoopbackPort::new(), BareMetal, config(64));
        let r = reader(m, log, 0);

        m.read_non_blocking(r, buffer(4)).unwrap();
        assert_eq!(m.read_non_blocking(r, buffer(4)), Err(SerialManagerStatus::Busy));
        let mut out = [0u8; 4];
        assert_eq!(m.try_read(r, &mut out), Err(SerialManagerStatus::Busy));
    }

    #[test]
    fn test_cancel_reading() {
        let log = log();
        let m = manager_with(LoopbackPort::new(), BareMetal, config(64));
        let r = reader(m, log, 0);

        m.cancel_reading(r).unwrap();
        assert_eq!(log.len(), 0);

        m.read_non_blocking(r, buffer(8)).unwrap();
        m.port().inject_rx(&[9, 9, 9]);
        m.cancel_reading(r).unwrap();

        let seen = log.take();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].status, SerialManagerStatus::Canceled);
        assert_eq!(seen[0].data, vec![9, 9, 9]);
        assert_eq!(r.state(), TransferState::Idle);
        assert!(!r.is_busy());
    }

    #[test]
    fn test_ring_overflow_reported() {
        let log = log();
        let m = manager_with(LoopbackPort::new(), BareMetal, config(8));
        let _r = reader(m, log, 0);

        m.port().inject_rx(&[0, 1, 2, 3, 4, 5, 6, 7]);
        let seen = log.take();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].status, SerialManagerStatus::RingBufferOverflow);
        assert_eq!(seen[0].length, 7);
        assert_eq!(m.ring_len(), 7);
    }

    #[test]
    fn test_flow_control_holds_reception() {
        let log = log();
        let cfg = config(20).with_flow_control(Watermark::new(50));
        let m = manager_with(LoopbackPort::new(), BareMetal, cfg);
        let r = reader(m, log, 0);
        assert!(m.port().is_rx_armed());

        m.port().inject_rx(&[1; 4]);
        assert!(m.port().is_rx_armed());

        m.port().inject_rx(&[2; 6]);
        assert!(!m.port().is_rx_armed());

        let mut out = [0u8; 16];
        assert_eq!(m.try_read(r, &mut out), Ok(10));
        assert!(m.port().is_rx_armed());
        assert_eq!(m.port().rx_room(), 19);
    }

    #[test]
    fn test_without_flow_control_always_rearms() {
        let log = log();
        let m = manager_with(LoopbackPort::new(), BareMetal, config(20));
        let _r = reader(m, log, 0);

        m.port().inject_rx(&[1; 18]);
        assert!(m.port().is_rx_armed());
        assert_eq!(m.port().rx_room(), 1);
    }

    #[test]
    fn test_packet_port_reads_into_reader_buffer() {
        let log = log();
        let cfg = SerialManagerConfig::new(PortType::SpiSlave, ring(16), LoopbackConfig::default());
        let m = manager_with(LoopbackPort::with_type(PortType::SpiSlave), BareMetal, cfg);
        let r = reader(m, log, 0);

        // Nothing armed: a packet is dropped
        m.port().inject_rx(b"lost");
        assert_eq!(log.len(), 0);

        m.read_non_blocking(r, buffer(16)).unwrap();
        assert!(m.port().is_rx_armed());
        m.port().inject_rx(b"packet");

        let seen = log.take();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].status, SerialManagerStatus::Success);
        assert_eq!(seen[0].data, b"packet".to_vec());
        assert_eq!(r.state(), TransferState::Idle);
        assert_eq!(m.ring_len(), 0);
    }

    #[test]
    fn test_loopback_echo() {
        let log = log();
        let cfg = SerialManagerConfig::new(
            PortType::Virtual,
            ring(32),
            LoopbackConfig {
                loopback: true,
                connected: true,
            },
        );
        let m = manager_with(LoopbackPort::new(), BareMetal, cfg);
        let w = writer(m, log, 0);
        let r = reader(m, log, 1);

        m.write_non_blocking(w, b"ping").unwrap();
        m.port().complete_tx();

        let seen = log.take();
        assert_eq!(seen.len(), 2);
        assert_eq!((seen[0].id, seen[0].status, seen[0].length), (1, SerialManagerStatus::Notify, 4));
        assert_eq!((seen[1].id, seen[1].status), (0, SerialManagerStatus::Success));

        let mut out = [0u8; 8];
        assert_eq!(m.try_read(r, &mut out), Ok(4));
        assert_eq!(&out[..4], b"ping");
    }
}

#[cfg(test)]
mod task_tests {
    use super::common::*;
    use serial_manager::{LoopbackPort, SerialManagerStatus, TaskSignal, TransferState};

    #[test]
    fn test_completion_deferred_to_task() {
        let log = log();
        let m = manager_with(LoopbackPort::new(), TaskSignal::new(), config(32));
        let w = writer(m, log, 0);

        m.write_non_blocking(w, b"later").unwrap();
        m.port().complete_tx();
        assert_eq!(log.len(), 0);
        assert_eq!(w.state(), TransferState::Completed);
        assert_eq!(m.completed_len(), 1);
        assert_eq!(m.osa().pending(), 1);

        assert!(m.poll());
        let seen = log.take();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].status, SerialManagerStatus::Success);
        assert_eq!(w.state(), TransferState::Idle);
        assert!(!m.poll());
    }

    #[test]
    fn test_task_starts_writes() {
        let log = log();
        let m = manager_with(LoopbackPort::new(), TaskSignal::new(), config(32).with_task_tx());
        let a = writer(m, log, 0);
        let b = writer(m, log, 1);

        m.write_non_blocking(a, b"one").unwrap();
        m.write_non_blocking(b, b"two").unwrap();
        assert_eq!(m.port().writes_started(), 0);
        assert_eq!(a.state(), TransferState::Queued);

        assert!(m.poll());
        assert_eq!(m.port().writes_started(), 1);
        assert_eq!(m.port().pending_tx_first(), Some(b'o'));

        m.port().complete_tx();
        while m.poll() {}
        assert_eq!(m.port().writes_started(), 2);
        assert_eq!(m.port().pending_tx_first(), Some(b't'));

        m.port().complete_tx();
        while m.poll() {}
        let ids: Vec<usize> = log.take().iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![0, 1]);
    }

    #[test]
    fn test_rx_notify_coalesced_in_task() {
        let log = log();
        let m = manager_with(LoopbackPort::new(), TaskSignal::new(), config(32).with_task_rx_notify());
        let _r = reader(m, log, 0);

        m.port().inject_rx(b"abc");
        m.port().inject_rx(b"de");
        assert_eq!(log.len(), 0);
        assert_eq!(m.osa().pending(), 1);

        assert!(m.poll());
        let seen = log.take();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].status, SerialManagerStatus::Notify);
        assert_eq!(seen[0].length, 5);
    }

    #[test]
    fn test_blocking_write_with_task() {
        let log = log();
        let m = manager_with(LoopbackPort::new(), TaskSignal::new(), config(32).with_task_tx());
        let w = writer(m, log, 0);

        m.write_blocking(w, b"sync").unwrap();
        assert_eq!(m.port().bytes_sent(), 4);
        assert_eq!(w.state(), TransferState::Idle);
    }
}

#[cfg(test)]
mod lowpower_tests {
    use super::common::*;
    use serial_manager::{BareMetal, LoopbackPort, TaskSignal, TransferState};

    /// Low-power hooks with counters private to the calling test
    macro_rules! counting_hooks {
        () => {{
            use std::sync::atomic::{AtomicUsize, Ordering};

            static ENTERED: AtomicUsize = AtomicUsize::new(0);
            static EXITED: AtomicUsize = AtomicUsize::new(0);

            fn enter(_mode: i32) -> i32 {
                ENTERED.fetch_add(1, Ordering::SeqCst);
                0
            }

            fn exit(_mode: i32) -> i32 {
                EXITED.fetch_add(1, Ordering::SeqCst);
                0
            }

            let callbacks = serial_manager::LowpowerCriticalCallbacks {
                enter_critical: Some(enter),
                exit_critical: Some(exit),
            };
            let counts = || (ENTERED.load(Ordering::SeqCst), EXITED.load(Ordering::SeqCst));
            (callbacks, counts)
        }};
    }

    #[test]
    fn test_constraint_held_while_writing() {
        let log = log();
        let (callbacks, counts) = counting_hooks!();
        let m = manager_with(LoopbackPort::new(), BareMetal, config(32).with_lowpower_callbacks(callbacks));
        let a = writer(m, log, 0);
        let b = writer(m, log, 1);

        m.write_non_blocking(a, b"1").unwrap();
        m.write_non_blocking(b, b"2").unwrap();
        assert_eq!(counts(), (1, 0));

        // Queued writes canceled before starting never took the constraint
        m.cancel_writing(b).unwrap();
        assert_eq!(counts(), (1, 0));

        m.port().complete_tx();
        assert_eq!(counts(), (1, 1));

        m.set_lowpower_critical_cb(None).unwrap();
        m.write_non_blocking(a, b"3").unwrap();
        m.port().complete_tx();
        assert_eq!(counts(), (1, 1));
    }

    #[test]
    fn test_close_releases_undelivered_write() {
        let log = log();
        let (callbacks, counts) = counting_hooks!();
        let m = manager_with(LoopbackPort::new(), TaskSignal::new(), config(32).with_lowpower_callbacks(callbacks));
        let w = writer(m, log, 0);

        m.write_non_blocking(w, b"hello").unwrap();
        m.port().complete_tx();
        assert_eq!(w.state(), TransferState::Completed);
        assert_eq!(m.completed_len(), 1);
        assert_eq!(counts(), (1, 0));

        m.close_write_handle(w).unwrap();
        assert_eq!(m.completed_len(), 0);
        assert_eq!(counts(), (1, 1));

        while m.poll() {}
        assert_eq!(log.len(), 0);
        assert_eq!(counts(), (1, 1));
    }

    #[test]
    fn test_close_releases_in_flight_write() {
        let log = log();
        let (callbacks, counts) = counting_hooks!();
        let m = manager_with(LoopbackPort::new(), TaskSignal::new(), config(32).with_lowpower_callbacks(callbacks));
        let a = writer(m, log, 0);
        let b = writer(m, log, 1);

        m.write_non_blocking(a, b"hello").unwrap();
        m.close_write_handle(a).unwrap();
        assert_eq!(m.running_len(), 0);
        assert_eq!(m.completed_len(), 0);
        assert_eq!(counts(), (1, 1));

        while m.poll() {}
        assert_eq!(log.len(), 0);

        // The constraint balances across a following write
        m.write_non_blocking(b, b"next").unwrap();
        m.port().complete_tx();
        while m.poll() {}
        assert_eq!(log.take()[0].id, 1);
        assert_eq!(counts(), (2, 2));
    }
}

#[cfg(test)]
mod blocking_type_tests {
    use super::common::*;
    use serial_manager::{
        BareMetal, HandleType, LoopbackConfig, LoopbackPort, PortType, ReadHandle, SerialManagerConfig,
        SerialManagerStatus, WriteHandle,
    };

    #[test]
    fn test_blocking_manager_forwards_to_backend() {
        let cfg = SerialManagerConfig::blocking(PortType::Virtual, LoopbackConfig::default());
        let m = manager_with(LoopbackPort::new(), BareMetal, cfg);
        assert_eq!(m.handle_type(), HandleType::Blocking);

        let w = leak(WriteHandle::new());
        let r = leak(ReadHandle::new());
        m.open_write_handle(w).unwrap();
        m.open_read_handle(r).unwrap();

        m.write_blocking(w, b"direct").unwrap();
        assert_eq!(m.port().bytes_sent(), 6);
        assert_eq!(m.port().writes_started(), 0);
        assert_eq!(m.write_non_blocking(w, b"queued"), Err(SerialManagerStatus::Error));

        m.port().inject_rx(b"abcd");
        let mut out = [0xFFu8; 3];
        m.read_blocking(r, &mut out).unwrap();
        assert_eq!(&out, b"abc");
        assert_eq!(m.port().staged_len(), 1);
        assert_eq!(m.read_non_blocking(r, buffer(3)), Err(SerialManagerStatus::Error));
        assert_eq!(m.try_read(r, &mut out), Err(SerialManagerStatus::Error));

        // Short of data, the read fails instead of spinning forever
        assert_eq!(m.read_blocking(r, &mut out), Err(SerialManagerStatus::Error));
        let mut last = [0u8; 1];
        m.read_blocking(r, &mut last).unwrap();
        assert_eq!(&last, b"d");

        m.close_write_handle(w).unwrap();
        m.close_read_handle(r).unwrap();
        m.deinit().unwrap();
    }

    #[test]
    fn test_blocking_manager_loopback_echo() {
        let port_config = LoopbackConfig {
            loopback: true,
            ..LoopbackConfig::default()
        };
        let cfg = SerialManagerConfig::blocking(PortType::Virtual, port_config);
        let m = manager_with(LoopbackPort::new(), BareMetal, cfg);
        let w = leak(WriteHandle::new());
        let r = leak(ReadHandle::new());
        m.open_write_handle(w).unwrap();
        m.open_read_handle(r).unwrap();

        m.write_blocking(w, b"ping").unwrap();
        m.write_blocking(w, b"!").unwrap();
        let mut out = [0u8; 5];
        m.read_blocking(r, &mut out).unwrap();
        assert_eq!(&out, b"ping!");
        assert_eq!(m.port().staged_len(), 0);
    }
}
