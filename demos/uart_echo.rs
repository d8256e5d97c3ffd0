//! UART Echo Example - serial manager on STM32F401 USART2
//!
//! Echoes every received chunk back through a non-blocking write. The
//! USART is serviced from the main loop instead of its interrupt.

#![no_std]
#![no_main]

use core::ptr::addr_of_mut;

use cortex_m_rt::entry;
use defmt_rtt as _;
use panic_probe as _;

use serial_manager::port::stm32_usart::{Stm32Usart, UsartConfig};
use serial_manager::{
    BareMetal, CallbackMessage, PortType, ReadHandle, SerialManager, SerialManagerConfig,
    SerialManagerStatus, Watermark, WriteHandle,
};

// ============ Storage ============

static MANAGER: SerialManager<Stm32Usart, BareMetal> = SerialManager::new(Stm32Usart::new(), BareMetal);
static WRITER: WriteHandle = WriteHandle::new();
static READER: ReadHandle = ReadHandle::new();

static mut RING: [u8; 128] = [0; 128];
static mut ECHO: [u8; 32] = [0; 32];

// ============ Callbacks ============

fn on_sent(_: *mut (), message: &CallbackMessage, status: SerialManagerStatus) {
    serial_manager::debug!("sent {} bytes: {}", message.length, status);
}

fn on_received(_: *mut (), message: &CallbackMessage, status: SerialManagerStatus) {
    if status == SerialManagerStatus::RingBufferOverflow {
        serial_manager::warn!("receive overflow");
    }
    if message.length == 0 || WRITER.is_busy() {
        return;
    }

    // SAFETY: ECHO is only touched here, and only while no echo is in flight.
    let echo: &'static mut [u8; 32] = unsafe { &mut *addr_of_mut!(ECHO) };
    let count = match MANAGER.try_read(&READER, &mut echo[..]) {
        Ok(count) if count > 0 => count,
        _ => return,
    };
    let echo: &'static [u8; 32] = echo;
    let _ = MANAGER.write_non_blocking(&WRITER, &echo[..count]);
}

// ============ Main ============

#[entry]
fn main() -> ! {
    // SAFETY: handed over once, before anything else can see it.
    let ring = unsafe { &mut *addr_of_mut!(RING) };
    let config = SerialManagerConfig::new(PortType::Uart, ring, UsartConfig::default())
        .with_flow_control(Watermark::default());

    MANAGER.init(config).expect("serial manager init failed");
    MANAGER.open_write_handle(&WRITER).expect("open write handle failed");
    MANAGER.open_read_handle(&READER).expect("open read handle failed");
    MANAGER
        .install_tx_callback(&WRITER, on_sent, core::ptr::null_mut())
        .expect("install tx callback failed");
    MANAGER
        .install_rx_callback(&READER, on_received, core::ptr::null_mut())
        .expect("install rx callback failed");

    MANAGER
        .write_non_blocking(&WRITER, b"serial manager echo ready\r\n")
        .expect("greeting failed");
    serial_manager::info!("echo running");

    loop {
        MANAGER.isr_function();
    }
}
