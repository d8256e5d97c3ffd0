//! STM32F401 USART2 backend
//!
//! Interrupt driven, one byte per TXE/RXNE event, on the Nucleo virtual COM
//! port pins (PA2 TX, PA3 RX, AF7). The USART2 interrupt handler must call
//! [`SerialManager::isr_function`](crate::SerialManager::isr_function), or
//! the application polls it.
//!
//! Reception is disarmed after every delivered byte and re-armed by the
//! manager, which is what lets ring buffer flow control hold the line.

use core::ptr::NonNull;

use stm32_metapac as pac;

use crate::core::cs_cell::CsCell;
use crate::critical::critical_section;
use crate::error::{SerialManagerStatus, SerialResult};
use crate::port::{PortType, SerialPort};
use crate::types::{CallbackMessage, SerialCallback};

/// USART settings
#[derive(Debug, Clone, Copy)]
pub struct UsartConfig {
    /// APB1 clock feeding the peripheral
    pub pclk_hz: u32,
    pub baud_rate: u32,
    pub enable_rx: bool,
}

impl Default for UsartConfig {
    fn default() -> Self {
        UsartConfig {
            pclk_hz: 42_000_000,
            baud_rate: 115_200,
            enable_rx: true,
        }
    }
}

struct UsartState {
    tx: Option<(NonNull<u8>, usize)>,
    tx_sent: usize,
    tx_hook: Option<(SerialCallback, *mut ())>,
    rx_hook: Option<(SerialCallback, *mut ())>,
    rx_enabled: bool,
    rx_byte: u8,
}

impl UsartState {
    const fn new() -> Self {
        UsartState {
            tx: None,
            tx_sent: 0,
            tx_hook: None,
            rx_hook: None,
            rx_enabled: false,
            rx_byte: 0,
        }
    }
}

/// USART2 driver
pub struct Stm32Usart {
    state: CsCell<UsartState>,
}

impl Stm32Usart {
    pub const fn new() -> Self {
        Stm32Usart {
            state: CsCell::new(UsartState::new()),
        }
    }

    fn set_rx_interrupt(enabled: bool) {
        pac::USART2.cr1().modify(|w| w.set_rxneie(enabled));
    }

    fn set_tx_interrupt(enabled: bool) {
        pac::USART2.cr1().modify(|w| w.set_txeie(enabled));
    }
}

impl Default for Stm32Usart {
    fn default() -> Self {
        Self::new()
    }
}

impl SerialPort for Stm32Usart {
    type Config = UsartConfig;

    fn port_type(&self) -> PortType {
        PortType::Uart
    }

    fn init(&self, config: UsartConfig) -> SerialResult<()> {
        if config.baud_rate == 0 || config.pclk_hz / config.baud_rate < 16 {
            return Err(SerialManagerStatus::Error);
        }

        pac::RCC.ahb1enr().modify(|w| w.set_gpioaen(true));
        pac::RCC.apb1enr().modify(|w| w.set_usart2en(true));
        for pin in [2, 3] {
            pac::GPIOA.moder().modify(|w| w.set_moder(pin, pac::gpio::vals::Moder::ALTERNATE));
            pac::GPIOA.afr(0).modify(|w| w.set_afr(pin, 7));
        }

        let divider = (config.pclk_hz + config.baud_rate / 2) / config.baud_rate;
        pac::USART2.brr().write_value(pac::usart::regs::Brr(divider));
        pac::USART2.cr1().write(|w| {
            w.set_ue(true);
            w.set_te(true);
            w.set_re(config.enable_rx);
            w.set_rxneie(config.enable_rx);
        });

        critical_section(|cs| {
            let state = self.state.get(cs);
            *state = UsartState::new();
            state.rx_enabled = config.enable_rx;
        });
        Ok(())
    }

    fn deinit(&self) -> SerialResult<()> {
        pac::USART2.cr1().write(|w| w.set_ue(false));
        pac::RCC.apb1enr().modify(|w| w.set_usart2en(false));
        critical_section(|cs| *self.state.get(cs) = UsartState::new());
        Ok(())
    }

    unsafe fn write(&self, buffer: NonNull<u8>, length: usize) -> SerialResult<()> {
        critical_section(|cs| {
            let state = self.state.get(cs);
            if state.tx.is_some() {
                return Err(SerialManagerStatus::Busy);
            }
            state.tx = Some((buffer, length));
            state.tx_sent = 0;
            Self::set_tx_interrupt(true);
            Ok(())
        })
    }

    unsafe fn read(&self, _buffer: Option<NonNull<u8>>, length: usize) -> SerialResult<()> {
        let enabled = critical_section(|cs| self.state.get(cs).rx_enabled);
        if !enabled {
            return Err(SerialManagerStatus::Error);
        }
        if length > 0 {
            Self::set_rx_interrupt(true);
        }
        Ok(())
    }

    fn cancel_write(&self) -> SerialResult<()> {
        let canceled = critical_section(|cs| {
            let state = self.state.get(cs);
            let (buffer, _) = state.tx.take()?;
            Self::set_tx_interrupt(false);
            Some((buffer, state.tx_sent, state.tx_hook))
        });
        if let Some((buffer, sent, Some((callback, param)))) = canceled {
            callback(param, &CallbackMessage::new(Some(buffer), sent), SerialManagerStatus::Canceled);
        }
        Ok(())
    }

    fn install_tx_callback(&self, callback: SerialCallback, param: *mut ()) -> SerialResult<()> {
        critical_section(|cs| self.state.get(cs).tx_hook = Some((callback, param)));
        Ok(())
    }

    fn install_rx_callback(&self, callback: SerialCallback, param: *mut ()) -> SerialResult<()> {
        critical_section(|cs| self.state.get(cs).rx_hook = Some((callback, param)));
        Ok(())
    }

    fn isr_function(&self) {
        let usart = pac::USART2;
        let sr = usart.sr().read();
        let cr1 = usart.cr1().read();

        if cr1.rxneie() && (sr.rxne() || sr.ore()) {
            // Reading DR after SR also clears an overrun.
            let byte = usart.dr().read().dr() as u8;
            Self::set_rx_interrupt(false);
            let hook = critical_section(|cs| {
                let state = self.state.get(cs);
                state.rx_byte = byte;
                state.rx_hook.map(|hook| (hook, NonNull::from(&state.rx_byte)))
            });
            if let Some(((callback, param), byte)) = hook {
                callback(param, &CallbackMessage::new(Some(byte), 1), SerialManagerStatus::Success);
            }
        }

        if cr1.txeie() && sr.txe() {
            let done = critical_section(|cs| {
                let state = self.state.get(cs);
                let (buffer, length) = state.tx?;
                if state.tx_sent < length {
                    // SAFETY: the manager keeps the buffer alive until completion.
                    let byte = unsafe { buffer.as_ptr().add(state.tx_sent).read() };
                    usart.dr().write(|w| w.set_dr(byte as u16));
                    state.tx_sent += 1;
                    return None;
                }
                state.tx = None;
                Self::set_tx_interrupt(false);
                Some((buffer, length, state.tx_hook))
            });
            if let Some((buffer, length, Some((callback, param)))) = done {
                callback(param, &CallbackMessage::new(Some(buffer), length), SerialManagerStatus::Success);
            }
        }
    }

    fn write_blocking(&self, data: &[u8]) -> SerialResult<()> {
        let usart = pac::USART2;
        for &byte in data {
            while !usart.sr().read().txe() {}
            usart.dr().write(|w| w.set_dr(byte as u16));
        }
        while !usart.sr().read().tc() {}
        Ok(())
    }

    fn read_blocking(&self, buffer: &mut [u8]) -> SerialResult<()> {
        let usart = pac::USART2;
        for slot in buffer.iter_mut() {
            while !usart.sr().read().rxne() {}
            *slot = usart.dr().read().dr() as u8;
        }
        Ok(())
    }
}
