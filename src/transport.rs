//! The byte-level bus under the card driver.
//!
//! The protocol engine only ever talks to an [`SdBus`]: a blocking,
//! byte-oriented SPI transport with a separately driven chip select and
//! a two-speed clock. [`SpiTransport`] adapts any `embedded-hal` SPI
//! peripheral plus chip-select pin to the trait.

use embedded_hal::blocking::spi::Transfer;
use embedded_hal::digital::v2::OutputPin;

/// A blocking SPI-mode transport with chip select and clock control.
///
/// Implementations also expose the socket's card-detect and
/// write-protect inputs; the defaults suit sockets without switches.
pub trait SdBus {
    /// The transport's own error type. The driver reports every
    /// transport failure as an I/O error; this type only feeds the log.
    type Error: core::fmt::Debug;

    /// Clock one byte out while clocking one byte in.
    fn exchange(&mut self, out: u8) -> Result<u8, Self::Error>;

    /// Clock `buffer.len()` bytes out of the card (transmitting `0xFF`).
    fn receive(&mut self, buffer: &mut [u8]) -> Result<(), Self::Error> {
        for b in buffer.iter_mut() {
            *b = self.exchange(0xFF)?;
        }
        Ok(())
    }

    /// Clock the bytes of `buffer` into the card, discarding responses.
    fn transmit(&mut self, buffer: &[u8]) -> Result<(), Self::Error> {
        for &b in buffer.iter() {
            self.exchange(b)?;
        }
        Ok(())
    }

    /// Switch to the slow (initialization) clock rate.
    fn select_slow(&mut self) -> Result<(), Self::Error>;

    /// Switch to the fast (data transfer) clock rate.
    fn select_fast(&mut self) -> Result<(), Self::Error>;

    /// Assert (`true`) or release (`false`) the card's chip select.
    fn chip_select(&mut self, selected: bool) -> Result<(), Self::Error>;

    /// Sample the card-detect input.
    fn card_present(&mut self) -> bool {
        true
    }

    /// Sample the write-protect input.
    fn write_protected(&mut self) -> bool {
        false
    }
}

/// The errors [`SpiTransport`] can generate.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BusError {
    /// We got an error from the SPI peripheral.
    Transport,
    /// Couldn't set the chip select pin.
    Gpio,
}

/// An [`SdBus`] over an `embedded-hal` SPI peripheral and a chip-select
/// output pin.
///
/// The chip select must be separate so the driver can clock bytes out
/// with the card deselected (which is what puts the card into SPI mode).
/// `embedded-hal` 0.2 has no portable way to change the SPI clock rate,
/// so [`select_slow`]/[`select_fast`] are no-ops here; construct the
/// peripheral at the slow rate and re-clock it through [`spi`] once
/// initialization has succeeded.
///
/// [`select_slow`]: SdBus::select_slow
/// [`select_fast`]: SdBus::select_fast
/// [`spi`]: SpiTransport::spi
pub struct SpiTransport<SPI, CS>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
{
    spi: SPI,
    cs: CS,
}

impl<SPI, CS> SpiTransport<SPI, CS>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
{
    /// Wrap an SPI peripheral and chip-select pin.
    pub fn new(spi: SPI, cs: CS) -> SpiTransport<SPI, CS> {
        SpiTransport { spi, cs }
    }

    /// Get a temporary borrow on the underlying SPI device. Useful if
    /// you need to re-clock it.
    pub fn spi<T, F>(&mut self, func: F) -> T
    where
        F: FnOnce(&mut SPI) -> T,
    {
        func(&mut self.spi)
    }

    /// Consume the transport and give back its parts.
    pub fn free(self) -> (SPI, CS) {
        (self.spi, self.cs)
    }
}

impl<SPI, CS> SdBus for SpiTransport<SPI, CS>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
{
    type Error = BusError;

    fn exchange(&mut self, out: u8) -> Result<u8, BusError> {
        self.spi
            .transfer(&mut [out])
            .map(|b| b[0])
            .map_err(|_e| BusError::Transport)
    }

    fn receive(&mut self, buffer: &mut [u8]) -> Result<(), BusError> {
        for b in buffer.iter_mut() {
            *b = 0xFF;
        }
        self.spi
            .transfer(buffer)
            .map(|_| ())
            .map_err(|_e| BusError::Transport)
    }

    fn select_slow(&mut self) -> Result<(), BusError> {
        Ok(())
    }

    fn select_fast(&mut self) -> Result<(), BusError> {
        Ok(())
    }

    fn chip_select(&mut self, selected: bool) -> Result<(), BusError> {
        let result = if selected {
            self.cs.set_low()
        } else {
            self.cs.set_high()
        };
        result.map_err(|_e| BusError::Gpio)
    }
}
