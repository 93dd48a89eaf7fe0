use crate::block_device::DiskError;
use crate::clock::{Clock, Deadline};
use crate::sdmmc::proto::*;
use crate::sdmmc::Timeouts;
use crate::transport::SdBus;

#[cfg(feature = "log")]
use log::{trace, warn};

#[cfg(feature = "defmt-log")]
use defmt::{trace, warn};

/// A selected card on the bus.
///
/// Holding one of these means chip select is under the driver's control;
/// dropping it releases the card and clocks the bus once so the card
/// lets go of its data-out line. Every public driver operation funnels
/// its bus traffic through this guard, which is what guarantees the card
/// is deselected on every exit path, success or failure.
pub(crate) struct SelectedBus<'a, B, C>
where
    B: SdBus,
    C: Clock,
{
    bus: &'a mut B,
    clock: &'a mut C,
    timeouts: &'a Timeouts,
}

impl<'a, B, C> Drop for SelectedBus<'a, B, C>
where
    B: SdBus,
    C: Clock,
{
    fn drop(&mut self) {
        let _ = self.bus.chip_select(false);
        let _ = self.bus.exchange(0xFF);
    }
}

impl<'a, B, C> SelectedBus<'a, B, C>
where
    B: SdBus,
    C: Clock,
{
    /// Assert chip select and wait for the card to report ready.
    pub fn select(
        bus: &'a mut B,
        clock: &'a mut C,
        timeouts: &'a Timeouts,
    ) -> Result<Self, DiskError> {
        let mut me = SelectedBus {
            bus,
            clock,
            timeouts,
        };
        me.chip_select(true)?;
        me.receive()?;
        if !me.wait_ready(me.timeouts.ready_ms)? {
            warn!("card stayed busy, select timed out");
            return Err(DiskError::IoError);
        }
        Ok(me)
    }

    fn chip_select(&mut self, selected: bool) -> Result<(), DiskError> {
        self.bus.chip_select(selected).map_err(|_e| {
            warn!("chip select failed");
            DiskError::IoError
        })
    }

    fn exchange(&mut self, out: u8) -> Result<u8, DiskError> {
        self.bus.exchange(out).map_err(|_e| {
            warn!("SPI exchange failed");
            DiskError::IoError
        })
    }

    /// Receive a byte from the card by clocking out an `0xFF` byte.
    pub fn receive(&mut self) -> Result<u8, DiskError> {
        self.exchange(0xFF)
    }

    /// Send a byte to the card.
    pub fn send(&mut self, out: u8) -> Result<(), DiskError> {
        self.exchange(out).map(|_| ())
    }

    /// Fill `buffer` from the card.
    pub fn receive_into(&mut self, buffer: &mut [u8]) -> Result<(), DiskError> {
        self.bus.receive(buffer).map_err(|_e| {
            warn!("SPI receive failed");
            DiskError::IoError
        })
    }

    fn transmit_all(&mut self, buffer: &[u8]) -> Result<(), DiskError> {
        self.bus.transmit(buffer).map_err(|_e| {
            warn!("SPI transmit failed");
            DiskError::IoError
        })
    }

    /// Arm a timeout against the driver's clock.
    pub fn deadline(&mut self, budget_ms: u32) -> Deadline {
        Deadline::new(&mut *self.clock, budget_ms)
    }

    /// Has an armed timeout run out?
    pub fn expired(&mut self, deadline: &Deadline) -> bool {
        deadline.expired(&mut *self.clock)
    }

    /// Poll until the card releases the bus (`0xFF`), or the budget
    /// expires. `Ok(false)` on timeout.
    pub fn wait_ready(&mut self, budget_ms: u32) -> Result<bool, DiskError> {
        let deadline = self.deadline(budget_ms);
        loop {
            if self.receive()? == 0xFF {
                return Ok(true);
            }
            if self.expired(&deadline) {
                return Ok(false);
            }
        }
    }

    /// Send 80 clock pulses with chip select released, which the card
    /// needs after power-up before it will accept commands.
    pub fn release_clocks(&mut self) -> Result<(), DiskError> {
        self.chip_select(false)?;
        for _ in 0..10 {
            self.receive()?;
        }
        Ok(())
    }

    /// Release and re-assert chip select, then wait for ready.
    /// `Ok(false)` if the card stays busy.
    fn reselect(&mut self) -> Result<bool, DiskError> {
        self.chip_select(false)?;
        self.receive()?;
        self.chip_select(true)?;
        self.receive()?;
        self.wait_ready(self.timeouts.ready_ms)
    }

    /// Send a command and poll for its R1 response. Application
    /// commands are escaped with [`Command::AppCmd`] first; if the
    /// escape comes back with anything above idle, that response is
    /// returned and the prefixed command is never sent.
    pub fn command(&mut self, command: Command, arg: u32) -> Result<u8, DiskError> {
        if command.is_app() {
            let response = self.command_frame(Command::AppCmd, 0)?;
            if response > 1 {
                return Ok(response);
            }
        }
        self.command_frame(command, arg)
    }

    fn command_frame(&mut self, command: Command, arg: u32) -> Result<u8, DiskError> {
        // Re-sync the bus before each transaction. Stop-transmission is
        // the exception: it has to go out in the middle of a
        // multiple-block read, without toggling chip select.
        if command != Command::StopTransmission && !self.reselect()? {
            return Ok(0xFF);
        }

        let mut frame = [0u8; 6];
        frame[0] = 0x40 | command.index();
        frame[1..5].copy_from_slice(&arg.to_be_bytes());
        frame[5] = command.frame_crc(&frame[0..5]);
        self.transmit_all(&frame)?;

        // A stuff byte trails stop-transmission; skip it.
        if command == Command::StopTransmission {
            self.receive()?;
        }

        // Valid responses have the high bit clear.
        for _ in 0..10 {
            let response = self.receive()?;
            if response & 0x80 == 0 {
                return Ok(response);
            }
        }
        trace!("no response to CMD{}", command.index());
        Ok(0xFF)
    }

    /// Receive one data block: start token within the block budget,
    /// payload, then the two CRC bytes. CRC is not checked in SPI mode;
    /// the bytes are clocked through and discarded.
    pub fn read_data_block(&mut self, buffer: &mut [u8]) -> Result<(), DiskError> {
        let deadline = self.deadline(self.timeouts.block_ms);
        let token = loop {
            let byte = self.receive()?;
            if byte != 0xFF {
                break byte;
            }
            if self.expired(&deadline) {
                warn!("timed out waiting for a data token");
                return Err(DiskError::IoError);
            }
        };
        if token != DATA_START_BLOCK {
            warn!("bad data token: {:x}", token);
            return Err(DiskError::IoError);
        }

        self.receive_into(buffer)?;
        self.receive()?;
        self.receive()?;
        Ok(())
    }

    /// Transmit one data block behind `token`, or the payload-less stop
    /// token that ends a multiple-block write.
    pub fn write_data_block(&mut self, token: u8, buffer: &[u8]) -> Result<(), DiskError> {
        if !self.wait_ready(self.timeouts.ready_ms)? {
            warn!("card stayed busy, data block not sent");
            return Err(DiskError::IoError);
        }
        self.send(token)?;
        if token == STOP_TRAN_TOKEN {
            return Ok(());
        }

        self.transmit_all(buffer)?;
        // Dummy CRC.
        self.send(0xFF)?;
        self.send(0xFF)?;

        let response = self.receive()?;
        if response & DATA_RES_MASK != DATA_RES_ACCEPTED {
            warn!("data block rejected: {:x}", response);
            return Err(DiskError::IoError);
        }
        Ok(())
    }
}
