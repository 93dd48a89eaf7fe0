//! The SD/MMC card protocol engine.
//!
//! Implements the SPI-mode SD/MMC command protocol on a generic byte
//! transport, sufficiently to back a block-device interface: bring a
//! card up, report drive status, read and write sectors, and answer
//! capability and control queries. It is a sequential, blocking state
//! machine; every operation runs to completion on the caller's thread
//! and owns the bus for its whole duration.
//!
//! This is currently optimised for readability and debugability, not
//! performance.

mod bus;
pub mod proto;

use bus::SelectedBus;
use proto::*;

use crate::block_device::{
    Block, BlockCount, BlockDevice, BlockIdx, CardType, DiskError, DriveStatus, Ioctl,
    IoctlResponse, PowerControl,
};
use crate::clock::Clock;
use crate::transport::SdBus;

#[cfg(feature = "log")]
use log::{debug, warn};

#[cfg(feature = "defmt-log")]
use defmt::{debug, warn};

/// Bounds for the protocol's blocking waits, in milliseconds.
///
/// The defaults suit common cards; a board variant with a slow socket
/// supply or sluggish cards can stretch them without forking the driver.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Timeouts {
    /// Waiting for the card to release the bus before a command or a
    /// data block.
    pub ready_ms: u32,
    /// Waiting for the start-of-block token of a data transfer.
    pub block_ms: u32,
    /// Polling the operating-condition command during initialization.
    pub init_ms: u32,
    /// Waiting for an erase range to complete.
    pub erase_ms: u32,
}

impl Default for Timeouts {
    fn default() -> Timeouts {
        Timeouts {
            ready_ms: 500,
            block_ms: 200,
            init_ms: 1000,
            erase_ms: 30_000,
        }
    }
}

/// An SD/MMC card on an SPI bus, exposed as a block device.
///
/// Built from an [`SdBus`] transport and a [`Clock`]; the instance owns
/// both for as long as it lives and is itself owned by whoever mounts
/// the drive. The design supports exactly one physical unit: every
/// operation takes the unit index and rejects anything other than 0
/// before touching the bus.
pub struct SdMmcDisk<B, C>
where
    B: SdBus,
    C: Clock,
{
    bus: B,
    clock: C,
    timeouts: Timeouts,
    status: DriveStatus,
    card_type: CardType,
    powered: bool,
}

impl<B, C> SdMmcDisk<B, C>
where
    B: SdBus,
    C: Clock,
{
    /// Create a new driver with the default protocol timeouts.
    ///
    /// The card is untouched until [`initialize`] is called; until then
    /// the drive reports [`DriveStatus::NO_INIT`].
    ///
    /// [`initialize`]: SdMmcDisk::initialize
    pub fn new(bus: B, clock: C) -> SdMmcDisk<B, C> {
        Self::with_timeouts(bus, clock, Timeouts::default())
    }

    /// Create a new driver with board-specific protocol timeouts.
    pub fn with_timeouts(bus: B, clock: C, timeouts: Timeouts) -> SdMmcDisk<B, C> {
        SdMmcDisk {
            bus,
            clock,
            timeouts,
            status: DriveStatus::NO_INIT,
            card_type: CardType::Unknown,
            powered: false,
        }
    }

    /// The card type resolved by the last successful [`initialize`].
    ///
    /// [`initialize`]: SdMmcDisk::initialize
    pub fn card_type(&self) -> CardType {
        self.card_type
    }

    /// Consume the driver and give back the transport and clock.
    pub fn free(self) -> (B, C) {
        (self.bus, self.clock)
    }

    /// Sample the card-detect and write-protect inputs and fold them
    /// into the drive status. Call periodically (the reference design
    /// clocks this at 1 ms alongside [`TickClock::tick`]); must not be
    /// reentered from the other driver operations.
    ///
    /// [`TickClock::tick`]: crate::TickClock::tick
    pub fn tick(&mut self) {
        let present = self.bus.card_present();
        let protected = self.bus.write_protected();
        self.status.set(DriveStatus::PROTECT, protected);
        if present {
            self.status.remove(DriveStatus::NO_DISK);
        } else {
            // Pulling the card invalidates everything we negotiated.
            self.status
                .insert(DriveStatus::NO_DISK | DriveStatus::NO_INIT);
        }
    }

    /// Bring the card into a known, transfer-ready state.
    ///
    /// On success the returned status no longer contains
    /// [`DriveStatus::NO_INIT`] and the transport has been switched to
    /// the fast clock. On any failure the card type is back to
    /// [`CardType::Unknown`], `NO_INIT` stays set, and every subsequent
    /// transfer fails fast with [`DiskError::NotReady`] until a retry
    /// succeeds. The card is deselected either way.
    pub fn initialize(&mut self, unit: u8) -> DriveStatus {
        if unit != 0 {
            return DriveStatus::NO_INIT;
        }
        if self.status.contains(DriveStatus::NO_DISK) {
            return self.status;
        }

        match self.try_acquire() {
            Ok(card_type) => {
                debug!("card initialized: {:?}", card_type);
                self.card_type = card_type;
                self.status.remove(DriveStatus::NO_INIT);
            }
            Err(_) => {
                warn!("card initialization failed");
                self.card_type = CardType::Unknown;
                self.status.insert(DriveStatus::NO_INIT);
            }
        }
        self.status
    }

    /// The current drive status. Never touches the bus; the socket
    /// inputs are folded in by [`tick`].
    ///
    /// [`tick`]: SdMmcDisk::tick
    pub fn status(&self, unit: u8) -> DriveStatus {
        if unit != 0 {
            DriveStatus::NO_INIT
        } else {
            self.status
        }
    }

    /// Read `blocks.len()` sectors starting at `start`.
    pub fn read(&mut self, unit: u8, blocks: &mut [Block], start: BlockIdx) -> Result<(), DiskError> {
        if unit != 0 || blocks.is_empty() {
            return Err(DiskError::ParamError);
        }
        if self.status.contains(DriveStatus::NO_INIT) {
            return Err(DiskError::NotReady);
        }

        let address = self.address(start);
        let mut bus = SelectedBus::select(&mut self.bus, &mut self.clock, &self.timeouts)?;
        if blocks.len() == 1 {
            if bus.command(Command::ReadSingleBlock, address)? != R1_READY_STATE {
                return Err(DiskError::IoError);
            }
            bus.read_data_block(&mut blocks[0].contents)?;
        } else {
            if bus.command(Command::ReadMultipleBlock, address)? != R1_READY_STATE {
                return Err(DiskError::IoError);
            }
            for block in blocks.iter_mut() {
                bus.read_data_block(&mut block.contents)?;
            }
            bus.command(Command::StopTransmission, 0)?;
        }
        Ok(())
    }

    /// Write `blocks.len()` sectors starting at `start`.
    pub fn write(&mut self, unit: u8, blocks: &[Block], start: BlockIdx) -> Result<(), DiskError> {
        if unit != 0 || blocks.is_empty() {
            return Err(DiskError::ParamError);
        }
        if self.status.contains(DriveStatus::NO_INIT) {
            return Err(DiskError::NotReady);
        }
        if self.status.contains(DriveStatus::PROTECT) {
            return Err(DiskError::WriteProtected);
        }

        let address = self.address(start);
        let mut bus = SelectedBus::select(&mut self.bus, &mut self.clock, &self.timeouts)?;
        if blocks.len() == 1 {
            if bus.command(Command::WriteBlock, address)? != R1_READY_STATE {
                return Err(DiskError::IoError);
            }
            bus.write_data_block(DATA_START_BLOCK, &blocks[0].contents)?;
        } else {
            if bus.command(Command::WriteMultipleBlock, address)? != R1_READY_STATE {
                return Err(DiskError::IoError);
            }
            for (idx, block) in blocks.iter().enumerate() {
                let token = if idx == 0 {
                    DATA_START_BLOCK
                } else {
                    WRITE_MULTIPLE_TOKEN
                };
                bus.write_data_block(token, &block.contents)?;
            }
            bus.write_data_block(STOP_TRAN_TOKEN, &[])?;
        }
        Ok(())
    }

    /// Control and capability queries.
    ///
    /// Power control runs even while the drive reports `NO_INIT`; every
    /// other request requires a successfully initialized card.
    pub fn ioctl(&mut self, unit: u8, op: Ioctl) -> Result<IoctlResponse, DiskError> {
        if unit != 0 {
            return Err(DiskError::ParamError);
        }
        match op {
            Ioctl::Power(request) => self.power_control(request),
            _ if self.status.contains(DriveStatus::NO_INIT) => Err(DiskError::NotReady),
            Ioctl::Sync => {
                // Selecting waits out any in-flight write activity.
                SelectedBus::select(&mut self.bus, &mut self.clock, &self.timeouts)?;
                Ok(IoctlResponse::None)
            }
            Ioctl::SectorCount => {
                let csd = self.read_csd()?;
                Ok(IoctlResponse::SectorCount(BlockCount(
                    csd.card_capacity_blocks(),
                )))
            }
            Ioctl::EraseBlockSize => self.erase_block_size(),
            Ioctl::Trim { start, end } => self.trim(start, end),
            Ioctl::CardType => Ok(IoctlResponse::CardType(self.card_type)),
            Ioctl::Csd => self
                .read_register(Command::SendCsd)
                .map(IoctlResponse::Csd),
            Ioctl::Cid => self
                .read_register(Command::SendCid)
                .map(IoctlResponse::Cid),
            Ioctl::Ocr => {
                let mut bus = SelectedBus::select(&mut self.bus, &mut self.clock, &self.timeouts)?;
                if bus.command(Command::ReadOcr, 0)? != R1_READY_STATE {
                    warn!("OCR read rejected");
                    return Err(DiskError::IoError);
                }
                let mut data = [0u8; 4];
                bus.receive_into(&mut data)?;
                Ok(IoctlResponse::Ocr(data))
            }
            Ioctl::SdStatus => self
                .read_sd_status()
                .map(|status| IoctlResponse::SdStatus(status.data)),
        }
    }

    /// The protocol address of a sector: legacy cards take byte
    /// offsets, high capacity cards take the sector number directly.
    fn address(&self, sector: BlockIdx) -> u32 {
        if self.card_type.block_addressed() {
            sector.0
        } else {
            sector.0 * Block::LEN as u32
        }
    }

    fn power_on(&mut self) -> Result<(), DiskError> {
        Self::io(self.bus.select_slow())?;
        // Chip select exercise plus a burst of clocks lets the card
        // leave its reset state.
        Self::io(self.bus.chip_select(true))?;
        Self::io(self.bus.chip_select(false))?;
        for _ in 0..10 {
            Self::io(self.bus.exchange(0xFF))?;
        }
        self.powered = true;
        Ok(())
    }

    fn power_off(&mut self) {
        let _ = self.bus.chip_select(false);
        self.powered = false;
    }

    fn power_control(&mut self, request: PowerControl) -> Result<IoctlResponse, DiskError> {
        match request {
            PowerControl::Off => {
                self.power_off();
                Ok(IoctlResponse::None)
            }
            PowerControl::On => {
                self.power_on()?;
                Ok(IoctlResponse::None)
            }
            PowerControl::Query => Ok(IoctlResponse::Power(self.powered)),
        }
    }

    /// Run the card identification and initialization sequence and
    /// resolve the card type. The transport is switched back to the
    /// slow clock for the whole exchange, and to the fast clock only
    /// once the card has accepted the sequence.
    fn try_acquire(&mut self) -> Result<CardType, DiskError> {
        self.power_on()?;

        let card_type = {
            let mut bus = SelectedBus::select(&mut self.bus, &mut self.clock, &self.timeouts)?;
            bus.release_clocks()?;

            if bus.command(Command::GoIdleState, 0)? != R1_IDLE_STATE {
                debug!("card did not enter the idle state");
                return Err(DiskError::IoError);
            }

            let deadline = bus.deadline(self.timeouts.init_ms);
            if bus.command(Command::SendIfCond, 0x1AA)? == R1_IDLE_STATE {
                // SD v2: the card echoes the check pattern in the R7
                // tail when it can run on our voltage range.
                let mut r7 = [0u8; 4];
                bus.receive_into(&mut r7)?;
                if r7[2] != 0x01 || r7[3] != 0xAA {
                    debug!("interface condition echo mismatch");
                    return Err(DiskError::IoError);
                }

                // Announce high-capacity support and poll until the
                // card leaves the idle state.
                loop {
                    if bus.command(Command::AppSendOpCond, 0x4000_0000)? == R1_READY_STATE {
                        break;
                    }
                    if bus.expired(&deadline) {
                        debug!("operating-condition polling timed out");
                        return Err(DiskError::IoError);
                    }
                }

                // The OCR tells us whether the card is block addressed.
                if bus.command(Command::ReadOcr, 0)? != R1_READY_STATE {
                    debug!("OCR read rejected");
                    return Err(DiskError::IoError);
                }
                let mut ocr = Ocr::default();
                bus.receive_into(&mut ocr.data)?;
                CardType::Sd2 {
                    high_capacity: ocr.high_capacity(),
                }
            } else {
                // SD v1 or MMC v3, told apart by which of the two
                // operating-condition commands the card accepts.
                let (card_type, op_cond) =
                    if bus.command(Command::AppSendOpCond, 0)? <= R1_IDLE_STATE {
                        (CardType::Sd1, Command::AppSendOpCond)
                    } else {
                        (CardType::Mmc3, Command::SendOpCond)
                    };
                loop {
                    if bus.command(op_cond, 0)? == R1_READY_STATE {
                        break;
                    }
                    if bus.expired(&deadline) {
                        debug!("operating-condition polling timed out");
                        return Err(DiskError::IoError);
                    }
                }

                // Legacy cards are byte addressed; pin the block length.
                if bus.command(Command::SetBlocklen, Block::LEN as u32)? != R1_READY_STATE {
                    debug!("could not set the block length");
                    return Err(DiskError::IoError);
                }
                card_type
            }
        };

        Self::io(self.bus.select_fast())?;
        Ok(card_type)
    }

    fn read_register(&mut self, command: Command) -> Result<[u8; 16], DiskError> {
        let mut bus = SelectedBus::select(&mut self.bus, &mut self.clock, &self.timeouts)?;
        if bus.command(command, 0)? != R1_READY_STATE {
            warn!("register read rejected");
            return Err(DiskError::IoError);
        }
        let mut data = [0u8; 16];
        bus.read_data_block(&mut data)?;
        Ok(data)
    }

    fn read_csd(&mut self) -> Result<Csd, DiskError> {
        self.read_register(Command::SendCsd).map(Csd::parse)
    }

    fn read_sd_status(&mut self) -> Result<SdStatusBlock, DiskError> {
        let mut bus = SelectedBus::select(&mut self.bus, &mut self.clock, &self.timeouts)?;
        if bus.command(Command::SdStatus, 0)? != R1_READY_STATE {
            warn!("SD status read rejected");
            return Err(DiskError::IoError);
        }
        // ACMD13 answers with R2; consume the second status byte.
        bus.receive()?;
        let mut status = SdStatusBlock::default();
        bus.read_data_block(&mut status.data)?;
        Ok(status)
    }

    /// The erase granularity of the card, in sectors: the allocation
    /// unit from the SD status for SD v2, CSD geometry otherwise.
    fn erase_block_size(&mut self) -> Result<IoctlResponse, DiskError> {
        let blocks = match self.card_type {
            CardType::Sd2 { .. } => self.read_sd_status()?.allocation_unit_blocks(),
            CardType::Sd1 => match self.read_csd()? {
                Csd::V1(csd) => csd.erase_sector_blocks(),
                Csd::V2(_) => return Err(DiskError::IoError),
            },
            CardType::Mmc3 => match self.read_csd()? {
                Csd::V1(csd) => csd.erase_group_blocks(),
                Csd::V2(_) => return Err(DiskError::IoError),
            },
            CardType::Unknown => return Err(DiskError::NotReady),
        };
        Ok(IoctlResponse::EraseBlockSize(BlockCount(blocks)))
    }

    fn trim(&mut self, start: BlockIdx, end: BlockIdx) -> Result<IoctlResponse, DiskError> {
        // Only SD cards that advertise erase capability take the
        // erase command group.
        if !self.card_type.is_sd() {
            return Err(DiskError::IoError);
        }
        if !self.read_csd()?.erase_single_block_enabled() {
            return Err(DiskError::IoError);
        }

        let (start, end) = (self.address(start), self.address(end));
        let erase_ms = self.timeouts.erase_ms;
        let mut bus = SelectedBus::select(&mut self.bus, &mut self.clock, &self.timeouts)?;
        if bus.command(Command::EraseStart, start)? != R1_READY_STATE
            || bus.command(Command::EraseEnd, end)? != R1_READY_STATE
            || bus.command(Command::Erase, 0)? != R1_READY_STATE
        {
            warn!("trim rejected");
            return Err(DiskError::IoError);
        }
        if !bus.wait_ready(erase_ms)? {
            warn!("trim did not complete in time");
            return Err(DiskError::IoError);
        }
        Ok(IoctlResponse::None)
    }

    fn io<T>(result: Result<T, B::Error>) -> Result<T, DiskError> {
        result.map_err(|_e| {
            warn!("transport failure");
            DiskError::IoError
        })
    }
}

impl<B, C> BlockDevice for SdMmcDisk<B, C>
where
    B: SdBus,
    C: Clock,
{
    fn initialize(&mut self, unit: u8) -> DriveStatus {
        SdMmcDisk::initialize(self, unit)
    }

    fn status(&self, unit: u8) -> DriveStatus {
        SdMmcDisk::status(self, unit)
    }

    fn read(&mut self, unit: u8, blocks: &mut [Block], start: BlockIdx) -> Result<(), DiskError> {
        SdMmcDisk::read(self, unit, blocks, start)
    }

    fn write(&mut self, unit: u8, blocks: &[Block], start: BlockIdx) -> Result<(), DiskError> {
        SdMmcDisk::write(self, unit, blocks, start)
    }

    fn ioctl(&mut self, unit: u8, op: Ioctl) -> Result<IoctlResponse, DiskError> {
        SdMmcDisk::ioctl(self, unit, op)
    }
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
