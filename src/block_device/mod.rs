//! Block Device support
//!
//! The types in this module form the contract between the card driver
//! below and the filesystem layer above: a drive reports its health as a
//! [`DriveStatus`] bitset and moves data in whole 512-byte [`Block`]s.

use core::ops::{Deref, DerefMut};

/// A single 512-byte sector.
#[derive(Clone, PartialEq, Eq)]
pub struct Block {
    /// The 512 bytes in this sector.
    pub contents: [u8; Block::LEN],
}

impl Block {
    /// Number of bytes in a block.
    pub const LEN: usize = 512;

    /// Create a new block full of zeros.
    pub fn new() -> Block {
        Block {
            contents: [0u8; Block::LEN],
        }
    }
}

impl Default for Block {
    fn default() -> Block {
        Block::new()
    }
}

impl Deref for Block {
    type Target = [u8; Block::LEN];
    fn deref(&self) -> &Self::Target {
        &self.contents
    }
}

impl DerefMut for Block {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.contents
    }
}

impl core::fmt::Debug for Block {
    fn fmt(&self, fmt: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(fmt, "Block [")?;
        for b in self.contents.iter().take(8) {
            write!(fmt, " {:02x}", b)?;
        }
        write!(fmt, " .. ]")
    }
}

/// Zero-indexed sector number on a drive.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct BlockIdx(pub u32);

/// A number of sectors.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct BlockCount(pub u32);

bitflags::bitflags! {
    /// The health of a drive, as the filesystem layer sees it.
    #[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
    pub struct DriveStatus: u8 {
        /// The drive has not completed a successful initialization.
        const NO_INIT = 0x01;
        /// The card-detect input reports an empty socket.
        const NO_DISK = 0x02;
        /// The write-protect input is asserted.
        const PROTECT = 0x04;
    }
}

/// Result codes a drive operation can fail with.
///
/// Every bus-level failure (rejected command, response timeout, bad data
/// token, rejected data block) is reported as the single [`IoError`]
/// code; the drive does not retry on the caller's behalf.
///
/// [`IoError`]: DiskError::IoError
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DiskError {
    /// The caller broke the contract: bad unit number or zero-length
    /// transfer. Detected before any bus activity.
    ParamError,
    /// The drive has not been initialized, or the socket is empty.
    NotReady,
    /// A write was attempted while the write-protect input is asserted.
    WriteProtected,
    /// The card rejected a command or a transfer failed on the bus.
    IoError,
}

/// The kind of card a drive resolved during initialization.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CardType {
    /// No card, or initialization has not succeeded yet.
    Unknown,
    /// MMC version 3.
    Mmc3,
    /// SD version 1.
    Sd1,
    /// SD version 2.
    Sd2 {
        /// High capacity cards are addressed by sector number rather
        /// than byte offset.
        high_capacity: bool,
    },
}

impl CardType {
    /// The compact one-byte encoding reported by [`Ioctl::CardType`].
    pub fn bits(self) -> u8 {
        match self {
            CardType::Unknown => 0x00,
            CardType::Mmc3 => 0x01,
            CardType::Sd1 => 0x02,
            CardType::Sd2 {
                high_capacity: false,
            } => 0x04,
            CardType::Sd2 {
                high_capacity: true,
            } => 0x04 | 0x08,
        }
    }

    /// Do read/write/erase commands take a sector number (rather than a
    /// byte offset)?
    pub fn block_addressed(self) -> bool {
        match self {
            CardType::Sd2 { high_capacity } => high_capacity,
            _ => false,
        }
    }

    /// Is this an SD card (as opposed to an MMC)?
    pub fn is_sd(self) -> bool {
        match self {
            CardType::Sd1 | CardType::Sd2 { .. } => true,
            _ => false,
        }
    }
}

/// Power control requests understood by [`Ioctl::Power`].
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PowerControl {
    /// Turn the card socket power off.
    Off,
    /// Turn the card socket power on.
    On,
    /// Report the current power state.
    Query,
}

/// Miscellaneous control and capability queries.
///
/// Each request that produces data answers with the matching
/// [`IoctlResponse`] variant.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Ioctl {
    /// Wait until the drive has finished any pending write activity.
    Sync,
    /// How many 512-byte sectors does the drive hold?
    SectorCount,
    /// The erase block granularity, in sectors.
    EraseBlockSize,
    /// Mark an inclusive sector range as no longer in use.
    Trim {
        /// First sector of the range.
        start: BlockIdx,
        /// Last sector of the range.
        end: BlockIdx,
    },
    /// The resolved [`CardType`].
    CardType,
    /// The raw 16-byte Card Specific Data register.
    Csd,
    /// The raw 16-byte Card Identification register.
    Cid,
    /// The raw 4-byte Operation Conditions Register.
    Ocr,
    /// The raw 64-byte SD status block.
    SdStatus,
    /// Socket power control. Runs even while the drive reports
    /// [`DriveStatus::NO_INIT`].
    Power(PowerControl),
}

/// The payload an [`Ioctl`] request answers with.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IoctlResponse {
    /// The request has no payload (sync, trim, power on/off).
    None,
    /// Drive capacity in sectors.
    SectorCount(BlockCount),
    /// Erase block granularity in sectors.
    EraseBlockSize(BlockCount),
    /// The resolved card type.
    CardType(CardType),
    /// Card Specific Data register contents.
    Csd([u8; 16]),
    /// Card Identification register contents.
    Cid([u8; 16]),
    /// Operation Conditions Register contents.
    Ocr([u8; 4]),
    /// SD status block contents.
    SdStatus([u8; 64]),
    /// Current power state.
    Power(bool),
}

/// Represents a block device - a device which can read and write sectors
/// and answer control queries. Only supports devices which are <= 2 TiB
/// in size, and designs with exactly one physical unit (unit index 0).
pub trait BlockDevice {
    /// Bring unit `unit` into a usable state. On success the returned
    /// status no longer contains [`DriveStatus::NO_INIT`].
    fn initialize(&mut self, unit: u8) -> DriveStatus;

    /// The current status of unit `unit`. Any unit other than 0 reports
    /// [`DriveStatus::NO_INIT`].
    fn status(&self, unit: u8) -> DriveStatus;

    /// Read `blocks.len()` sectors starting at `start`.
    fn read(&mut self, unit: u8, blocks: &mut [Block], start: BlockIdx) -> Result<(), DiskError>;

    /// Write `blocks.len()` sectors starting at `start`.
    fn write(&mut self, unit: u8, blocks: &[Block], start: BlockIdx) -> Result<(), DiskError>;

    /// Control and capability queries.
    fn ioctl(&mut self, unit: u8, op: Ioctl) -> Result<IoctlResponse, DiskError>;
}

/// A [`BlockDevice`] backed by a slice of RAM.
///
/// Useful to the filesystem layer's own tests; it never fails and is
/// always initialized.
#[derive(Debug)]
pub struct MemoryBlockDevice<'a> {
    memory: &'a mut [u8],
}

impl<'a> MemoryBlockDevice<'a> {
    /// Wrap a byte slice. The slice length should be a multiple of
    /// [`Block::LEN`]; any tail short of a full sector is ignored.
    pub fn new(memory: &'a mut [u8]) -> Self {
        Self { memory }
    }

    fn sector_count(&self) -> u32 {
        (self.memory.len() / Block::LEN) as u32
    }

    fn range(&self, idx: u32) -> Option<core::ops::Range<usize>> {
        if idx < self.sector_count() {
            let start = idx as usize * Block::LEN;
            Some(start..start + Block::LEN)
        } else {
            None
        }
    }
}

impl<'a> BlockDevice for MemoryBlockDevice<'a> {
    fn initialize(&mut self, unit: u8) -> DriveStatus {
        if unit != 0 {
            DriveStatus::NO_INIT
        } else {
            DriveStatus::empty()
        }
    }

    fn status(&self, unit: u8) -> DriveStatus {
        if unit != 0 {
            DriveStatus::NO_INIT
        } else {
            DriveStatus::empty()
        }
    }

    fn read(&mut self, unit: u8, blocks: &mut [Block], start: BlockIdx) -> Result<(), DiskError> {
        if unit != 0 || blocks.is_empty() {
            return Err(DiskError::ParamError);
        }
        for (idx, block) in blocks.iter_mut().enumerate() {
            let range = self
                .range(start.0 + idx as u32)
                .ok_or(DiskError::ParamError)?;
            block.contents.copy_from_slice(&self.memory[range]);
        }
        Ok(())
    }

    fn write(&mut self, unit: u8, blocks: &[Block], start: BlockIdx) -> Result<(), DiskError> {
        if unit != 0 || blocks.is_empty() {
            return Err(DiskError::ParamError);
        }
        for (idx, block) in blocks.iter().enumerate() {
            let range = self
                .range(start.0 + idx as u32)
                .ok_or(DiskError::ParamError)?;
            self.memory[range].copy_from_slice(&block.contents);
        }
        Ok(())
    }

    fn ioctl(&mut self, unit: u8, op: Ioctl) -> Result<IoctlResponse, DiskError> {
        if unit != 0 {
            return Err(DiskError::ParamError);
        }
        match op {
            Ioctl::Sync => Ok(IoctlResponse::None),
            Ioctl::SectorCount => Ok(IoctlResponse::SectorCount(BlockCount(self.sector_count()))),
            Ioctl::EraseBlockSize => Ok(IoctlResponse::EraseBlockSize(BlockCount(1))),
            Ioctl::CardType => Ok(IoctlResponse::CardType(CardType::Unknown)),
            Ioctl::Power(PowerControl::Query) => Ok(IoctlResponse::Power(true)),
            Ioctl::Power(_) => Ok(IoctlResponse::None),
            _ => Err(DiskError::ParamError),
        }
    }
}
