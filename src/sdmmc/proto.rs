//! Protocol vocabulary from the SD Specifications: the SPI-mode command
//! set, response and token values, and the register layouts the driver
//! decodes.
//!
//! Register views are plain wrappers over the raw bytes with one
//! accessor per documented bit range; nothing here touches the bus.

/// Status for card in the ready state.
pub(crate) const R1_READY_STATE: u8 = 0x00;

/// Status for card in the idle state.
pub(crate) const R1_IDLE_STATE: u8 = 0x01;

/// Start data token for read or write single block.
pub(crate) const DATA_START_BLOCK: u8 = 0xFE;

/// Stop token for write multiple blocks.
pub(crate) const STOP_TRAN_TOKEN: u8 = 0xFD;

/// Start data token for the second and later blocks of a multiple-block
/// write.
pub(crate) const WRITE_MULTIPLE_TOKEN: u8 = 0xFC;

/// Mask for data response tokens after a write block operation.
pub(crate) const DATA_RES_MASK: u8 = 0x1F;

/// Write data accepted token.
pub(crate) const DATA_RES_ACCEPTED: u8 = 0x05;

/// CRC byte sent once CRC checking is off. Only the stop bit matters.
pub(crate) const PLACEHOLDER_CRC: u8 = 0x01;

/// The commands the driver issues, by name rather than index.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Command {
    /// CMD0: put the card into the idle state (SPI mode if CS is low).
    GoIdleState,
    /// CMD1: start the initialization process (MMC).
    SendOpCond,
    /// CMD8: verify the interface operating condition.
    SendIfCond,
    /// CMD9: read the Card Specific Data register.
    SendCsd,
    /// CMD10: read the Card Identification register.
    SendCid,
    /// CMD12: end a multiple block read sequence.
    StopTransmission,
    /// CMD16: set the block length for non-block-addressed cards.
    SetBlocklen,
    /// CMD17: read a single data block.
    ReadSingleBlock,
    /// CMD18: read data blocks until a StopTransmission.
    ReadMultipleBlock,
    /// CMD24: write a single data block.
    WriteBlock,
    /// CMD25: write data blocks until a stop token.
    WriteMultipleBlock,
    /// CMD32: set the first sector of an erase range.
    EraseStart,
    /// CMD33: set the last sector of an erase range.
    EraseEnd,
    /// CMD38: erase the selected range.
    Erase,
    /// CMD55: escape for application specific commands.
    AppCmd,
    /// CMD58: read the Operation Conditions Register.
    ReadOcr,
    /// ACMD13: read the 64-byte SD status block.
    SdStatus,
    /// ACMD41: start the initialization process (SD).
    AppSendOpCond,
}

impl Command {
    /// The command index transmitted on the wire.
    pub(crate) fn index(self) -> u8 {
        match self {
            Command::GoIdleState => 0,
            Command::SendOpCond => 1,
            Command::SendIfCond => 8,
            Command::SendCsd => 9,
            Command::SendCid => 10,
            Command::StopTransmission => 12,
            Command::SetBlocklen => 16,
            Command::ReadSingleBlock => 17,
            Command::ReadMultipleBlock => 18,
            Command::WriteBlock => 24,
            Command::WriteMultipleBlock => 25,
            Command::EraseStart => 32,
            Command::EraseEnd => 33,
            Command::Erase => 38,
            Command::AppCmd => 55,
            Command::ReadOcr => 58,
            Command::SdStatus => 13,
            Command::AppSendOpCond => 41,
        }
    }

    /// Application specific commands must be escaped with [`AppCmd`].
    ///
    /// [`AppCmd`]: Command::AppCmd
    pub(crate) fn is_app(self) -> bool {
        match self {
            Command::SdStatus | Command::AppSendOpCond => true,
            _ => false,
        }
    }

    /// The CRC byte for a frame carrying this command.
    ///
    /// Only the two commands issued while the card still enforces CRC
    /// (go-idle and the interface condition probe) need the real CRC7;
    /// everything after runs with CRC checking off and gets the
    /// placeholder.
    pub(crate) fn frame_crc(self, frame: &[u8]) -> u8 {
        match self {
            Command::GoIdleState | Command::SendIfCond => crc7(frame),
            _ => PLACEHOLDER_CRC,
        }
    }
}

/// Perform the 7-bit CRC used on the SD card command frames.
pub fn crc7(data: &[u8]) -> u8 {
    let mut crc = 0u8;
    for mut d in data.iter().cloned() {
        for _bit in 0..8 {
            crc <<= 1;
            if ((d & 0x80) ^ (crc & 0x80)) != 0 {
                crc ^= 0x09;
            }
            d <<= 1;
        }
    }
    (crc << 1) | 1
}

/// The Operation Conditions Register.
#[derive(Debug, Default, Clone)]
pub struct Ocr {
    /// The 4 bytes of the register, most significant first.
    pub data: [u8; 4],
}

impl Ocr {
    define_field!(power_up_complete, bool, 0, 7);
    define_field!(high_capacity, bool, 0, 6);
}

/// Card Specific Data, version 1 layout (SD v1 and MMC).
#[derive(Debug, Default, Clone)]
pub struct CsdV1 {
    /// The 16 bytes of data in this Card Specific Data block.
    pub data: [u8; 16],
}

/// Card Specific Data, version 2 layout (SD v2).
#[derive(Debug, Default, Clone)]
pub struct CsdV2 {
    /// The 16 bytes of data in this Card Specific Data block.
    pub data: [u8; 16],
}

/// Card Specific Data, dispatched on the structure version in the first
/// byte.
#[derive(Debug, Clone)]
pub enum Csd {
    /// A version 1 CSD.
    V1(CsdV1),
    /// A version 2 CSD.
    V2(CsdV2),
}

impl Csd {
    /// Wrap a register dump in the view matching its structure version.
    pub fn parse(data: [u8; 16]) -> Csd {
        if data[0] >> 6 == 1 {
            Csd::V2(CsdV2 { data })
        } else {
            Csd::V1(CsdV1 { data })
        }
    }

    /// The card capacity in 512-byte sectors.
    pub fn card_capacity_blocks(&self) -> u32 {
        match self {
            Csd::V1(csd) => csd.card_capacity_blocks(),
            Csd::V2(csd) => csd.card_capacity_blocks(),
        }
    }

    /// Does the card accept erase ranges at single-sector granularity?
    pub fn erase_single_block_enabled(&self) -> bool {
        match self {
            // Always true for the version 2 layout.
            Csd::V2(_) => true,
            Csd::V1(csd) => csd.erase_single_block_enabled(),
        }
    }
}

impl CsdV1 {
    define_field!(csd_ver, u8, 0, 6, 2);
    define_field!(read_block_length, u8, 5, 0, 4);
    define_field!(device_size, u32, [(6, 0, 2), (7, 0, 8), (8, 6, 2)]);
    define_field!(device_size_multiplier, u8, [(9, 0, 2), (10, 7, 1)]);
    define_field!(erase_single_block_enabled, bool, 10, 6);
    define_field!(erase_sector_size, u8, [(10, 0, 6), (11, 7, 1)]);
    define_field!(erase_group_size, u8, 10, 2, 5);
    define_field!(erase_group_multiplier, u8, [(11, 0, 2), (11, 5, 3)]);
    define_field!(max_write_data_length, u8, [(12, 0, 2), (13, 6, 2)]);

    /// Returns the card capacity in bytes.
    pub fn card_capacity_bytes(&self) -> u64 {
        let multiplier = self.device_size_multiplier() + self.read_block_length() + 2;
        (u64::from(self.device_size()) + 1) << multiplier
    }

    /// Returns the card capacity in 512-byte sectors.
    pub fn card_capacity_blocks(&self) -> u32 {
        let multiplier = self.device_size_multiplier() + self.read_block_length() - 7;
        (self.device_size() + 1) << multiplier
    }

    /// The erase sector size of an SD v1 card, in 512-byte sectors.
    pub fn erase_sector_blocks(&self) -> u32 {
        let shift = (self.max_write_data_length() & 3).saturating_sub(1);
        (u32::from(self.erase_sector_size()) + 1) << shift
    }

    /// The erase group size of an MMC, in 512-byte sectors.
    pub fn erase_group_blocks(&self) -> u32 {
        (u32::from(self.erase_group_size()) + 1)
            * (u32::from(self.erase_group_multiplier()) + 1)
    }
}

impl CsdV2 {
    define_field!(csd_ver, u8, 0, 6, 2);
    define_field!(read_block_length, u8, 5, 0, 4);
    define_field!(device_size, u32, [(7, 0, 6), (8, 0, 8), (9, 0, 8)]);
    define_field!(erase_single_block_enabled, bool, 10, 6);
    define_field!(erase_sector_size, u8, [(10, 0, 6), (11, 7, 1)]);

    /// Returns the card capacity in bytes.
    pub fn card_capacity_bytes(&self) -> u64 {
        (u64::from(self.device_size()) + 1) * 512 * 1024
    }

    /// Returns the card capacity in 512-byte sectors.
    pub fn card_capacity_blocks(&self) -> u32 {
        (self.device_size() + 1) * 1024
    }
}

/// The Card Identification register.
#[derive(Debug, Default, Clone)]
pub struct Cid {
    /// The 16 bytes of the register.
    pub data: [u8; 16],
}

impl Cid {
    define_field!(manufacturer_id, u8, 0, 0, 8);
    define_field!(oem_id, str, 1, 2);
    define_field!(product_name, str, 3, 5);
    define_field!(product_revision, u8, 8, 0, 8);
    define_field!(serial_number, u32, [(9, 0, 8), (10, 0, 8), (11, 0, 8), (12, 0, 8)]);
    define_field!(manufacturing_date, u16, [(13, 0, 4), (14, 0, 8)]);
    define_field!(crc, u8, 15, 1, 7);

    /// The year the card was manufactured.
    pub fn manufacture_year(&self) -> u16 {
        2000 + (self.manufacturing_date() >> 4)
    }

    /// The month the card was manufactured (1-12).
    pub fn manufacture_month(&self) -> u8 {
        (self.manufacturing_date() & 0x0F) as u8
    }
}

/// The 64-byte SD status block read with ACMD13.
#[derive(Clone)]
pub struct SdStatusBlock {
    /// The 64 bytes of the block.
    pub data: [u8; 64],
}

impl Default for SdStatusBlock {
    fn default() -> SdStatusBlock {
        SdStatusBlock { data: [0u8; 64] }
    }
}

impl SdStatusBlock {
    define_field!(dat_bus_width, u8, 0, 6, 2);
    define_field!(secured_mode, bool, 0, 5);
    define_field!(speed_class, u8, 8, 0, 8);
    define_field!(au_size, u8, 10, 4, 4);

    /// The allocation unit size, in 512-byte sectors.
    pub fn allocation_unit_blocks(&self) -> u32 {
        16u32 << self.au_size()
    }
}


// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
