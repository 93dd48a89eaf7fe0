//! # sd-diskio
//!
//! > An SPI-mode SD/MMC block device driver for Embedded Rust
//!
//! This crate drives an SD or MMC card over a plain SPI bus and exposes
//! it as a 512-byte block device — the storage backend a FAT filesystem
//! layer mounts on. It is written in pure-Rust, is `#![no_std]` and does
//! not use `alloc`, and is designed for readability and simplicity over
//! performance.
//!
//! The driver is built from two capabilities you hand it:
//!
//! * an [`SdBus`] — the byte-level SPI transport with chip select,
//!   two-speed clock, and the socket's card-detect / write-protect
//!   inputs. [`SpiTransport`] adapts any `embedded-hal` SPI peripheral
//!   plus chip-select pin.
//! * a [`Clock`] — monotonic milliseconds used to bound every protocol
//!   wait. [`TickClock`] suits targets whose only time source is a
//!   periodic 1 ms interrupt.
//!
//! ```rust,ignore
//! # struct DummySpi;
//! # struct DummyCsPin;
//! # let spi = DummySpi;
//! # let cs = DummyCsPin;
//! static CLOCK: sd_diskio::TickClock = sd_diskio::TickClock::new();
//! // ... arrange for a 1 ms timer interrupt to call CLOCK.tick() ...
//!
//! let transport = sd_diskio::SpiTransport::new(spi, cs);
//! let mut disk = sd_diskio::SdMmcDisk::new(transport, &CLOCK);
//! if !disk.initialize(0).contains(sd_diskio::DriveStatus::NO_INIT) {
//!     let mut blocks = [sd_diskio::Block::new()];
//!     disk.read(0, &mut blocks, sd_diskio::BlockIdx(0)).unwrap();
//! }
//! ```
//!
//! ## Features
//!
//! * `log` (default): log driver activity through the `log` facade.
//! * `defmt-log`: log through `defmt` instead.
//!
//! Make sure that either the `log` feature or the `defmt-log` feature is
//! enabled, but not both.

#![cfg_attr(not(test), no_std)]
// #![deny(missing_docs)]

// ****************************************************************************
//
// Imports
//
// ****************************************************************************

#[cfg(all(feature = "defmt-log", feature = "log"))]
compile_error!("Cannot enable both the `log` and `defmt-log` features");

#[cfg(all(not(feature = "defmt-log"), not(feature = "log")))]
compile_error!("Must enable either the `log` or the `defmt-log` feature");

#[macro_use]
mod structure;

pub mod block_device;
pub mod clock;
pub mod sdmmc;
pub mod transport;

pub use crate::block_device::{
    Block, BlockCount, BlockDevice, BlockIdx, CardType, DiskError, DriveStatus, Ioctl,
    IoctlResponse, MemoryBlockDevice, PowerControl,
};
pub use crate::clock::{Clock, TickClock};
pub use crate::sdmmc::proto::{Cid, Csd, CsdV1, CsdV2, Ocr, SdStatusBlock};
pub use crate::sdmmc::{SdMmcDisk, Timeouts};
pub use crate::transport::{BusError, SdBus, SpiTransport};

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
