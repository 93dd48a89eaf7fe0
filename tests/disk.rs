//! Integration tests for the card driver.
//!
//! The driver runs against a scripted in-memory card model on a mock
//! transport, with simulated time: the mock records every frame, token
//! and chip-select edge so the tests can assert on the exact wire
//! traffic, and the clock advances one millisecond per query so the
//! bounded waits run out without real delays.

use std::cell::RefCell;
use std::rc::Rc;

use sd_diskio::{
    Block, BlockCount, BlockIdx, CardType, Cid, Clock, DiskError, DriveStatus, Ioctl,
    IoctlResponse, PowerControl, SdBus, SdMmcDisk,
};

use hex_literal::hex;

/// An actual CSD read from a 4 GB SDHC card: 7,710,720 sectors.
const CSD_V2: [u8; 16] = hex!("40 0E 00 32 5B 59 00 00 1D 69 7F 80 0A 40 00 8B");

/// An actual CSD read from a 1 GB SD v1 card: 1,984,000 sectors.
const CSD_V1: [u8; 16] = hex!("00 26 00 32 5F 59 83 C8 AD DB CF FF D2 40 40 A5");

/// A SanDisk 2 GB card identification register.
const CID: [u8; 16] = hex!("03 53 44 53 55 30 32 47 80 00 15 8A 5F 01 0A 6F");

mod mock {
    use super::*;

    /// What kind of card the model pretends to be.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum Flavor {
        /// SD v2, high capacity (block addressed).
        Sd2Block,
        /// SD v2, standard capacity (byte addressed).
        Sd2Byte,
        /// SD v1.
        Sd1,
        /// MMC v3.
        Mmc3,
    }

    /// A captured command frame.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct Frame {
        pub cmd: u8,
        pub arg: u32,
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Phase {
        /// Scanning the inbound bytes for command frames.
        Command,
        /// A write command was accepted; waiting for a start token.
        AwaitToken { sector: u32, multi: bool },
        /// Receiving the 512 payload bytes plus two CRC bytes.
        WriteData {
            sector: u32,
            multi: bool,
            buf: Vec<u8>,
        },
        /// Serving blocks until stop-transmission.
        MultiRead { sector: u32 },
    }

    pub struct MockCard {
        flavor: Flavor,
        csd: [u8; 16],
        cid: [u8; 16],
        sd_status: [u8; 64],
        sectors: std::collections::HashMap<u32, [u8; 512]>,

        pub selected: bool,
        pub present: bool,
        pub protected: bool,
        pub fast_clock: bool,
        /// Fault injection: accept reads but never send the data token.
        pub swallow_read_token: bool,

        out: std::collections::VecDeque<u8>,
        frame: Vec<u8>,
        phase: Phase,
        app_cmd: bool,
        idle: bool,
        op_cond_polls: u32,

        pub frames: Vec<Frame>,
        pub write_tokens: Vec<u8>,
        pub bus_calls: u64,
    }

    impl MockCard {
        pub fn new(flavor: Flavor) -> MockCard {
            let csd = match flavor {
                Flavor::Sd2Block | Flavor::Sd2Byte => CSD_V2,
                Flavor::Sd1 | Flavor::Mmc3 => CSD_V1,
            };
            let mut sd_status = [0u8; 64];
            sd_status[10] = 0x90; // AU_SIZE 9: 4 MB allocation units
            MockCard {
                flavor,
                csd,
                cid: CID,
                sd_status,
                sectors: std::collections::HashMap::new(),
                selected: false,
                present: true,
                protected: false,
                fast_clock: false,
                swallow_read_token: false,
                out: std::collections::VecDeque::new(),
                frame: Vec::new(),
                phase: Phase::Command,
                app_cmd: false,
                idle: true,
                op_cond_polls: 2,
                frames: Vec::new(),
                write_tokens: Vec::new(),
                bus_calls: 0,
            }
        }

        /// The commands recorded so far, by index.
        pub fn commands(&self) -> Vec<u8> {
            self.frames.iter().map(|f| f.cmd).collect()
        }

        pub fn sector(&self, idx: u32) -> [u8; 512] {
            self.sectors.get(&idx).copied().unwrap_or([0u8; 512])
        }

        fn block_addressed(&self) -> bool {
            self.flavor == Flavor::Sd2Block
        }

        fn sector_of(&self, arg: u32) -> u32 {
            if self.block_addressed() {
                arg
            } else {
                assert_eq!(arg % 512, 0, "byte-addressed arg must be sector aligned");
                arg / 512
            }
        }

        pub fn exchange_byte(&mut self, input: u8) -> u8 {
            self.bus_calls += 1;
            if !self.selected {
                return 0xFF;
            }

            match self.phase {
                Phase::AwaitToken { .. } | Phase::WriteData { .. } => {
                    return self.feed_data(input)
                }
                _ => {}
            }

            if !self.frame.is_empty() || (input & 0xC0) == 0x40 {
                return self.feed_command(input);
            }

            // Host is polling; serve whatever the card has queued.
            if let Some(byte) = self.out.pop_front() {
                return byte;
            }
            if let Phase::MultiRead { sector } = self.phase {
                self.queue_block(sector);
                self.phase = Phase::MultiRead { sector: sector + 1 };
                return self.out.pop_front().unwrap();
            }
            0xFF
        }

        pub fn deselect(&mut self) {
            self.selected = false;
            self.frame.clear();
            self.out.clear();
        }

        fn feed_command(&mut self, input: u8) -> u8 {
            self.frame.push(input);
            if self.frame.len() < 6 {
                return 0xFF;
            }
            let cmd = self.frame[0] & 0x3F;
            let arg = u32::from_be_bytes([
                self.frame[1],
                self.frame[2],
                self.frame[3],
                self.frame[4],
            ]);
            let crc = self.frame[5];
            self.frame.clear();
            self.process_command(cmd, arg, crc);
            0xFF
        }

        fn r1(&mut self, value: u8) {
            self.out.push_back(value);
        }

        fn queue_block(&mut self, sector: u32) {
            let data = self.sector(sector);
            self.out.push_back(0xFF);
            self.out.push_back(0xFE);
            self.out.extend(data.iter().copied());
            self.out.push_back(0xAA); // CRC, never checked
            self.out.push_back(0xBB);
        }

        fn queue_register(&mut self, data: &[u8]) {
            self.out.push_back(0xFF);
            self.out.push_back(0xFE);
            self.out.extend(data.iter().copied());
            self.out.push_back(0xAA);
            self.out.push_back(0xBB);
        }

        fn queue_op_cond_response(&mut self) {
            if self.op_cond_polls > 0 {
                self.op_cond_polls -= 1;
                self.r1(0x01);
            } else {
                self.idle = false;
                self.r1(0x00);
            }
        }

        fn process_command(&mut self, cmd: u8, arg: u32, crc: u8) {
            self.frames.push(Frame { cmd, arg });
            let app = std::mem::replace(&mut self.app_cmd, false);
            self.out.clear();
            self.out.push_back(0xFF); // response delay

            match (cmd, app) {
                (0, _) => {
                    assert_eq!(crc, 0x95, "go-idle must carry its real CRC");
                    self.idle = true;
                    self.phase = Phase::Command;
                    self.r1(0x01);
                }
                (8, _) => match self.flavor {
                    Flavor::Sd2Block | Flavor::Sd2Byte => {
                        assert_eq!(arg, 0x1AA);
                        assert_eq!(crc, 0x87, "send-if-cond must carry its real CRC");
                        self.r1(0x01);
                        self.out.extend([0x00, 0x00, 0x01, 0xAA]); // R7 echo
                    }
                    _ => self.r1(0x05), // illegal | idle
                },
                (55, _) => {
                    self.app_cmd = true;
                    self.r1(if self.idle { 0x01 } else { 0x00 });
                }
                (41, true) => match self.flavor {
                    Flavor::Mmc3 => self.r1(0x05),
                    _ => self.queue_op_cond_response(),
                },
                (1, _) => match self.flavor {
                    Flavor::Mmc3 => self.queue_op_cond_response(),
                    _ => self.r1(0x05),
                },
                (58, _) => {
                    self.r1(0x00);
                    let ccs = if self.block_addressed() { 0x40 } else { 0x00 };
                    self.out.extend([0x80 | ccs, 0xFF, 0x80, 0x00]);
                }
                (16, _) => {
                    assert_eq!(arg, 512);
                    self.r1(0x00);
                }
                (9, _) => {
                    self.r1(0x00);
                    let csd = self.csd;
                    self.queue_register(&csd);
                }
                (10, _) => {
                    self.r1(0x00);
                    let cid = self.cid;
                    self.queue_register(&cid);
                }
                (13, true) => {
                    self.r1(0x00);
                    self.out.push_back(0x00); // second byte of R2
                    let status = self.sd_status;
                    self.queue_register(&status);
                }
                (17, _) => {
                    self.r1(0x00);
                    if !self.swallow_read_token {
                        let sector = self.sector_of(arg);
                        self.queue_block(sector);
                    }
                }
                (18, _) => {
                    self.r1(0x00);
                    self.phase = Phase::MultiRead {
                        sector: self.sector_of(arg),
                    };
                }
                (12, _) => {
                    self.phase = Phase::Command;
                    self.out.push_back(0xFF); // stuff byte
                    self.r1(0x00);
                }
                (24, _) => {
                    self.r1(0x00);
                    self.phase = Phase::AwaitToken {
                        sector: self.sector_of(arg),
                        multi: false,
                    };
                }
                (25, _) => {
                    self.r1(0x00);
                    self.phase = Phase::AwaitToken {
                        sector: self.sector_of(arg),
                        multi: true,
                    };
                }
                (32, _) | (33, _) => self.r1(0x00),
                (38, _) => {
                    self.r1(0x00);
                    // Erase in progress, then ready.
                    self.out.extend([0x00, 0x00, 0xFF]);
                }
                _ => self.r1(0x04), // illegal command
            }
        }

        fn feed_data(&mut self, input: u8) -> u8 {
            match &mut self.phase {
                Phase::AwaitToken { sector, multi } => {
                    let (sector, multi) = (*sector, *multi);
                    match input {
                        0xFF => self.out.pop_front().unwrap_or(0xFF),
                        0xFE | 0xFC => {
                            self.write_tokens.push(input);
                            self.phase = Phase::WriteData {
                                sector,
                                multi,
                                buf: Vec::new(),
                            };
                            0xFF
                        }
                        0xFD => {
                            assert!(multi, "stop token outside a multiple-block write");
                            self.write_tokens.push(input);
                            self.phase = Phase::Command;
                            self.out.extend([0x00, 0xFF]); // busy, then ready
                            0xFF
                        }
                        other => panic!("unexpected byte {:#04x} while awaiting a token", other),
                    }
                }
                Phase::WriteData { sector, multi, buf } => {
                    buf.push(input);
                    if buf.len() == 514 {
                        let mut data = [0u8; 512];
                        data.copy_from_slice(&buf[..512]);
                        let (sector, multi) = (*sector, *multi);
                        self.sectors.insert(sector, data);
                        // Data accepted, a spell of busy, then ready.
                        self.out.extend([0x05, 0x00, 0xFF]);
                        self.phase = if multi {
                            Phase::AwaitToken {
                                sector: sector + 1,
                                multi: true,
                            }
                        } else {
                            Phase::Command
                        };
                    }
                    0xFF
                }
                _ => unreachable!(),
            }
        }
    }

    /// The `SdBus` handle the driver owns; tests keep a second handle to
    /// the shared card state for inspection.
    #[derive(Clone)]
    pub struct MockBus(pub Rc<RefCell<MockCard>>);

    impl SdBus for MockBus {
        type Error = core::convert::Infallible;

        fn exchange(&mut self, out: u8) -> Result<u8, Self::Error> {
            Ok(self.0.borrow_mut().exchange_byte(out))
        }

        fn select_slow(&mut self) -> Result<(), Self::Error> {
            let mut card = self.0.borrow_mut();
            card.bus_calls += 1;
            card.fast_clock = false;
            Ok(())
        }

        fn select_fast(&mut self) -> Result<(), Self::Error> {
            let mut card = self.0.borrow_mut();
            card.bus_calls += 1;
            card.fast_clock = true;
            Ok(())
        }

        fn chip_select(&mut self, selected: bool) -> Result<(), Self::Error> {
            let mut card = self.0.borrow_mut();
            card.bus_calls += 1;
            if selected {
                card.selected = true;
            } else {
                card.deselect();
            }
            Ok(())
        }

        fn card_present(&mut self) -> bool {
            self.0.borrow().present
        }

        fn write_protected(&mut self) -> bool {
            self.0.borrow().protected
        }
    }

    /// Advances one millisecond per query.
    #[derive(Debug, Default)]
    pub struct SimClock {
        now: u32,
    }

    impl Clock for SimClock {
        fn now_ms(&mut self) -> u32 {
            let now = self.now;
            self.now = self.now.wrapping_add(1);
            now
        }
    }
}

use mock::{Flavor, MockBus, MockCard, SimClock};

type TestDisk = SdMmcDisk<MockBus, SimClock>;

fn setup(flavor: Flavor) -> (TestDisk, Rc<RefCell<MockCard>>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let card = Rc::new(RefCell::new(MockCard::new(flavor)));
    let disk = SdMmcDisk::new(MockBus(card.clone()), SimClock::default());
    (disk, card)
}

fn initialized(flavor: Flavor) -> (TestDisk, Rc<RefCell<MockCard>>) {
    let (mut disk, card) = setup(flavor);
    let status = disk.initialize(0);
    assert!(
        !status.contains(DriveStatus::NO_INIT),
        "initialization failed: {:?}",
        status
    );
    (disk, card)
}

fn pattern_block(seed: u32) -> Block {
    let mut block = Block::new();
    let mut state = seed;
    for byte in block.iter_mut() {
        state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
        *byte = (state >> 24) as u8;
    }
    block
}

#[test]
fn initialize_resolves_sd2_block_card() {
    let (mut disk, card) = setup(Flavor::Sd2Block);
    let status = disk.initialize(0);
    assert!(!status.contains(DriveStatus::NO_INIT));
    assert_eq!(
        disk.card_type(),
        CardType::Sd2 {
            high_capacity: true
        }
    );
    assert_eq!(disk.card_type().bits(), 0x0C);

    let card = card.borrow();
    let commands = card.commands();
    assert_eq!(commands[0], 0, "the sequence must start with go-idle");
    assert_eq!(commands[1], 8, "then probe the interface condition");
    assert_eq!(card.frames[1].arg, 0x1AA);
    assert!(commands.contains(&58), "the OCR classifies the addressing");
    assert!(card.fast_clock, "a successful init switches to fast clock");
    assert!(!card.selected, "the card is deselected when init returns");
}

#[test]
fn initialize_resolves_sd2_byte_card() {
    let (disk, _card) = initialized(Flavor::Sd2Byte);
    assert_eq!(
        disk.card_type(),
        CardType::Sd2 {
            high_capacity: false
        }
    );
    assert_eq!(disk.card_type().bits(), 0x04);
}

#[test]
fn initialize_resolves_sd1_card() {
    let (disk, card) = initialized(Flavor::Sd1);
    assert_eq!(disk.card_type(), CardType::Sd1);

    let card = card.borrow();
    let frames = &card.frames;
    // Legacy cards get the 512-byte block length pinned explicitly.
    let set_blocklen = frames.iter().find(|f| f.cmd == 16).expect("no CMD16");
    assert_eq!(set_blocklen.arg, 512);
}

#[test]
fn initialize_resolves_mmc_card() {
    let (disk, card) = initialized(Flavor::Mmc3);
    assert_eq!(disk.card_type(), CardType::Mmc3);

    let card = card.borrow();
    let commands = card.commands();
    assert!(
        commands.contains(&1),
        "MMC classification falls back to the generic op-cond command"
    );
    assert!(commands.contains(&16));
}

#[test]
fn operations_reject_other_units_without_touching_the_bus() {
    let (mut disk, card) = setup(Flavor::Sd2Block);

    assert_eq!(disk.initialize(1), DriveStatus::NO_INIT);
    assert_eq!(disk.status(1), DriveStatus::NO_INIT);
    let mut blocks = [Block::new()];
    assert_eq!(
        disk.read(1, &mut blocks, BlockIdx(0)),
        Err(DiskError::ParamError)
    );
    assert_eq!(
        disk.write(1, &blocks, BlockIdx(0)),
        Err(DiskError::ParamError)
    );
    assert_eq!(disk.ioctl(1, Ioctl::SectorCount), Err(DiskError::ParamError));

    assert_eq!(card.borrow().bus_calls, 0, "unit 1 must never reach the bus");
}

#[test]
fn zero_length_transfers_are_parameter_errors() {
    let (mut disk, card) = initialized(Flavor::Sd2Block);
    let calls_after_init = card.borrow().bus_calls;

    assert_eq!(
        disk.read(0, &mut [], BlockIdx(0)),
        Err(DiskError::ParamError)
    );
    assert_eq!(disk.write(0, &[], BlockIdx(0)), Err(DiskError::ParamError));
    assert_eq!(card.borrow().bus_calls, calls_after_init);
}

#[test]
fn transfers_before_initialize_fail_fast() {
    let (mut disk, card) = setup(Flavor::Sd2Block);
    let mut blocks = [Block::new()];
    assert_eq!(
        disk.read(0, &mut blocks, BlockIdx(0)),
        Err(DiskError::NotReady)
    );
    assert_eq!(disk.write(0, &blocks, BlockIdx(0)), Err(DiskError::NotReady));
    assert_eq!(disk.ioctl(0, Ioctl::SectorCount), Err(DiskError::NotReady));
    assert_eq!(card.borrow().bus_calls, 0);
}

#[test]
fn round_trip_across_counts_and_offsets() {
    for &count in &[1usize, 2, 8] {
        for &start in &[0u32, 1, 10_000_000] {
            let (mut disk, _card) = initialized(Flavor::Sd2Block);

            let written: Vec<Block> = (0..count)
                .map(|i| pattern_block(start ^ (i as u32).wrapping_mul(0x9E37_79B9)))
                .collect();
            disk.write(0, &written, BlockIdx(start)).unwrap();

            let mut readback = vec![Block::new(); count];
            disk.read(0, &mut readback, BlockIdx(start)).unwrap();
            assert_eq!(readback, written, "count={} start={}", count, start);
        }
    }
}

#[test]
fn byte_addressed_cards_scale_the_sector_number() {
    let (mut disk, card) = initialized(Flavor::Sd2Byte);

    let mut blocks = [Block::new()];
    disk.read(0, &mut blocks, BlockIdx(3)).unwrap();
    let frame = *card.borrow().frames.last().unwrap();
    assert_eq!(frame.cmd, 17);
    assert_eq!(frame.arg, 3 * 512, "legacy cards take byte offsets");

    let (mut disk, card) = initialized(Flavor::Sd2Block);
    disk.read(0, &mut blocks, BlockIdx(3)).unwrap();
    let frame = *card.borrow().frames.last().unwrap();
    assert_eq!(frame.arg, 3, "high-capacity cards take sector numbers");
}

#[test]
fn single_block_transfers_use_the_single_block_commands() {
    let (mut disk, card) = initialized(Flavor::Sd2Block);
    let frames_after_init = card.borrow().frames.len();

    let mut blocks = [Block::new()];
    disk.read(0, &mut blocks, BlockIdx(7)).unwrap();
    disk.write(0, &blocks, BlockIdx(7)).unwrap();

    let card = card.borrow();
    let new: Vec<u8> = card.commands()[frames_after_init..].to_vec();
    assert_eq!(new, vec![17, 24]);
    assert_eq!(card.write_tokens, vec![0xFE]);
}

#[test]
fn multi_block_write_token_framing() {
    let (mut disk, card) = initialized(Flavor::Sd2Block);

    let blocks: Vec<Block> = (0..3).map(|i| pattern_block(i)).collect();
    disk.write(0, &blocks, BlockIdx(40)).unwrap();

    let card = card.borrow();
    assert_eq!(card.frames.last().unwrap().cmd, 25);
    // First block behind the start token, the remaining count-1 behind
    // the multiple-block token, closed by the payload-less stop token.
    assert_eq!(card.write_tokens, vec![0xFE, 0xFC, 0xFC, 0xFD]);
    assert_eq!(card.sector(40), *pattern_block(0));
    assert_eq!(card.sector(42), *pattern_block(2));
}

#[test]
fn multi_block_read_ends_with_stop_transmission() {
    let (mut disk, card) = initialized(Flavor::Sd2Block);
    let frames_after_init = card.borrow().frames.len();

    let mut blocks = vec![Block::new(); 4];
    disk.read(0, &mut blocks, BlockIdx(9)).unwrap();

    let card = card.borrow();
    let new: Vec<u8> = card.commands()[frames_after_init..].to_vec();
    assert_eq!(new, vec![18, 12]);
}

#[test]
fn read_token_timeout_is_an_io_error_and_releases_the_bus() {
    let (mut disk, card) = initialized(Flavor::Sd2Block);
    card.borrow_mut().swallow_read_token = true;

    let mut blocks = [Block::new()];
    assert_eq!(
        disk.read(0, &mut blocks, BlockIdx(0)),
        Err(DiskError::IoError)
    );
    assert!(
        !card.borrow().selected,
        "the bus must be deselected after a failed transfer"
    );
}

#[test]
fn write_protect_rejects_before_any_bus_traffic() {
    let (mut disk, card) = initialized(Flavor::Sd2Block);
    card.borrow_mut().protected = true;
    disk.tick();
    assert!(disk.status(0).contains(DriveStatus::PROTECT));

    let frames_before = card.borrow().frames.len();
    let blocks = [Block::new()];
    assert_eq!(
        disk.write(0, &blocks, BlockIdx(0)),
        Err(DiskError::WriteProtected)
    );
    assert_eq!(card.borrow().frames.len(), frames_before);

    card.borrow_mut().protected = false;
    disk.tick();
    disk.write(0, &blocks, BlockIdx(0)).unwrap();
}

#[test]
fn card_removal_invalidates_the_drive() {
    let (mut disk, card) = initialized(Flavor::Sd2Block);

    card.borrow_mut().present = false;
    disk.tick();
    let status = disk.status(0);
    assert!(status.contains(DriveStatus::NO_DISK));
    assert!(status.contains(DriveStatus::NO_INIT));

    let mut blocks = [Block::new()];
    assert_eq!(
        disk.read(0, &mut blocks, BlockIdx(0)),
        Err(DiskError::NotReady)
    );

    // With the socket empty, initialize refuses without bus traffic.
    let frames_before = card.borrow().frames.len();
    let status = disk.initialize(0);
    assert!(status.contains(DriveStatus::NO_INIT));
    assert_eq!(card.borrow().frames.len(), frames_before);

    // Re-inserting clears NO_DISK on the next tick, but the drive needs
    // a fresh initialize before it is usable again.
    card.borrow_mut().present = true;
    disk.tick();
    let status = disk.status(0);
    assert!(!status.contains(DriveStatus::NO_DISK));
    assert!(status.contains(DriveStatus::NO_INIT));

    assert!(!disk.initialize(0).contains(DriveStatus::NO_INIT));
    disk.read(0, &mut blocks, BlockIdx(0)).unwrap();
}

#[test]
fn sector_count_matches_reference_csd_dumps() {
    let (mut disk, _card) = initialized(Flavor::Sd2Block);
    assert_eq!(
        disk.ioctl(0, Ioctl::SectorCount),
        Ok(IoctlResponse::SectorCount(BlockCount(7_710_720)))
    );

    let (mut disk, _card) = initialized(Flavor::Sd1);
    assert_eq!(
        disk.ioctl(0, Ioctl::SectorCount),
        Ok(IoctlResponse::SectorCount(BlockCount(1_984_000)))
    );
}

#[test]
fn erase_block_size_follows_the_card_geometry() {
    // SD v2: allocation unit from the SD status (AU_SIZE 9 = 4 MB).
    let (mut disk, _card) = initialized(Flavor::Sd2Block);
    assert_eq!(
        disk.ioctl(0, Ioctl::EraseBlockSize),
        Ok(IoctlResponse::EraseBlockSize(BlockCount(8192)))
    );

    // SD v1: erase sector geometry from the CSD.
    let (mut disk, _card) = initialized(Flavor::Sd1);
    assert_eq!(
        disk.ioctl(0, Ioctl::EraseBlockSize),
        Ok(IoctlResponse::EraseBlockSize(BlockCount(32)))
    );

    // MMC: erase group geometry from the CSD.
    let (mut disk, _card) = initialized(Flavor::Mmc3);
    assert_eq!(
        disk.ioctl(0, Ioctl::EraseBlockSize),
        Ok(IoctlResponse::EraseBlockSize(BlockCount(640)))
    );
}

#[test]
fn trim_issues_the_erase_command_group() {
    let (mut disk, card) = initialized(Flavor::Sd2Block);
    assert_eq!(
        disk.ioctl(
            0,
            Ioctl::Trim {
                start: BlockIdx(100),
                end: BlockIdx(163),
            }
        ),
        Ok(IoctlResponse::None)
    );

    let card = card.borrow();
    let erase: Vec<mock::Frame> = card
        .frames
        .iter()
        .filter(|f| f.cmd == 32 || f.cmd == 33 || f.cmd == 38)
        .copied()
        .collect();
    assert_eq!(erase.len(), 3);
    assert_eq!((erase[0].cmd, erase[0].arg), (32, 100));
    assert_eq!((erase[1].cmd, erase[1].arg), (33, 163));
    assert_eq!(erase[2].cmd, 38);
}

#[test]
fn trim_scales_addresses_on_byte_addressed_cards() {
    let (mut disk, card) = initialized(Flavor::Sd1);
    disk.ioctl(
        0,
        Ioctl::Trim {
            start: BlockIdx(2),
            end: BlockIdx(4),
        },
    )
    .unwrap();

    let card = card.borrow();
    let start = card.frames.iter().find(|f| f.cmd == 32).unwrap();
    let end = card.frames.iter().find(|f| f.cmd == 33).unwrap();
    assert_eq!(start.arg, 2 * 512);
    assert_eq!(end.arg, 4 * 512);
}

#[test]
fn trim_is_rejected_on_mmc() {
    let (mut disk, card) = initialized(Flavor::Mmc3);
    let frames_before = card.borrow().frames.len();
    assert_eq!(
        disk.ioctl(
            0,
            Ioctl::Trim {
                start: BlockIdx(0),
                end: BlockIdx(0),
            }
        ),
        Err(DiskError::IoError)
    );
    assert_eq!(card.borrow().frames.len(), frames_before);
}

#[test]
fn register_ioctls_return_the_raw_dumps() {
    let (mut disk, _card) = initialized(Flavor::Sd2Block);

    assert_eq!(disk.ioctl(0, Ioctl::Csd), Ok(IoctlResponse::Csd(CSD_V2)));
    assert_eq!(disk.ioctl(0, Ioctl::Cid), Ok(IoctlResponse::Cid(CID)));
    assert_eq!(
        disk.ioctl(0, Ioctl::Ocr),
        Ok(IoctlResponse::Ocr([0xC0, 0xFF, 0x80, 0x00]))
    );
    match disk.ioctl(0, Ioctl::SdStatus) {
        Ok(IoctlResponse::SdStatus(data)) => assert_eq!(data[10], 0x90),
        other => panic!("unexpected SD status response: {:?}", other),
    }

    // The decoded view over the CID dump.
    let cid = Cid { data: CID };
    assert_eq!(cid.manufacturer_id(), 0x03);
    assert_eq!(cid.product_name(), b"SU02G");
    assert_eq!(cid.manufacture_year(), 2016);
}

#[test]
fn card_type_ioctl_reports_the_resolved_type() {
    let (mut disk, _card) = initialized(Flavor::Sd1);
    assert_eq!(
        disk.ioctl(0, Ioctl::CardType),
        Ok(IoctlResponse::CardType(CardType::Sd1))
    );
}

#[test]
fn sync_waits_out_the_card() {
    let (mut disk, card) = initialized(Flavor::Sd2Block);
    assert_eq!(disk.ioctl(0, Ioctl::Sync), Ok(IoctlResponse::None));
    assert!(!card.borrow().selected);
}

#[test]
fn power_control_works_while_uninitialized() {
    let (mut disk, _card) = setup(Flavor::Sd2Block);
    assert!(disk.status(0).contains(DriveStatus::NO_INIT));

    assert_eq!(
        disk.ioctl(0, Ioctl::Power(PowerControl::Query)),
        Ok(IoctlResponse::Power(false))
    );
    assert_eq!(
        disk.ioctl(0, Ioctl::Power(PowerControl::On)),
        Ok(IoctlResponse::None)
    );
    assert_eq!(
        disk.ioctl(0, Ioctl::Power(PowerControl::Query)),
        Ok(IoctlResponse::Power(true))
    );
    assert_eq!(
        disk.ioctl(0, Ioctl::Power(PowerControl::Off)),
        Ok(IoctlResponse::None)
    );
    assert_eq!(
        disk.ioctl(0, Ioctl::Power(PowerControl::Query)),
        Ok(IoctlResponse::Power(false))
    );
}
