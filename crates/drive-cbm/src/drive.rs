//! The drive context.
//!
//! [`Drive`] owns everything that the original firmware kept in globals:
//! the buffer pool, the partition table, the DOS status, bus role state
//! and the fastloader detection latch. All engine modules operate on it
//! through `impl` blocks of their own.

use drive_core::{BlockDevice, FileStore, Nvram, Rtc, SimRtc, Ui};

use crate::buffer::{BUFFER_COUNT, Buffer, ERROR_CHANNEL};
use crate::d64::{BamCache, ErrorCache};
use crate::diskswap::SwapList;
use crate::fastloader::Loader;
use crate::iec::{BusState, DeviceState, IecFlags};
use crate::partition::Partition;
use crate::status::errors;

/// Size of the command channel accumulator.
pub const COMMAND_BUFFER_SIZE: usize = 120;

/// Maximum length accepted for `E-R` reads.
pub const ERROR_BUFFER_SIZE: usize = 100;

/// Outcome of a single channel read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelRead {
    /// More data follows.
    More,
    /// This byte is the last one; send it with EOI.
    LastWithEoi,
    /// Refill failed; this byte still goes out plain, then the
    /// transfer stops.
    Aborted,
}

/// Sticky global flags toggled by extension commands.
#[derive(Debug, Clone, Copy, Default)]
pub struct GlobalFlags {
    /// A swap list is active.
    pub autoswap_active: bool,
    /// Hide known type extensions and map them to file types.
    pub extension_hiding: bool,
    /// Match text after `*` against the name tail.
    pub postmatch: bool,
    /// Report real free blocks on FAT32 instead of the fake 1.
    pub fat32_freeblocks: bool,
}

/// Construction-time configuration.
pub struct DriveConfig {
    /// Initial bus address (4..=30).
    pub device_address: u8,
    /// JiffyDOS protocol permitted.
    pub jiffy_enabled: bool,
    pub rtc: Box<dyn Rtc>,
    pub nvram: Box<dyn Nvram>,
    pub ui: Box<dyn Ui>,
    pub blockdev: Option<Box<dyn BlockDevice>>,
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            device_address: 8,
            jiffy_enabled: true,
            rtc: Box::new(SimRtc::absent()),
            nvram: Box::new(drive_core::SharedNvram::new(0)),
            ui: Box::new(drive_core::NullUi),
            blockdev: None,
        }
    }
}

/// The drive engine.
pub struct Drive<F: FileStore> {
    // Storage
    pub(crate) parts: Vec<Partition<F>>,
    pub(crate) current_part: usize,
    pub(crate) blockdev: Option<Box<dyn BlockDevice>>,

    // Channels
    pub(crate) bufs: Vec<Buffer>,
    /// Allocated buffers + 16 per write buffer, for the LED logic.
    pub(crate) active_buffers: u8,
    pub(crate) bam: BamCache,
    pub(crate) error_cache: ErrorCache,

    // Command channel
    pub(crate) command: Vec<u8>,
    pub(crate) current_error: u8,
    pub(crate) error_blink: bool,
    pub(crate) longversion: bool,

    // Bus state
    pub(crate) device_address: u8,
    /// Address selected in hardware; stored config applies only while
    /// it matches.
    pub(crate) hard_address: u8,
    pub(crate) secondary: u8,
    /// Last ATN command byte, carried into the listen/talk phase.
    pub(crate) atn_cmd: u8,
    pub(crate) bus_state: BusState,
    pub(crate) device_state: DeviceState,
    pub(crate) flags: IecFlags,

    // DOS options
    pub(crate) globalflags: GlobalFlags,
    pub(crate) file_extension_mode: u8,
    pub(crate) image_as_dir: u8,

    // Fastloader detection
    pub(crate) detected_loader: Loader,
    pub(crate) datacrc: u16,
    pub(crate) fl_track: u8,
    pub(crate) fl_sector: u8,

    // Collaborators
    pub(crate) rtc: Box<dyn Rtc>,
    pub(crate) nvram: Box<dyn Nvram>,
    pub(crate) ui: Box<dyn Ui>,

    // Disk swapping
    pub(crate) swaplist: Option<SwapList>,
}

impl<F: FileStore> Drive<F> {
    /// Build a drive over one FAT volume per partition.
    ///
    /// Announces itself with the DOS version message like a freshly
    /// powered-up drive.
    pub fn new(stores: Vec<F>, config: DriveConfig) -> Self {
        let parts = stores.into_iter().map(Partition::new).collect();

        let mut bufs = vec![Buffer::default(); BUFFER_COUNT + 1];
        bufs[ERROR_CHANNEL].allocated = true;
        bufs[ERROR_CHANNEL].sticky = true;
        bufs[ERROR_CHANNEL].secondary = 15;
        bufs[ERROR_CHANNEL].read = true;
        bufs[ERROR_CHANNEL].write = true;
        bufs[ERROR_CHANNEL].send_eoi = true;

        let mut drive = Self {
            parts,
            current_part: 0,
            blockdev: config.blockdev,
            bufs,
            active_buffers: 0,
            bam: BamCache::new(),
            error_cache: ErrorCache::new(),
            command: Vec::with_capacity(COMMAND_BUFFER_SIZE),
            current_error: 0,
            error_blink: false,
            longversion: false,
            device_address: config.device_address & 0x1f,
            hard_address: config.device_address & 0x1f,
            secondary: 0,
            atn_cmd: 0,
            bus_state: BusState::Idle,
            device_state: DeviceState::Idle,
            flags: IecFlags {
                jiffy_enabled: config.jiffy_enabled,
                ..IecFlags::default()
            },
            globalflags: GlobalFlags::default(),
            file_extension_mode: 0,
            image_as_dir: 0,
            detected_loader: Loader::None,
            datacrc: 0xffff,
            fl_track: 0xff,
            fl_sector: 0,
            rtc: config.rtc,
            nvram: config.nvram,
            ui: config.ui,
            swaplist: None,
        };

        drive.read_configuration();
        drive.set_error(errors::DOSVERSION);
        drive
    }

    /// Number of partitions.
    #[must_use]
    pub fn partition_count(&self) -> usize {
        self.parts.len()
    }

    /// Currently selected partition.
    #[must_use]
    pub fn current_partition(&self) -> usize {
        self.current_part
    }

    /// The current DOS error number.
    #[must_use]
    pub fn error_code(&self) -> u8 {
        self.current_error
    }

    /// Current bus address.
    #[must_use]
    pub fn address(&self) -> u8 {
        self.device_address
    }

    /// The fastloader the detection latch currently points at.
    #[must_use]
    pub fn loader(&self) -> Loader {
        self.detected_loader
    }

    /// Current bus protocol state.
    #[must_use]
    pub fn bus_state(&self) -> BusState {
        self.bus_state
    }

    /// Whether the host spoke JiffyDOS during the last ATN sequence.
    #[must_use]
    pub fn jiffy_active(&self) -> bool {
        self.flags.jiffy_active
    }

    /// Borrow a partition's file store, e.g. to inspect results in tests.
    #[must_use]
    pub fn filesystem(&self, part: usize) -> &F {
        &self.parts[part].fs
    }

    /// Mount state of every partition.
    #[must_use]
    pub fn parts(&self) -> Vec<crate::partition::Mount> {
        self.parts.iter().map(|p| p.mount).collect()
    }

    /// Borrow a channel buffer by pool index.
    #[must_use]
    pub fn buffer(&self, idx: usize) -> &Buffer {
        &self.bufs[idx]
    }

    /// Mutably borrow a partition's file store.
    pub fn filesystem_mut(&mut self, part: usize) -> &mut F {
        &mut self.parts[part].fs
    }

    /// Replace the command channel contents, as an OPEN/command listen
    /// phase would.
    pub fn set_command(&mut self, bytes: &[u8]) {
        self.command.clear();
        self.command
            .extend_from_slice(&bytes[..bytes.len().min(COMMAND_BUFFER_SIZE)]);
    }

    /// Append one byte to the command accumulator; excess bytes are
    /// dropped and flagged as overlong later.
    pub(crate) fn push_command_byte(&mut self, byte: u8) {
        if self.command.len() < COMMAND_BUFFER_SIZE {
            self.command.push(byte);
        }
    }

    /// Read one byte from a talk channel.
    ///
    /// Advances the window, triggering a refill when it is exhausted.
    /// `None` means the channel is not open for reading at all.
    pub fn channel_read(&mut self, secondary: u8) -> Option<(u8, ChannelRead)> {
        let idx = self.find_buffer(secondary)?;
        if !self.bufs[idx].read {
            return None;
        }

        let buf = &self.bufs[idx];
        let byte = buf.data[usize::from(buf.position)];
        let at_end = buf.position == buf.last_used;

        if at_end {
            if self.bufs[idx].send_eoi {
                // Reading the status channel to the end resets it to OK
                if secondary == 15 {
                    self.set_error(errors::OK);
                }
                return Some((byte, ChannelRead::LastWithEoi));
            }
            if self.refill(idx).is_err() {
                return Some((byte, ChannelRead::Aborted));
            }
        } else {
            self.bufs[idx].position += 1;
        }

        Some((byte, ChannelRead::More))
    }

    /// Convenience for tests and fastloaders: drain a talk channel.
    ///
    /// Reads until the EOI byte or an abort, like a host doing `GET#`
    /// in a loop.
    pub fn channel_read_all(&mut self, secondary: u8) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some((byte, status)) = self.channel_read(secondary) {
            out.push(byte);
            if status != ChannelRead::More {
                break;
            }
        }
        out
    }

    /// Write one byte into a listen channel.
    ///
    /// Flushes the window through the refill callback when it wraps.
    pub fn channel_write(&mut self, secondary: u8, byte: u8) -> Result<(), ()> {
        let idx = self.find_buffer(secondary).ok_or(())?;
        if !self.bufs[idx].write {
            return Err(());
        }

        let buf = &mut self.bufs[idx];
        buf.dirty = true;
        buf.data[usize::from(buf.position)] = byte;
        if buf.last_used < buf.position {
            buf.last_used = buf.position;
        }
        buf.position = buf.position.wrapping_add(1);

        if buf.position == 0 {
            return self.refill(idx);
        }
        Ok(())
    }

    /// Close one channel (CLOSE on the bus): cleanup, then free.
    pub fn close_channel(&mut self, secondary: u8) -> Result<(), ()> {
        if let Some(idx) = self.find_buffer(secondary) {
            let res = self.cleanup(idx);
            self.free_buffer(idx);
            res
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use drive_core::MemStore;

    /// A one-partition drive over an empty in-memory volume.
    pub(crate) fn test_drive() -> Drive<MemStore> {
        Drive::new(vec![MemStore::new("TESTDISK")], DriveConfig::default())
    }

    /// A drive whose first partition contains the given files.
    pub(crate) fn drive_with_files(files: &[(&str, &[u8])]) -> Drive<MemStore> {
        let mut fs = MemStore::new("TESTDISK");
        for (name, data) in files {
            fs.add_file(0, name, data);
        }
        Drive::new(vec![fs], DriveConfig::default())
    }

    #[test]
    fn powers_up_with_version_message() {
        let drive = test_drive();
        assert_eq!(drive.error_code(), errors::DOSVERSION);
        assert!(drive.status_line().starts_with(b"73,CBMDRIVE"));
    }

    #[test]
    fn command_buffer_capped() {
        let mut drive = test_drive();
        for _ in 0..200 {
            drive.push_command_byte(b'X');
        }
        assert_eq!(drive.command.len(), COMMAND_BUFFER_SIZE);
    }
}
