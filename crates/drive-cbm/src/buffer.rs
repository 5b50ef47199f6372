//! Channel buffer pool.
//!
//! A fixed set of 256-byte buffers mediates between bus transfers and the
//! file backends. Each open channel binds one buffer by secondary address;
//! the buffer's kind selects the refill/cleanup behaviour when its window
//! is exhausted (see `fileops`). One extra sticky buffer carries the
//! status channel on secondary 15.

use drive_core::{FileId, FileStore};

use crate::dirent::DirCursor;
use crate::drive::Drive;
use crate::status::errors;

/// Number of user buffers.
pub const BUFFER_COUNT: usize = 6;

/// Pool index of the status-channel buffer.
pub const ERROR_CHANNEL: usize = BUFFER_COUNT;

/// Private state of a directory-listing buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirState {
    pub cursor: DirCursor,
    /// Wildcard pattern to filter entries, if any.
    pub pattern: Option<Vec<u8>>,
    /// Required file type (0 = all) or `FLAG_HIDDEN` to include hidden.
    pub filetype: u8,
    pub part: usize,
}

/// Private state of a FAT-backed file buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FatFileState {
    pub part: usize,
    pub file: FileId,
    /// Bytes to skip at the start of the backing file (REL record length
    /// prefix).
    pub headersize: u8,
}

/// Private state of an image-backed file buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct D64FileState {
    pub part: usize,
    /// Current sector of the chain.
    pub track: u8,
    pub sector: u8,
    /// Blocks written so far (write channels).
    pub blocks: u16,
    /// Directory entry coordinates for the final update on close.
    pub dir_track: u8,
    pub dir_sector: u8,
    pub dir_entry: u8,
}

/// What a buffer is currently bound to.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum BufferKind {
    /// Unbound.
    #[default]
    None,
    /// `#` direct-access channel: reads and writes go straight to `data`.
    Raw,
    /// Directory listing generator.
    Dir(DirState),
    /// FAT-backed file.
    FatFile(FatFileState),
    /// File inside a mounted disk image.
    D64File(D64FileState),
}

/// One channel buffer.
#[derive(Debug, Clone)]
pub struct Buffer {
    pub data: [u8; 256],
    /// Index of the last valid byte.
    pub last_used: u8,
    /// Next byte to read or write.
    pub position: u8,
    /// Secondary address this buffer is bound to.
    pub secondary: u8,
    pub allocated: bool,
    /// Sticky buffers survive per-command cleanups.
    pub sticky: bool,
    /// Opened for reading.
    pub read: bool,
    /// Opened for writing.
    pub write: bool,
    /// Unsaved data in the window.
    pub dirty: bool,
    /// Window must be flushed before more data is accepted.
    pub must_flush: bool,
    /// The byte at `last_used` is the final byte of the transfer.
    pub send_eoi: bool,
    /// Record length for REL files, 0 otherwise.
    pub recordlen: u8,
    /// File offset of the current window (seek/REL bookkeeping).
    pub fptr: u32,
    pub kind: BufferKind,
}

impl Default for Buffer {
    fn default() -> Self {
        Self {
            data: [0; 256],
            last_used: 0,
            position: 0,
            secondary: 0,
            allocated: false,
            sticky: false,
            read: false,
            write: false,
            dirty: false,
            must_flush: false,
            send_eoi: false,
            recordlen: 0,
            fptr: 0,
            kind: BufferKind::None,
        }
    }
}

impl Buffer {
    /// Reset everything except the data area, as buffer allocation does.
    fn reset(&mut self) {
        let data = self.data;
        *self = Self::default();
        self.data = data;
    }
}

impl<F: FileStore> Drive<F> {
    /// Allocate a user buffer.
    ///
    /// Returns the pool index, or `None` with error 70 set if the pool is
    /// exhausted. Turns the busy LED on.
    pub fn alloc_buffer(&mut self) -> Option<usize> {
        for i in 0..BUFFER_COUNT {
            if !self.bufs[i].allocated {
                self.bufs[i].reset();
                self.bufs[i].allocated = true;
                self.active_buffers += 1;
                self.ui.busy_led(true);
                return Some(i);
            }
        }
        self.set_error(errors::NO_CHANNEL);
        None
    }

    /// Release a buffer. The status channel is never freed.
    pub fn free_buffer(&mut self, idx: usize) {
        if idx >= BUFFER_COUNT || !self.bufs[idx].allocated {
            return;
        }
        self.bufs[idx].allocated = false;
        self.bufs[idx].kind = BufferKind::None;

        if self.bufs[idx].write {
            self.active_buffers -= 16;
        }
        if self.active_buffers & 0xf0 == 0 {
            self.ui.dirty_led(false);
        }
        self.active_buffers -= 1;
        if self.active_buffers == 0 {
            self.ui.busy_led(false);
        }
    }

    /// Find the buffer bound to a secondary address.
    #[must_use]
    pub fn find_buffer(&self, secondary: u8) -> Option<usize> {
        (0..=BUFFER_COUNT)
            .find(|&i| self.bufs[i].allocated && self.bufs[i].secondary == secondary)
    }

    /// Mark a buffer as a write channel; lights the dirty LED.
    pub fn mark_write_buffer(&mut self, idx: usize) {
        self.bufs[idx].write = true;
        self.active_buffers += 16;
        self.ui.dirty_led(true);
    }

    /// Flag unsaved data in a write buffer.
    pub fn mark_buffer_dirty(&mut self, idx: usize) {
        self.bufs[idx].dirty = true;
    }

    /// Clear the unsaved-data flag after a flush.
    pub fn mark_buffer_clean(&mut self, idx: usize) {
        self.bufs[idx].dirty = false;
    }

    /// Free all user buffers, optionally running their cleanup first.
    ///
    /// Returns `true` if any cleanup reported an error.
    pub fn free_user_buffers(&mut self, run_cleanup: bool) -> bool {
        let mut failed = false;
        for i in 0..BUFFER_COUNT {
            if self.bufs[i].allocated {
                if run_cleanup && self.cleanup(i).is_err() {
                    failed = true;
                }
                self.free_buffer(i);
            }
        }
        failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drive::tests::test_drive;

    #[test]
    fn pool_exhaustion_sets_no_channel() {
        let mut drive = test_drive();
        for _ in 0..BUFFER_COUNT {
            assert!(drive.alloc_buffer().is_some());
        }
        assert!(drive.alloc_buffer().is_none());
        assert_eq!(drive.current_error, errors::NO_CHANNEL);
    }

    #[test]
    fn find_by_secondary() {
        let mut drive = test_drive();
        let a = drive.alloc_buffer().expect("alloc");
        drive.bufs[a].secondary = 4;
        assert_eq!(drive.find_buffer(4), Some(a));
        assert_eq!(drive.find_buffer(5), None);
        // The status channel is always reachable
        assert_eq!(drive.find_buffer(15), Some(ERROR_CHANNEL));
    }

    #[test]
    fn only_one_buffer_per_secondary_after_free() {
        let mut drive = test_drive();
        let a = drive.alloc_buffer().expect("alloc");
        drive.bufs[a].secondary = 2;
        drive.free_buffer(a);
        assert_eq!(drive.find_buffer(2), None);
        let b = drive.alloc_buffer().expect("realloc");
        assert_eq!(a, b);
    }

    #[test]
    fn alloc_resets_state() {
        let mut drive = test_drive();
        let a = drive.alloc_buffer().expect("alloc");
        drive.bufs[a].position = 99;
        drive.bufs[a].send_eoi = true;
        drive.free_buffer(a);
        let b = drive.alloc_buffer().expect("alloc");
        assert_eq!(a, b);
        assert_eq!(drive.bufs[b].position, 0);
        assert!(!drive.bufs[b].send_eoi);
    }

    #[test]
    fn error_channel_not_freeable() {
        let mut drive = test_drive();
        drive.free_buffer(ERROR_CHANNEL);
        assert!(drive.bufs[ERROR_CHANNEL].allocated);
    }

    #[test]
    fn write_buffer_count_tracks_dirty_led() {
        let mut drive = test_drive();
        let a = drive.alloc_buffer().expect("alloc");
        drive.mark_write_buffer(a);
        assert_eq!(drive.active_buffers & 0xf0, 16);
        drive.free_buffer(a);
        assert_eq!(drive.active_buffers, 0);
    }
}
