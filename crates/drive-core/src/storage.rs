//! Storage boundaries: block devices and the FAT file store.
//!
//! The engine never talks to media directly. Raw sector access (the `D`
//! direct commands) goes through [`BlockDevice`]; everything else goes
//! through [`FileStore`], which models the subset of a FAT driver the
//! drive needs: open/read/write/seek/close on files, directory
//! enumeration with a cursor owned by the caller, and the usual
//! mkdir/unlink/rename/free-space calls.

/// Identifier of a directory. The root directory is always id 0.
pub type DirId = u32;

/// Handle of an open file.
pub type FileId = u32;

/// Handle of an in-progress directory enumeration.
pub type DirHandle = u32;

/// Errors surfaced by the storage traits.
///
/// These map onto DOS status codes in the engine; the variants mirror the
/// result codes of a FAT driver rather than the DOS error table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// File or directory does not exist.
    NotFound,
    /// Target name already exists.
    Exists,
    /// Operation needs a directory but got a file (or vice versa).
    NotDirectory,
    /// Directory still has entries.
    DirNotEmpty,
    /// Medium or file is write-protected.
    WriteProtected,
    /// No space left on the medium.
    NoSpace,
    /// Handle is stale or invalid.
    InvalidHandle,
    /// Low-level I/O failure.
    Io,
}

/// Open mode for [`FileStore::open`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    /// Create or truncate.
    Write,
    /// Open existing, position at end.
    Append,
    /// Read and write an existing file (used for mounted images).
    ReadWrite,
}

/// Metadata of one directory entry as the FAT driver reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FatEntry {
    pub name: String,
    pub size: u64,
    pub is_dir: bool,
    pub read_only: bool,
}

/// Media presence as seen by the storage backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaState {
    Ok,
    /// Medium was exchanged since the last check.
    Changed,
    /// No medium present or unreadable.
    Missing,
}

/// The FAT filesystem boundary.
///
/// Name lookups are case-insensitive, matching FAT semantics.
pub trait FileStore {
    fn open(&mut self, dir: DirId, name: &str, mode: OpenMode) -> Result<FileId, FsError>;
    fn read(&mut self, file: FileId, buf: &mut [u8]) -> Result<usize, FsError>;
    fn write(&mut self, file: FileId, buf: &[u8]) -> Result<usize, FsError>;
    fn seek(&mut self, file: FileId, pos: u64) -> Result<(), FsError>;
    fn tell(&mut self, file: FileId) -> Result<u64, FsError>;
    fn size(&mut self, file: FileId) -> Result<u64, FsError>;
    fn close(&mut self, file: FileId) -> Result<(), FsError>;

    /// Flush pending writes of one file to the medium.
    fn sync(&mut self, _file: FileId) -> Result<(), FsError> {
        Ok(())
    }

    /// Begin enumerating a directory.
    fn open_dir(&mut self, dir: DirId) -> Result<DirHandle, FsError>;

    /// Next entry of an enumeration, or `None` at the end.
    fn read_dir(&mut self, handle: DirHandle) -> Result<Option<FatEntry>, FsError>;

    /// Look up a single name.
    fn stat(&mut self, dir: DirId, name: &str) -> Result<FatEntry, FsError>;

    /// Resolve a subdirectory name to its id.
    fn subdir(&mut self, dir: DirId, name: &str) -> Result<DirId, FsError>;

    /// Parent of a directory; the root is its own parent.
    fn parent(&mut self, dir: DirId) -> Result<DirId, FsError>;

    fn mkdir(&mut self, dir: DirId, name: &str) -> Result<(), FsError>;
    fn rmdir(&mut self, dir: DirId, name: &str) -> Result<(), FsError>;
    fn remove(&mut self, dir: DirId, name: &str) -> Result<(), FsError>;
    fn rename(&mut self, dir: DirId, old: &str, new: &str) -> Result<(), FsError>;

    /// Free space on the medium in bytes.
    fn free_space(&mut self) -> Result<u64, FsError>;

    /// Volume label, empty string if none.
    fn volume_label(&mut self) -> Result<String, FsError>;

    /// Name of a directory (empty string for the root).
    fn dir_name(&mut self, dir: DirId) -> Result<String, FsError>;

    /// Whether the volume is FAT32 (free-space counting is slow there).
    fn is_fat32(&mut self) -> bool {
        false
    }

    /// Poll for media changes. Clears the `Changed` state.
    fn media_state(&mut self) -> MediaState {
        MediaState::Ok
    }

    /// Re-read filesystem structures after a media change.
    fn remount(&mut self) -> Result<(), FsError> {
        Ok(())
    }
}

/// Errors from the raw block device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevError {
    NotReady,
    WriteProtected,
    Failed,
}

/// Raw 512-byte-sector access for the `D` direct commands.
pub trait BlockDevice {
    fn read_sector(&mut self, lba: u32, buf: &mut [u8; 512]) -> Result<(), DevError>;
    fn write_sector(&mut self, lba: u32, buf: &[u8; 512]) -> Result<(), DevError>;
    fn initialize(&mut self) -> Result<(), DevError>;

    /// Fill `buf` with the device information page.
    fn info(&mut self, page: u8, buf: &mut [u8; 256]) -> Result<(), DevError>;
}
