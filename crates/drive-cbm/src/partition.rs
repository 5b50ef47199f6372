//! Mounted storage units.
//!
//! Each partition is one FAT volume, optionally overlaid with a mounted
//! disk image or M2I index. The mount selects which file-operations
//! backend handles the partition (see `fileops`).

use drive_core::{DirId, FileId, FileStore};
use format_d64::ImageKind;

/// What currently answers file operations on a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mount {
    /// Plain FAT access.
    Fat,
    /// A D64/D71/D81 image file.
    D64 {
        /// Open handle of the image file.
        file: FileId,
        kind: ImageKind,
        /// Image carries a trailing error-info block.
        error_info: bool,
        writable: bool,
    },
    /// An M2I index file.
    M2i { file: FileId, writable: bool },
}

/// One mounted storage unit.
pub struct Partition<F> {
    /// The backing FAT volume.
    pub fs: F,
    pub mount: Mount,
    /// Current directory for FAT access.
    pub current_dir: DirId,
    /// Directory that contains the mounted image file, so unmounting
    /// drops back to the right place.
    pub image_dir: DirId,
}

impl<F: FileStore> Partition<F> {
    /// A freshly mounted FAT partition rooted at the volume root.
    pub fn new(fs: F) -> Self {
        Self {
            fs,
            mount: Mount::Fat,
            current_dir: 0,
            image_dir: 0,
        }
    }

    /// Whether an image or index is mounted.
    #[must_use]
    pub fn has_image(&self) -> bool {
        self.mount != Mount::Fat
    }
}
