//! D64/D71/D81 disk image layout.
//!
//! Pure format knowledge, no I/O: image-type detection by file size,
//! per-type geometry, track/sector to byte-offset math, BAM window
//! placement, and the directory entry field offsets.
//!
//! Geometry summary:
//!
//! | Type | Tracks | Sectors/track | BAM | Dir | Size |
//! |------|--------|---------------|-----|-----|------|
//! | D64  | 35     | 21/19/18/17 by zone | 18/0 | 18/1 | 174,848 |
//! | D71  | 70     | as D64, mirrored    | 18/0 + 53/0 | 18/1 | 349,696 |
//! | D81  | 80     | 40                  | 40/1 + 40/2 | 40/3 | 819,200 |
//!
//! D64 and D71 images may carry a trailing error-info block (one byte per
//! sector), growing the file to 175,531 / 351,062 bytes.

/// Bytes per sector in all supported image types.
pub const SECTOR_SIZE: usize = 256;

/// Plain D64 size: 683 sectors.
pub const D64_SIZE: usize = 174_848;
/// D64 with appended error-info block.
pub const D64_SIZE_WITH_ERRORS: usize = 175_531;
/// Plain D71 size: 1366 sectors.
pub const D71_SIZE: usize = 349_696;
/// D71 with appended error-info block.
pub const D71_SIZE_WITH_ERRORS: usize = 351_062;
/// D81 size: 3200 sectors.
pub const D81_SIZE: usize = 819_200;

/// Track holding the second (bitfield-only) BAM of a D71.
pub const D71_BAM2_TRACK: u8 = 53;

/// Offset of the track 36-70 free counts within the D71 BAM at 18/0.
const D71_COUNTER2_OFFSET: usize = 0xdd;

/// Offsets within one 32-byte directory entry (link bytes included).
pub mod entry {
    /// Chain link to the next directory sector (first entry only).
    pub const OFS_LINK_TRACK: usize = 0;
    pub const OFS_LINK_SECTOR: usize = 1;
    /// File type and flag bits.
    pub const OFS_FILE_TYPE: usize = 2;
    /// First track of the file's sector chain.
    pub const OFS_TRACK: usize = 3;
    /// First sector of the file's sector chain.
    pub const OFS_SECTOR: usize = 4;
    /// 16-byte 0xA0-padded file name.
    pub const OFS_NAME: usize = 5;
    pub const OFS_SIZE_LOW: usize = 0x1e;
    pub const OFS_SIZE_HIGH: usize = 0x1f;

    /// Entries per directory sector.
    pub const PER_SECTOR: usize = 8;
    /// Size of one entry.
    pub const SIZE: usize = 32;
}

/// Supported image types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    /// 1541 (35 tracks).
    D41,
    /// 1571 (70 tracks).
    D71,
    /// 1581 (80 tracks, 40 sectors each).
    D81,
}

/// Format parameters that differ between the image types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Params {
    pub dir_track: u8,
    pub dir_start_sector: u8,
    pub last_track: u8,
    /// Offset of the disk name within the header sector.
    pub label_offset: usize,
    /// Offset of the disk id within the header sector.
    pub id_offset: usize,
    pub file_interleave: u8,
    pub dir_interleave: u8,
}

const D41_PARAMS: Params = Params {
    dir_track: 18,
    dir_start_sector: 1,
    last_track: 35,
    label_offset: 0x90,
    id_offset: 0xa2,
    file_interleave: 10,
    dir_interleave: 3,
};

const D71_PARAMS: Params = Params {
    dir_track: 18,
    dir_start_sector: 1,
    last_track: 70,
    label_offset: 0x90,
    id_offset: 0xa2,
    file_interleave: 6,
    dir_interleave: 3,
};

const D81_PARAMS: Params = Params {
    dir_track: 40,
    dir_start_sector: 3,
    last_track: 80,
    label_offset: 0x04,
    id_offset: 0x16,
    file_interleave: 1,
    dir_interleave: 1,
};

/// Which half of a BAM entry a caller wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BamData {
    /// The per-sector allocation bitfield (1 = free).
    Bitfield,
    /// The per-track free sector count.
    FreeCount,
}

/// Location of one track's BAM data within the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BamPos {
    pub track: u8,
    pub sector: u8,
    /// Byte offset within that sector.
    pub offset: usize,
}

impl ImageKind {
    /// Detect the image type from the file size.
    ///
    /// Returns the kind and whether the image carries an error-info block.
    #[must_use]
    pub fn from_size(size: u64) -> Option<(Self, bool)> {
        match size {
            x if x == D64_SIZE as u64 => Some((Self::D41, false)),
            x if x == D64_SIZE_WITH_ERRORS as u64 => Some((Self::D41, true)),
            x if x == D71_SIZE as u64 => Some((Self::D71, false)),
            x if x == D71_SIZE_WITH_ERRORS as u64 => Some((Self::D71, true)),
            x if x == D81_SIZE as u64 => Some((Self::D81, false)),
            _ => None,
        }
    }

    /// Format parameters of this image type.
    #[must_use]
    pub fn params(self) -> &'static Params {
        match self {
            Self::D41 => &D41_PARAMS,
            Self::D71 => &D71_PARAMS,
            Self::D81 => &D81_PARAMS,
        }
    }

    /// Number of sectors on the given track.
    ///
    /// Invalid track numbers return invalid results, matching drive ROMs.
    #[must_use]
    pub fn sectors_per_track(self, track: u8) -> u8 {
        match self {
            Self::D41 | Self::D71 => {
                let track = if track > 35 { track - 35 } else { track };
                if track < 18 {
                    21
                } else if track < 25 {
                    19
                } else if track < 31 {
                    18
                } else {
                    17
                }
            }
            Self::D81 => 40,
        }
    }

    /// Total data sectors in the image.
    #[must_use]
    pub fn total_sectors(self) -> u16 {
        match self {
            Self::D41 => 683,
            Self::D71 => 1366,
            Self::D81 => 3200,
        }
    }

    /// Linear sector number of a track/sector pair.
    #[must_use]
    pub fn sector_lba(self, track: u8, sector: u8) -> u16 {
        let mut track = u16::from(track) - 1;
        let sector = u16::from(sector);
        match self {
            Self::D41 | Self::D71 => {
                let mut offset = 0;
                if track >= 35 {
                    offset = 683;
                    track -= 35;
                }
                offset
                    + sector
                    + if track < 17 {
                        track * 21
                    } else if track < 24 {
                        17 * 21 + (track - 17) * 19
                    } else if track < 30 {
                        17 * 21 + 7 * 19 + (track - 24) * 18
                    } else {
                        17 * 21 + 7 * 19 + 6 * 18 + (track - 30) * 17
                    }
            }
            Self::D81 => track * 40 + sector,
        }
    }

    /// Byte offset of a sector within the image file.
    #[must_use]
    pub fn sector_offset(self, track: u8, sector: u8) -> u64 {
        u64::from(self.sector_lba(track, sector)) * SECTOR_SIZE as u64
    }

    /// Whether a track/sector pair lies within the image.
    #[must_use]
    pub fn valid_ts(self, track: u8, sector: u8) -> bool {
        track >= 1 && track <= self.params().last_track && sector < self.sectors_per_track(track)
    }

    /// Byte offset of the error-info block, if this type can carry one.
    #[must_use]
    pub fn error_info_offset(self) -> Option<u64> {
        match self {
            Self::D41 => Some(D64_SIZE as u64),
            Self::D71 => Some(D71_SIZE as u64),
            Self::D81 => None,
        }
    }

    /// Locate the BAM data for a track.
    ///
    /// D64 keeps 4 bytes per track (count + 3 bitfield bytes) at 18/0.
    /// D71 splits the second side: bitfields for tracks 36-70 live on
    /// 53/0 (3 bytes per track), their free counts at 18/0 offset 0xDD.
    /// D81 keeps 6 bytes per track (count + 5 bitfield bytes) in 40/1
    /// for tracks 1-40 and 40/2 for 41-80, starting at offset 0x10.
    #[must_use]
    pub fn bam_pos(self, track: u8, data: BamData) -> BamPos {
        let bitfield = usize::from(data == BamData::Bitfield);
        match self {
            Self::D41 => BamPos {
                track: 18,
                sector: 0,
                offset: 4 * usize::from(track) + bitfield,
            },
            Self::D71 => {
                if track > 35 && data == BamData::Bitfield {
                    BamPos {
                        track: D71_BAM2_TRACK,
                        sector: 0,
                        offset: 3 * usize::from(track - 36),
                    }
                } else if track > 35 {
                    BamPos {
                        track: 18,
                        sector: 0,
                        offset: usize::from(track - 36) + D71_COUNTER2_OFFSET,
                    }
                } else {
                    BamPos {
                        track: 18,
                        sector: 0,
                        offset: 4 * usize::from(track) + bitfield,
                    }
                }
            }
            Self::D81 => {
                let (sector, track) = if track > 40 { (2, track - 40) } else { (1, track) };
                BamPos {
                    track: 40,
                    sector,
                    offset: 10 + 6 * usize::from(track) + bitfield,
                }
            }
        }
    }
}

/// Translate an error-info byte into a DOS error number.
///
/// Codes 2..=11 map onto read errors 20..=29, 15 means drive not ready.
/// 1 is "no error"; unknown codes are accepted as readable.
#[must_use]
pub fn error_info_status(code: u8) -> Option<u8> {
    match code {
        2..=11 => Some(code - 2 + 20),
        15 => Some(74),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detect_by_size() {
        assert_eq!(ImageKind::from_size(174_848), Some((ImageKind::D41, false)));
        assert_eq!(ImageKind::from_size(175_531), Some((ImageKind::D41, true)));
        assert_eq!(ImageKind::from_size(349_696), Some((ImageKind::D71, false)));
        assert_eq!(ImageKind::from_size(351_062), Some((ImageKind::D71, true)));
        assert_eq!(ImageKind::from_size(819_200), Some((ImageKind::D81, false)));
        assert_eq!(ImageKind::from_size(12345), None);
    }

    #[test]
    fn zone_sector_counts() {
        let d = ImageKind::D41;
        assert_eq!(d.sectors_per_track(1), 21);
        assert_eq!(d.sectors_per_track(17), 21);
        assert_eq!(d.sectors_per_track(18), 19);
        assert_eq!(d.sectors_per_track(24), 19);
        assert_eq!(d.sectors_per_track(25), 18);
        assert_eq!(d.sectors_per_track(30), 18);
        assert_eq!(d.sectors_per_track(31), 17);
        assert_eq!(d.sectors_per_track(35), 17);
        // D71 mirrors the zones on the second side
        assert_eq!(ImageKind::D71.sectors_per_track(36), 21);
        assert_eq!(ImageKind::D71.sectors_per_track(70), 17);
        assert_eq!(ImageKind::D81.sectors_per_track(80), 40);
    }

    #[test]
    fn lba_math() {
        assert_eq!(ImageKind::D41.sector_lba(1, 0), 0);
        assert_eq!(ImageKind::D41.sector_lba(1, 20), 20);
        assert_eq!(ImageKind::D41.sector_lba(2, 0), 21);
        assert_eq!(ImageKind::D41.sector_lba(18, 0), 357);
        assert_eq!(ImageKind::D41.sector_lba(35, 16), 682);
        assert_eq!(ImageKind::D71.sector_lba(36, 0), 683);
        assert_eq!(ImageKind::D71.sector_lba(70, 16), 1365);
        assert_eq!(ImageKind::D81.sector_lba(1, 0), 0);
        assert_eq!(ImageKind::D81.sector_lba(80, 39), 3199);
    }

    #[test]
    fn offsets_cover_image_exactly() {
        assert_eq!(
            ImageKind::D41.sector_offset(35, 16) + SECTOR_SIZE as u64,
            D64_SIZE as u64
        );
        assert_eq!(
            ImageKind::D71.sector_offset(70, 16) + SECTOR_SIZE as u64,
            D71_SIZE as u64
        );
        assert_eq!(
            ImageKind::D81.sector_offset(80, 39) + SECTOR_SIZE as u64,
            D81_SIZE as u64
        );
    }

    #[test]
    fn ts_validation() {
        assert!(ImageKind::D41.valid_ts(1, 0));
        assert!(ImageKind::D41.valid_ts(35, 16));
        assert!(!ImageKind::D41.valid_ts(0, 0));
        assert!(!ImageKind::D41.valid_ts(36, 0));
        assert!(!ImageKind::D41.valid_ts(1, 21));
        assert!(!ImageKind::D41.valid_ts(31, 17));
        assert!(ImageKind::D81.valid_ts(80, 39));
        assert!(!ImageKind::D81.valid_ts(80, 40));
    }

    #[test]
    fn d41_bam_window() {
        let free = ImageKind::D41.bam_pos(1, BamData::FreeCount);
        assert_eq!((free.track, free.sector, free.offset), (18, 0, 4));
        let bits = ImageKind::D41.bam_pos(1, BamData::Bitfield);
        assert_eq!((bits.track, bits.sector, bits.offset), (18, 0, 5));
        let t35 = ImageKind::D41.bam_pos(35, BamData::FreeCount);
        assert_eq!(t35.offset, 140);
    }

    #[test]
    fn d71_second_side_bam_split() {
        let bits = ImageKind::D71.bam_pos(36, BamData::Bitfield);
        assert_eq!((bits.track, bits.sector, bits.offset), (53, 0, 0));
        let bits70 = ImageKind::D71.bam_pos(70, BamData::Bitfield);
        assert_eq!((bits70.track, bits70.sector, bits70.offset), (53, 0, 102));
        let free = ImageKind::D71.bam_pos(36, BamData::FreeCount);
        assert_eq!((free.track, free.sector, free.offset), (18, 0, 0xdd));
        // First side matches D64
        let side1 = ImageKind::D71.bam_pos(20, BamData::Bitfield);
        assert_eq!((side1.track, side1.sector, side1.offset), (18, 0, 81));
    }

    #[test]
    fn d81_bam_sector_split() {
        let t1 = ImageKind::D81.bam_pos(1, BamData::FreeCount);
        assert_eq!((t1.track, t1.sector, t1.offset), (40, 1, 0x10));
        let t40 = ImageKind::D81.bam_pos(40, BamData::Bitfield);
        assert_eq!((t40.track, t40.sector, t40.offset), (40, 1, 10 + 240 + 1));
        let t41 = ImageKind::D81.bam_pos(41, BamData::FreeCount);
        assert_eq!((t41.track, t41.sector, t41.offset), (40, 2, 0x10));
    }

    #[test]
    fn error_info_codes() {
        assert_eq!(error_info_status(1), None);
        assert_eq!(error_info_status(2), Some(20));
        assert_eq!(error_info_status(11), Some(29));
        assert_eq!(error_info_status(15), Some(74));
        assert_eq!(error_info_status(42), None);
    }
}
