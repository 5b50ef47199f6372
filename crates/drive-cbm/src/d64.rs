//! File operations inside D64/D71/D81 images.
//!
//! Files are chains of 256-byte sectors; bytes 0/1 of each sector link
//! to the next track/sector (track 0 ends the chain, the sector byte
//! then holds the index of the last used byte). The BAM tracks free
//! sectors per track as a count plus an allocation bitfield; one sticky
//! window caches the BAM sector currently being edited. Layout math
//! lives in the `format-d64` crate.

use drive_core::FileStore;
use format_d64::{BamData, D71_BAM2_TRACK, ImageKind, entry, error_info_status};

use crate::buffer::{BufferKind, D64FileState};
use crate::dirent::{
    CbmDirent, DirCursor, EntryPos, FLAG_SPLAT, NAME_LENGTH, TYPE_DIR, TYPE_MASK, substitute,
};
use crate::drive::Drive;
use crate::partition::Mount;
use crate::status::errors;

/// Largest sector count of any supported track.
const MAX_SECTORS_PER_TRACK: usize = 21;

/// Cached BAM window: one BAM sector plus its identity.
pub(crate) struct BamCache {
    pub data: [u8; 256],
    /// Partition the cached sector belongs to; `usize::MAX` = empty.
    pub part: usize,
    pub track: u8,
    pub sector: u8,
    pub dirty: bool,
    /// Number of mounted images sharing the cache.
    pub refcount: u8,
}

impl BamCache {
    pub(crate) fn new() -> Self {
        Self {
            data: [0; 256],
            part: usize::MAX,
            track: 0,
            sector: 0,
            dirty: false,
            refcount: 0,
        }
    }

    /// Drop the cached contents without writing them back.
    pub(crate) fn invalidate(&mut self) {
        self.part = usize::MAX;
        self.dirty = false;
    }
}

/// Cached error-info bytes for one track of an image with an appended
/// error block.
pub(crate) struct ErrorCache {
    pub part: usize,
    pub track: u8,
    pub codes: [u8; MAX_SECTORS_PER_TRACK],
}

impl ErrorCache {
    pub(crate) fn new() -> Self {
        Self {
            part: usize::MAX,
            track: 0,
            codes: [1; MAX_SECTORS_PER_TRACK],
        }
    }

    pub(crate) fn invalidate(&mut self) {
        self.part = usize::MAX;
    }
}

impl<F: FileStore> Drive<F> {
    /// Image kind and error-info flag of a mounted partition.
    fn image_kind(&self, part: usize) -> (ImageKind, bool) {
        match self.parts[part].mount {
            Mount::D64 {
                kind, error_info, ..
            } => (kind, error_info),
            // Callers only reach this with a D64 mount
            _ => (ImageKind::D41, false),
        }
    }

    fn sector_offset(&self, part: usize, track: u8, sector: u8) -> u64 {
        let (kind, _) = self.image_kind(part);
        kind.sector_offset(track, sector)
    }

    fn sectors_per_track(&self, part: usize, track: u8) -> u8 {
        let (kind, _) = self.image_kind(part);
        kind.sectors_per_track(track)
    }

    fn last_track(&self, part: usize) -> u8 {
        let (kind, _) = self.image_kind(part);
        kind.params().last_track
    }

    fn dir_track(&self, part: usize) -> u8 {
        let (kind, _) = self.image_kind(part);
        kind.params().dir_track
    }

    // ----- checked sector access -----

    /// Read part of a sector after validating the track/sector pair and
    /// the error-info block.
    pub(crate) fn checked_read(
        &mut self,
        part: usize,
        track: u8,
        sector: u8,
        out: &mut [u8],
        error: u8,
    ) -> Result<(), ()> {
        let (kind, has_errorinfo) = self.image_kind(part);
        if !kind.valid_ts(track, sector) {
            self.set_error_ts(error, track, sector);
            return Err(());
        }

        if has_errorinfo {
            if self.error_cache.part != part || self.error_cache.track != track {
                // Load the error bytes covering this track
                self.error_cache.codes = [1; MAX_SECTORS_PER_TRACK];
                let base = kind.error_info_offset().unwrap_or(0);
                let offset = base + u64::from(kind.sector_lba(track, 0));
                let count = usize::from(kind.sectors_per_track(track));
                let mut codes = [1u8; MAX_SECTORS_PER_TRACK];
                if self.image_read(part, offset, &mut codes[..count])? < count {
                    self.set_error_ts(error, track, sector);
                    return Err(());
                }
                self.error_cache.codes = codes;
                self.error_cache.part = part;
                self.error_cache.track = track;
            }

            if let Some(code) = error_info_status(self.error_cache.codes[usize::from(sector)]) {
                if code == errors::DRIVE_NOT_READY {
                    self.set_error(code);
                } else {
                    self.set_error_ts(code, track, sector);
                }
                return Err(());
            }
        }

        let offset = kind.sector_offset(track, sector);
        let want = out.len();
        if self.image_read(part, offset, out)? < want {
            self.set_error_ts(error, track, sector);
            return Err(());
        }
        Ok(())
    }

    // ----- BAM window -----

    /// Write the cached BAM sector back if it has unsaved changes.
    pub(crate) fn bam_flush(&mut self) -> Result<(), ()> {
        if self.bam.dirty && self.bam.part < self.parts.len() {
            let part = self.bam.part;
            let offset = self.sector_offset(part, self.bam.track, self.bam.sector);
            let data = self.bam.data;
            self.bam.dirty = false;
            self.image_write(part, offset, &data, true)?;
        }
        Ok(())
    }

    /// Point the BAM window at the sector covering `track` and return
    /// the offset of the requested data within it.
    ///
    /// Flushes the previously cached sector when switching.
    fn move_bam_window(&mut self, part: usize, track: u8, data: BamData) -> Result<usize, ()> {
        let (kind, _) = self.image_kind(part);
        let pos = kind.bam_pos(track, data);

        if self.bam.part != part || self.bam.track != pos.track || self.bam.sector != pos.sector {
            self.bam_flush()?;

            let offset = kind.sector_offset(pos.track, pos.sector);
            let mut data = [0u8; 256];
            if self.image_read(part, offset, &mut data)? < 256 {
                self.set_error_ts(errors::ILLEGAL_TS_LINK, pos.track, pos.sector);
                return Err(());
            }
            self.bam.data = data;
            self.bam.part = part;
            self.bam.track = pos.track;
            self.bam.sector = pos.sector;
        }

        Ok(pos.offset)
    }

    /// Whether a sector is marked free in the BAM.
    pub(crate) fn is_free(&mut self, part: usize, track: u8, sector: u8) -> Result<bool, ()> {
        let off = self.move_bam_window(part, track, BamData::Bitfield)?;
        Ok(self.bam.data[off + usize::from(sector >> 3)] & (1 << (sector & 7)) != 0)
    }

    /// Free sectors remaining on a track, 0 for invalid tracks.
    pub(crate) fn sectors_free(&mut self, part: usize, track: u8) -> u8 {
        if track < 1 || track > self.last_track(part) {
            return 0;
        }
        match self.move_bam_window(part, track, BamData::FreeCount) {
            Ok(off) => self.bam.data[off],
            Err(()) => 0,
        }
    }

    /// Mark a sector as used and drop the track's free count.
    pub(crate) fn allocate_sector(&mut self, part: usize, track: u8, sector: u8) -> Result<(), ()> {
        if self.is_free(part, track, sector)? {
            let off = self.move_bam_window(part, track, BamData::Bitfield)?;
            self.bam.data[off + usize::from(sector >> 3)] &= !(1 << (sector & 7));
            self.bam.dirty = true;

            let off = self.move_bam_window(part, track, BamData::FreeCount)?;
            if self.bam.data[off] > 0 {
                self.bam.data[off] -= 1;
                self.bam.dirty = true;
            }
        }
        Ok(())
    }

    /// Mark a sector as free again. The free count never exceeds the
    /// track's sector count.
    pub(crate) fn free_sector(&mut self, part: usize, track: u8, sector: u8) -> Result<(), ()> {
        if !self.is_free(part, track, sector)? {
            let off = self.move_bam_window(part, track, BamData::Bitfield)?;
            self.bam.data[off + usize::from(sector >> 3)] |= 1 << (sector & 7);
            self.bam.dirty = true;

            let spt = self.sectors_per_track(part, track);
            let off = self.move_bam_window(part, track, BamData::FreeCount)?;
            if self.bam.data[off] < spt {
                self.bam.data[off] += 1;
                self.bam.dirty = true;
            }
        }
        Ok(())
    }

    /// First sector for a new file: search tracks at alternating
    /// distances from the directory track, then the first free sector
    /// on the chosen track.
    pub(crate) fn get_first_sector(&mut self, part: usize) -> Result<(u8, u8), ()> {
        let dir_track = i16::from(self.dir_track(part));
        let last_track = i16::from(self.last_track(part));

        let mut distance: i16 = 1;
        while distance < last_track {
            let track = dir_track - distance;
            if (1..=last_track).contains(&track)
                && self.sectors_free(part, track as u8) > 0
            {
                let track = track as u8;
                for sector in 0..self.sectors_per_track(part, track) {
                    if self.is_free(part, track, sector)? {
                        return Ok((track, sector));
                    }
                }
                break;
            }
            distance = -distance;
            if distance > 0 {
                distance += 1;
            }
        }

        if self.current_error == errors::OK {
            self.set_error(errors::DISK_FULL);
        }
        Err(())
    }

    /// Next sector for a growing file, at interleave distance from the
    /// current one; moves to adjacent tracks when the current one fills
    /// up. Track 53 of a D71 is reserved for the second BAM.
    pub(crate) fn get_next_sector(
        &mut self,
        part: usize,
        track: &mut u8,
        sector: &mut u8,
    ) -> Result<(), ()> {
        let (kind, _) = self.image_kind(part);
        let params = kind.params();

        let interleave = if *track == params.dir_track {
            if self.sectors_free(part, params.dir_track) == 0 {
                if self.current_error == errors::OK {
                    self.set_error(errors::DISK_FULL);
                }
                return Err(());
            }
            params.dir_interleave
        } else {
            params.file_interleave
        };

        let mut tries = 0;
        while tries < 3 && self.sectors_free(part, *track) == 0 {
            if *track < params.dir_track {
                *track -= 1;
            } else {
                *track += 1;
                if kind == ImageKind::D71 && *track == D71_BAM2_TRACK {
                    *track += 1;
                }
            }

            if *track < 1 {
                *track = params.dir_track + 1;
                *sector = 0;
                tries += 1;
            }
            if *track > params.last_track {
                *track = params.dir_track - 1;
                *sector = 0;
                tries += 1;
            }
        }
        if tries == 3 {
            if self.current_error == errors::OK {
                self.set_error(errors::DISK_FULL);
            }
            return Err(());
        }

        let spt = self.sectors_per_track(part, *track);
        *sector += interleave;
        if *sector >= spt {
            *sector -= spt;
            if *sector != 0 {
                *sector -= 1;
            }
        }

        for _ in 0..99 {
            if self.is_free(part, *track, *sector).unwrap_or(false) {
                return Ok(());
            }
            *sector += 1;
            if *sector >= spt {
                *sector = 0;
            }
        }

        if self.current_error == errors::OK {
            self.set_error(errors::DISK_FULL);
        }
        Err(())
    }

    // ----- directory walking -----

    pub(crate) fn d64_opendir(&mut self, part: usize) -> DirCursor {
        let (kind, _) = self.image_kind(part);
        DirCursor::D64 {
            track: kind.params().dir_track,
            sector: kind.params().dir_start_sector,
            entry: 0,
        }
    }

    /// Raw next directory entry, deleted slots included.
    ///
    /// Returns the 32-byte entry and its coordinates.
    fn next_dir_entry(
        &mut self,
        part: usize,
        cursor: &mut DirCursor,
    ) -> Result<Option<([u8; entry::SIZE], EntryPos)>, ()> {
        let DirCursor::D64 {
            track,
            sector,
            entry: index,
        } = cursor
        else {
            return Err(());
        };

        if usize::from(*index) == entry::PER_SECTOR {
            // Follow the link pointer to the next directory sector
            let mut link = [0u8; 2];
            let (t, s) = (*track, *sector);
            self.checked_read(part, t, s, &mut link, errors::ILLEGAL_TS_LINK)?;
            if link[0] == 0 {
                return Ok(None);
            }
            *track = link[0];
            *sector = link[1];
            *index = 0;
        }

        let (t, s, i) = (*track, *sector, *index);
        let (kind, _) = self.image_kind(part);
        if !kind.valid_ts(t, s) {
            self.set_error_ts(errors::ILLEGAL_TS_LINK, t, s);
            return Err(());
        }

        let mut raw = [0u8; entry::SIZE];
        let offset = kind.sector_offset(t, s) + (usize::from(i) * entry::SIZE) as u64;
        if self.image_read(part, offset, &mut raw)? < entry::SIZE {
            self.set_error_ts(errors::ILLEGAL_TS_LINK, t, s);
            return Err(());
        }

        *index += 1;
        Ok(Some((
            raw,
            EntryPos::D64 {
                track: t,
                sector: s,
                entry: i,
            },
        )))
    }

    pub(crate) fn d64_readdir(
        &mut self,
        part: usize,
        cursor: &mut DirCursor,
    ) -> Result<Option<CbmDirent>, ()> {
        loop {
            let Some((raw, pos)) = self.next_dir_entry(part, cursor)? else {
                return Ok(None);
            };
            if raw[entry::OFS_FILE_TYPE] == 0 {
                // Deleted slot
                continue;
            }

            let mut dent = CbmDirent {
                typeflags: raw[entry::OFS_FILE_TYPE] ^ FLAG_SPLAT,
                blocks: u16::from(raw[entry::OFS_SIZE_LOW])
                    + 256 * u16::from(raw[entry::OFS_SIZE_HIGH]),
                remainder: 0xff,
                track: raw[entry::OFS_TRACK],
                sector: raw[entry::OFS_SECTOR],
                pos,
                ..CbmDirent::default()
            };
            if dent.file_type() >= TYPE_DIR {
                // Invalid types (including DIR) show as DEL
                dent.typeflags &= !TYPE_MASK;
            }
            let mut name = [0u8; NAME_LENGTH];
            name.copy_from_slice(&raw[entry::OFS_NAME..entry::OFS_NAME + NAME_LENGTH]);
            substitute(&mut name, 0xa0, 0);
            dent.name = name;

            return Ok(Some(dent));
        }
    }

    pub(crate) fn d64_getlabel(&mut self, part: usize, label: &mut [u8; 16]) -> Result<(), ()> {
        let (kind, _) = self.image_kind(part);
        let offset =
            kind.sector_offset(kind.params().dir_track, 0) + kind.params().label_offset as u64;
        if self.image_read(part, offset, label)? < 16 {
            return Err(());
        }
        substitute(label, 0xa0, 0x20);
        Ok(())
    }

    pub(crate) fn d64_getid(&mut self, part: usize, id: &mut [u8; 5]) -> Result<(), ()> {
        let (kind, _) = self.image_kind(part);
        let offset =
            kind.sector_offset(kind.params().dir_track, 0) + kind.params().id_offset as u64;
        if self.image_read(part, offset, id)? < 5 {
            return Err(());
        }
        substitute(id, 0xa0, 0x20);
        Ok(())
    }

    /// Free blocks, skipping the BAM/directory tracks like the drive
    /// ROMs do.
    pub(crate) fn d64_freeblocks(&mut self, part: usize) -> u16 {
        let (kind, _) = self.image_kind(part);
        let mut blocks = 0u16;
        for track in 1..=kind.params().last_track {
            let reserved = match kind {
                ImageKind::D41 | ImageKind::D71 => track == 18 || track == D71_BAM2_TRACK,
                ImageKind::D81 => track == 40,
            };
            if !reserved {
                blocks += u16::from(self.sectors_free(part, track));
            }
        }
        blocks
    }

    // ----- refill/cleanup callbacks -----

    /// Refill callback for reading: follow the chain link in bytes 0/1.
    pub(crate) fn d64_read(&mut self, idx: usize) -> Result<(), ()> {
        let BufferKind::D64File(st) = &self.bufs[idx].kind else {
            return Err(());
        };
        let mut st = *st;

        // Remember the sector we are about to read, used for append
        let track = self.bufs[idx].data[0];
        let sector = self.bufs[idx].data[1];
        st.track = track;
        st.sector = sector;
        self.bufs[idx].kind = BufferKind::D64File(st);

        let mut data = [0u8; 256];
        if self
            .checked_read(st.part, track, sector, &mut data, errors::ILLEGAL_TS_LINK)
            .is_err()
        {
            self.free_buffer(idx);
            return Err(());
        }

        let buf = &mut self.bufs[idx];
        buf.data = data;
        buf.position = 2;
        if buf.data[0] == 0 {
            // Final sector of the file
            buf.last_used = buf.data[1];
            buf.send_eoi = true;
        } else {
            buf.last_used = 255;
            buf.send_eoi = false;
        }
        Ok(())
    }

    /// Refill callback for writing: link the full sector to a freshly
    /// allocated one and store it.
    pub(crate) fn d64_write(&mut self, idx: usize) -> Result<(), ()> {
        let BufferKind::D64File(st) = &self.bufs[idx].kind else {
            return Err(());
        };
        let mut st = *st;
        let mut t = st.track;
        let mut s = st.sector;
        let mut saved_error = 0;

        st.blocks += 1;

        // Mark as last sector in case allocation fails below
        self.bufs[idx].data[0] = 0;
        self.bufs[idx].data[1] = self.bufs[idx].last_used;

        if self.get_next_sector(st.part, &mut t, &mut s).is_err() {
            t = 0;
            saved_error = self.current_error;
        } else {
            self.bufs[idx].data[0] = t;
            self.bufs[idx].data[1] = s;
            if self.allocate_sector(st.part, t, s).is_err() || self.bam_flush().is_err() {
                self.free_buffer(idx);
                return Err(());
            }
        }

        let offset = self.sector_offset(st.part, st.track, st.sector);
        let data = self.bufs[idx].data;
        if self.image_write(st.part, offset, &data, true).is_err() {
            self.free_buffer(idx);
            return Err(());
        }

        st.track = t;
        st.sector = s;
        self.bufs[idx].kind = BufferKind::D64File(st);
        self.bufs[idx].position = 2;
        self.bufs[idx].last_used = 1;
        self.bufs[idx].must_flush = false;
        self.mark_buffer_clean(idx);

        if saved_error != 0 {
            self.set_error(saved_error);
            self.free_buffer(idx);
            return Err(());
        }
        Ok(())
    }

    /// Cleanup callback for writing: store the final sector and update
    /// the directory entry with the block count.
    pub(crate) fn d64_write_cleanup(&mut self, idx: usize) -> Result<(), ()> {
        let BufferKind::D64File(st) = &self.bufs[idx].kind else {
            return Err(());
        };
        let mut st = *st;

        self.bufs[idx].data[0] = 0;
        self.bufs[idx].data[1] = self.bufs[idx].last_used;

        let (t, s) = (st.track, st.sector);
        st.blocks += 1;

        // Track 0 means an earlier write already failed
        if t == 0 {
            return Err(());
        }

        let offset = self.sector_offset(st.part, t, s);
        let data = self.bufs[idx].data;
        self.image_write(st.part, offset, &data, true)?;

        // Close the directory entry: set the closed bit and the size
        let entry_offset = self.sector_offset(st.part, st.dir_track, st.dir_sector)
            + (usize::from(st.dir_entry) * entry::SIZE) as u64;
        let mut raw = [0u8; entry::SIZE];
        if self.image_read(st.part, entry_offset, &mut raw)? < entry::SIZE {
            return Err(());
        }
        raw[entry::OFS_FILE_TYPE] |= FLAG_SPLAT;
        raw[entry::OFS_SIZE_LOW] = (st.blocks & 0xff) as u8;
        raw[entry::OFS_SIZE_HIGH] = (st.blocks >> 8) as u8;
        self.image_write(st.part, entry_offset, &raw, true)?;

        self.free_buffer(idx);
        Ok(())
    }

    // ----- open -----

    pub(crate) fn d64_open_read(&mut self, part: usize, dent: &CbmDirent, idx: usize) {
        self.bufs[idx].data[0] = dent.track;
        self.bufs[idx].data[1] = dent.sector;
        self.bufs[idx].read = true;
        self.bufs[idx].kind = BufferKind::D64File(D64FileState {
            part,
            track: dent.track,
            sector: dent.sector,
            blocks: 0,
            dir_track: 0,
            dir_sector: 0,
            dir_entry: 0,
        });
        let _ = self.d64_read(idx);
    }

    /// Open the directory chain itself as a file (`$` on secondary > 0).
    pub(crate) fn d64_raw_directory(&mut self, secondary: u8) {
        let part = self.current_part;
        let Some(idx) = self.alloc_buffer() else {
            return;
        };
        self.bufs[idx].secondary = secondary;
        let dent = CbmDirent {
            track: self.dir_track(part),
            sector: 0,
            ..CbmDirent::default()
        };
        self.d64_open_read(part, &dent, idx);
    }

    pub(crate) fn d64_open_write(
        &mut self,
        part: usize,
        dent: &CbmDirent,
        ftype: u8,
        idx: usize,
        append: bool,
    ) {
        if let Mount::D64 { writable: false, .. } = self.parts[part].mount {
            self.set_error(errors::WRITE_PROTECT);
            return;
        }

        if append {
            self.d64_open_read(part, dent, idx);
            while self.current_error == 0 && self.bufs[idx].data[0] != 0 {
                if self.d64_read(idx).is_err() {
                    return;
                }
            }
            if self.current_error != 0 {
                return;
            }

            let EntryPos::D64 {
                track: dt,
                sector: ds,
                entry: de,
            } = dent.pos
            else {
                return;
            };
            let BufferKind::D64File(st) = &self.bufs[idx].kind else {
                return;
            };
            let mut st = *st;
            st.dir_track = dt;
            st.dir_sector = ds;
            st.dir_entry = de;
            st.blocks = dent.blocks.saturating_sub(1);
            self.bufs[idx].kind = BufferKind::D64File(st);
            self.bufs[idx].read = false;
            self.bufs[idx].position = self.bufs[idx].last_used.wrapping_add(1);
            self.bufs[idx].must_flush = self.bufs[idx].position == 0;
            self.mark_write_buffer(idx);
            return;
        }

        // Find an empty directory slot
        let mut cursor = self.d64_opendir(part);
        let slot = loop {
            match self.next_dir_entry(part, &mut cursor) {
                Err(()) => return,
                Ok(Some((raw, pos))) => {
                    if raw[entry::OFS_FILE_TYPE] == 0 {
                        break pos;
                    }
                }
                Ok(None) => {
                    // Directory full: chain a new sector to it
                    let DirCursor::D64 {
                        track: last_t,
                        sector: last_s,
                        ..
                    } = cursor
                    else {
                        return;
                    };
                    let mut t = last_t;
                    let mut s = last_s;
                    if self.get_next_sector(part, &mut t, &mut s).is_err() {
                        return;
                    }

                    let link = [t, s];
                    let offset = self.sector_offset(part, last_t, last_s);
                    if self.image_write(part, offset, &link, false).is_err() {
                        return;
                    }
                    if self.allocate_sector(part, t, s).is_err() {
                        return;
                    }

                    // Fresh directory sector: link 0/0xff, all slots free
                    let mut sector_data = [0u8; 256];
                    sector_data[1] = 0xff;
                    let offset = self.sector_offset(part, t, s);
                    if self.image_write(part, offset, &sector_data, false).is_err() {
                        return;
                    }

                    break EntryPos::D64 {
                        track: t,
                        sector: s,
                        entry: 0,
                    };
                }
            }
        };

        let EntryPos::D64 {
            track: dt,
            sector: ds,
            entry: de,
        } = slot
        else {
            return;
        };

        // First data sector
        let Ok((t, s)) = self.get_first_sector(part) else {
            return;
        };
        if self.allocate_sector(part, t, s).is_err() || self.bam_flush().is_err() {
            return;
        }

        // Build and store the directory entry; the file stays marked
        // open (splat) until cleanup
        let entry_offset =
            self.sector_offset(part, dt, ds) + (usize::from(de) * entry::SIZE) as u64;
        let mut raw = [0u8; entry::SIZE];
        if self.image_read(part, entry_offset, &mut raw).is_err() {
            return;
        }
        for b in &mut raw[2..] {
            *b = 0;
        }
        raw[entry::OFS_FILE_TYPE] = ftype;
        raw[entry::OFS_TRACK] = t;
        raw[entry::OFS_SECTOR] = s;
        raw[entry::OFS_NAME..entry::OFS_NAME + NAME_LENGTH].fill(0xa0);
        let name = dent.name_bytes();
        raw[entry::OFS_NAME..entry::OFS_NAME + name.len()].copy_from_slice(name);
        if self.image_write(part, entry_offset, &raw, true).is_err() {
            return;
        }

        self.mark_write_buffer(idx);
        let buf = &mut self.bufs[idx];
        buf.position = 2;
        buf.last_used = 2;
        buf.data[2] = 13;
        buf.kind = BufferKind::D64File(D64FileState {
            part,
            track: t,
            sector: s,
            blocks: 0,
            dir_track: dt,
            dir_sector: ds,
            dir_entry: de,
        });
    }

    // ----- scratch / rename / format -----

    /// Free a file's sector chain and clear its directory entry.
    pub(crate) fn d64_delete(&mut self, part: usize, dent: &CbmDirent) -> u8 {
        let mut link = [dent.track, dent.sector];
        loop {
            if self.free_sector(part, link[0], link[1]).is_err() {
                return 255;
            }
            let (t, s) = (link[0], link[1]);
            if self
                .checked_read(part, t, s, &mut link, errors::ILLEGAL_TS_LINK)
                .is_err()
            {
                return 255;
            }
            if link[0] == 0 {
                break;
            }
        }

        let EntryPos::D64 {
            track,
            sector,
            entry: index,
        } = dent.pos
        else {
            return 255;
        };
        let offset =
            self.sector_offset(part, track, sector) + (usize::from(index) * entry::SIZE) as u64;
        let mut raw = [0u8; entry::SIZE];
        if self.image_read(part, offset, &mut raw).is_err_or_short(entry::SIZE) {
            return 255;
        }
        raw[entry::OFS_FILE_TYPE] = 0;
        if self.image_write(part, offset, &raw, true).is_err() {
            return 255;
        }

        if self.bam_flush().is_err() { 255 } else { 1 }
    }

    pub(crate) fn d64_rename(&mut self, part: usize, dent: &CbmDirent, newname: &[u8]) {
        let EntryPos::D64 {
            track,
            sector,
            entry: index,
        } = dent.pos
        else {
            return;
        };
        let offset =
            self.sector_offset(part, track, sector) + (usize::from(index) * entry::SIZE) as u64;
        let mut raw = [0u8; entry::SIZE];
        if self.image_read(part, offset, &mut raw).is_err_or_short(entry::SIZE) {
            return;
        }
        raw[entry::OFS_NAME..entry::OFS_NAME + NAME_LENGTH].fill(0xa0);
        let n = newname.len().min(NAME_LENGTH);
        raw[entry::OFS_NAME..entry::OFS_NAME + n].copy_from_slice(&newname[..n]);
        let _ = self.image_write(part, offset, &raw, true);
    }

    /// `N:` format. Only plain D64 images are supported; everything
    /// else reports 31.
    pub(crate) fn d64_format(&mut self, part: usize, name: &[u8], id: Option<&[u8]>) {
        let (kind, error_info) = self.image_kind(part);
        if kind != ImageKind::D41 || error_info {
            self.set_error(errors::SYNTAX_UNABLE);
            return;
        }
        let params = *kind.params();

        // Whatever was cached is void after this
        if self.bam_flush().is_err() {
            return;
        }
        self.bam.invalidate();

        let zero = [0u8; 256];
        let idbuf: [u8; 2] = if let Some(id) = id {
            // Full format: clear every sector
            for lba in 0..kind.total_sectors() {
                if self
                    .image_write(part, u64::from(lba) * 256, &zero, false)
                    .is_err()
                {
                    return;
                }
            }
            [
                id.first().copied().unwrap_or(b' '),
                id.get(1).copied().unwrap_or(b' '),
            ]
        } else {
            let mut old = [0u8; 2];
            let offset =
                kind.sector_offset(params.dir_track, 0) + params.id_offset as u64;
            if self.image_read(part, offset, &mut old).is_err_or_short(2) {
                return;
            }
            old
        };

        // Empty first directory sector
        let mut dirsec = [0u8; 256];
        dirsec[1] = 0xff;
        let offset = kind.sector_offset(params.dir_track, params.dir_start_sector);
        if self.image_write(part, offset, &dirsec, false).is_err() {
            return;
        }

        // Mark everything free except the BAM and first directory sector
        for t in 1..=params.last_track {
            for s in 0..kind.sectors_per_track(t) {
                if (t != 18 || s > 1) && self.free_sector(part, t, s).is_err() {
                    return;
                }
            }
        }

        // The BAM window now holds 18/0; fill in the header fields
        if self.move_bam_window(part, 1, BamData::FreeCount).is_err() {
            return;
        }
        self.bam.data[0] = params.dir_track;
        self.bam.data[1] = params.dir_start_sector;
        self.bam.data[2] = 0x41;
        self.bam.data[0x90..=0xaa].fill(0xa0);
        let n = name.len().min(16);
        self.bam.data[0x90..0x90 + n].copy_from_slice(&name[..n]);
        self.bam.data[params.id_offset] = idbuf[0];
        self.bam.data[params.id_offset + 1] = idbuf[1];
        self.bam.data[params.id_offset + 3] = b'2';
        self.bam.data[params.id_offset + 4] = b'A';
        self.bam.dirty = true;

        let _ = self.bam_flush();
    }

    // ----- raw sector channels -----

    pub(crate) fn d64_read_sector(&mut self, idx: usize, part: usize, track: u8, sector: u8) {
        let mut data = [0u8; 256];
        if self
            .checked_read(part, track, sector, &mut data, errors::ILLEGAL_TS_COMMAND)
            .is_ok()
        {
            self.bufs[idx].data = data;
        }
    }

    pub(crate) fn d64_write_sector(&mut self, idx: usize, part: usize, track: u8, sector: u8) {
        let (kind, _) = self.image_kind(part);
        if !kind.valid_ts(track, sector) {
            self.set_error_ts(errors::ILLEGAL_TS_COMMAND, track, sector);
            return;
        }
        let offset = kind.sector_offset(track, sector);
        let data = self.bufs[idx].data;
        let _ = self.image_write(part, offset, &data, true);
    }
}

/// Small helper for "read must fill the buffer" checks.
trait ReadLen {
    fn is_err_or_short(&self, want: usize) -> bool;
}

impl ReadLen for Result<usize, ()> {
    fn is_err_or_short(&self, want: usize) -> bool {
        !matches!(self, Ok(n) if *n >= want)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drive::tests::test_drive;
    use crate::fileops::Path;
    use drive_core::MemStore;

    use crate::drive::{Drive, DriveConfig};

    /// Drive with a blank, formatted D64 mounted on partition 0.
    fn d64_drive() -> Drive<MemStore> {
        let mut fs = MemStore::new("SD");
        fs.add_file(0, "DISK.D64", &vec![0u8; format_d64::D64_SIZE]);
        let mut drive = Drive::new(vec![fs], DriveConfig::default());
        let path = Path { part: 0, dir: 0 };
        drive.mount_image(path, "DISK.D64").expect("mount");
        drive.d64_format(0, b"TESTDISK", Some(b"ID"));
        assert_eq!(drive.error_code(), 0);
        drive
    }

    #[test]
    fn formatted_disk_has_664_blocks_free() {
        let mut drive = d64_drive();
        assert_eq!(drive.d64_freeblocks(0), 664);
    }

    #[test]
    fn format_writes_header() {
        let mut drive = d64_drive();
        let mut label = [0u8; 16];
        drive.d64_getlabel(0, &mut label).expect("label");
        assert_eq!(&label[..8], b"TESTDISK");
        assert_eq!(&label[8..], [0x20; 8]);
        let mut id = [0u8; 5];
        drive.d64_getid(0, &mut id).expect("id");
        assert_eq!(&id, b"ID 2A");
    }

    #[test]
    fn allocate_free_round_trip() {
        let mut drive = d64_drive();
        assert!(drive.is_free(0, 17, 0).expect("bam"));
        let before = drive.sectors_free(0, 17);

        drive.allocate_sector(0, 17, 0).expect("allocate");
        assert!(!drive.is_free(0, 17, 0).expect("bam"));
        assert_eq!(drive.sectors_free(0, 17), before - 1);

        drive.free_sector(0, 17, 0).expect("free");
        assert!(drive.is_free(0, 17, 0).expect("bam"));
        assert_eq!(drive.sectors_free(0, 17), before);
    }

    #[test]
    fn free_count_capped_at_track_size() {
        let mut drive = d64_drive();
        drive.free_sector(0, 17, 0).expect("free");
        assert_eq!(drive.sectors_free(0, 17), 21);
    }

    #[test]
    fn first_sector_lands_next_to_directory() {
        let mut drive = d64_drive();
        let (t, s) = drive.get_first_sector(0).expect("first");
        assert_eq!((t, s), (17, 0));
    }

    #[test]
    fn next_sector_applies_interleave() {
        let mut drive = d64_drive();
        let mut t = 17;
        let mut s = 0;
        drive.get_next_sector(0, &mut t, &mut s).expect("next");
        assert_eq!((t, s), (17, 10));
        drive.get_next_sector(0, &mut t, &mut s).expect("next");
        assert_eq!((t, s), (17, 20));
        // 20 + 10 = 30, wraps to 30 - 21 = 9, minus 1 = 8
        drive.get_next_sector(0, &mut t, &mut s).expect("next");
        assert_eq!((t, s), (17, 8));
    }

    #[test]
    fn write_creates_chain_and_entry() {
        let mut drive = d64_drive();
        let dent = CbmDirent::with_name(b"HELLO");
        let idx = drive.alloc_buffer().expect("buffer");
        drive.bufs[idx].secondary = 1;
        drive.d64_open_write(0, &dent, crate::dirent::TYPE_PRG, idx, false);
        assert_eq!(drive.error_code(), 0);

        for b in b"HI" {
            drive.channel_write(1, *b).expect("write");
        }
        drive.close_channel(1).expect("close");

        // Entry is findable and closed
        let path = Path { part: 0, dir: 0 };
        let found = drive.first_match(path, b"HELLO", 0).expect("match");
        assert_eq!(found.blocks, 1);
        assert_eq!(found.file_type(), crate::dirent::TYPE_PRG);
        assert_eq!(found.typeflags & FLAG_SPLAT, 0);
        assert_eq!((found.track, found.sector), (17, 0));

        // Chain terminator: track 0, last-used index
        let mut sec = [0u8; 256];
        drive.checked_read(0, 17, 0, &mut sec, 20).expect("read");
        assert_eq!(sec[0], 0);
        assert_eq!(sec[1], 3);
        assert_eq!(&sec[2..4], b"HI");

        // One sector got allocated
        assert_eq!(drive.d64_freeblocks(0), 663);
    }

    #[test]
    fn read_back_written_file() {
        let mut drive = d64_drive();
        let data: Vec<u8> = (0..600u32).map(|i| (i % 251) as u8).collect();

        let dent = CbmDirent::with_name(b"DATA");
        let idx = drive.alloc_buffer().expect("buffer");
        drive.bufs[idx].secondary = 1;
        drive.d64_open_write(0, &dent, crate::dirent::TYPE_SEQ, idx, false);
        for b in &data {
            drive.channel_write(1, *b).expect("write");
        }
        drive.close_channel(1).expect("close");
        assert_eq!(drive.error_code(), 0);

        // ceil(600 / 254) = 3 sectors
        let path = Path { part: 0, dir: 0 };
        let found = drive.first_match(path, b"DATA", 0).expect("match");
        assert_eq!(found.blocks, 3);

        let idx = drive.alloc_buffer().expect("buffer");
        drive.bufs[idx].secondary = 0;
        drive.d64_open_read(0, &found, idx);
        assert_eq!(drive.channel_read_all(0), data);
    }

    #[test]
    fn scratch_restores_blocks() {
        let mut drive = d64_drive();
        let data = [0xaau8; 700];
        let dent = CbmDirent::with_name(b"VICTIM");
        let idx = drive.alloc_buffer().expect("buffer");
        drive.bufs[idx].secondary = 1;
        drive.d64_open_write(0, &dent, crate::dirent::TYPE_PRG, idx, false);
        for b in data {
            drive.channel_write(1, b).expect("write");
        }
        drive.close_channel(1).expect("close");
        assert_eq!(drive.d64_freeblocks(0), 664 - 3);

        let path = Path { part: 0, dir: 0 };
        let found = drive.first_match(path, b"VICTIM", 0).expect("match");
        assert_eq!(drive.d64_delete(0, &found), 1);
        assert_eq!(drive.d64_freeblocks(0), 664);
        assert!(drive.first_match(path, b"VICTIM", 0).is_none());
    }

    #[test]
    fn append_continues_chain() {
        let mut drive = d64_drive();
        let dent = CbmDirent::with_name(b"LOG");
        let idx = drive.alloc_buffer().expect("buffer");
        drive.bufs[idx].secondary = 1;
        drive.d64_open_write(0, &dent, crate::dirent::TYPE_SEQ, idx, false);
        for b in b"FIRST" {
            drive.channel_write(1, *b).expect("write");
        }
        drive.close_channel(1).expect("close");

        let path = Path { part: 0, dir: 0 };
        let found = drive.first_match(path, b"LOG", 0).expect("match");
        let idx = drive.alloc_buffer().expect("buffer");
        drive.bufs[idx].secondary = 1;
        drive.d64_open_write(0, &found, crate::dirent::TYPE_SEQ, idx, true);
        assert_eq!(drive.error_code(), 0);
        for b in b"SECOND" {
            drive.channel_write(1, *b).expect("write");
        }
        drive.close_channel(1).expect("close");

        let found = drive.first_match(path, b"LOG", 0).expect("match");
        let idx = drive.alloc_buffer().expect("buffer");
        drive.bufs[idx].secondary = 0;
        drive.d64_open_read(0, &found, idx);
        assert_eq!(drive.channel_read_all(0), b"FIRSTSECOND");
    }

    #[test]
    fn rename_updates_entry_in_place() {
        let mut drive = d64_drive();
        let dent = CbmDirent::with_name(b"OLD");
        let idx = drive.alloc_buffer().expect("buffer");
        drive.bufs[idx].secondary = 1;
        drive.d64_open_write(0, &dent, crate::dirent::TYPE_PRG, idx, false);
        drive.close_channel(1).expect("close");

        let path = Path { part: 0, dir: 0 };
        let found = drive.first_match(path, b"OLD", 0).expect("match");
        drive.d64_rename(0, &found, b"NEW");

        assert!(drive.first_match(path, b"NEW", 0).is_some());
        drive.set_error(0);
        assert!(drive.first_match(path, b"OLD", 0).is_none());
    }

    #[test]
    fn bad_link_reports_67() {
        let mut drive = d64_drive();
        let dent = CbmDirent {
            track: 99,
            sector: 0,
            ..CbmDirent::default()
        };
        let idx = drive.alloc_buffer().expect("buffer");
        drive.bufs[idx].secondary = 0;
        drive.d64_open_read(0, &dent, idx);
        assert_eq!(drive.error_code(), errors::ILLEGAL_TS_LINK);
        // Buffer was dropped
        assert_eq!(drive.find_buffer(0), None);
    }

    #[test]
    fn error_info_block_maps_codes() {
        let mut fs = MemStore::new("SD");
        let mut image = vec![0u8; format_d64::D64_SIZE_WITH_ERRORS];
        // Mark 1/0 with code 5 (data checksum error -> 23), 1/1 readable
        image[format_d64::D64_SIZE] = 5;
        image[format_d64::D64_SIZE + 1] = 1;
        fs.add_file(0, "BAD.D64", &image);
        let mut drive = Drive::new(vec![fs], DriveConfig::default());
        drive
            .mount_image(Path { part: 0, dir: 0 }, "BAD.D64")
            .expect("mount");

        let mut buf = [0u8; 256];
        assert!(drive.checked_read(0, 1, 0, &mut buf, 20).is_err());
        assert_eq!(drive.error_code(), errors::READ_CHECKSUM);
        drive.set_error(0);
        drive.checked_read(0, 1, 1, &mut buf, 20).expect("read");
    }

    #[test]
    fn d71_second_side_allocation_touches_both_bams() {
        let mut fs = MemStore::new("SD");
        let mut image = vec![0u8; format_d64::D71_SIZE];
        // Track 40 marked fully free: count at 18/0 + 0xdd + 4,
        // bitfield on 53/0
        let kind = ImageKind::D71;
        let count_off = kind.sector_offset(18, 0) as usize + 0xdd + 4;
        image[count_off] = 21;
        let bits_off = kind.sector_offset(53, 0) as usize + 3 * 4;
        image[bits_off] = 0xff;
        image[bits_off + 1] = 0xff;
        image[bits_off + 2] = 0x1f;
        fs.add_file(0, "TWO.D71", &image);

        let mut drive = Drive::new(vec![fs], DriveConfig::default());
        drive
            .mount_image(Path { part: 0, dir: 0 }, "TWO.D71")
            .expect("mount");

        assert_eq!(drive.sectors_free(0, 40), 21);
        assert!(drive.is_free(0, 40, 0).expect("bam"));
        drive.allocate_sector(0, 40, 0).expect("allocate");
        drive.bam_flush().expect("flush");
        assert_eq!(drive.sectors_free(0, 40), 20);
        assert!(!drive.is_free(0, 40, 0).expect("bam"));
        drive.bam_flush().expect("flush");

        // Both sectors were updated in the image
        drive.image_unmount(0).expect("unmount");
        let raw = drive.filesystem(0).file_data(0, "TWO.D71").expect("image");
        assert_eq!(raw[count_off], 20);
        assert_eq!(raw[bits_off] & 1, 0);
    }

    #[test]
    fn disk_full_leaves_valid_chain() {
        let mut drive = d64_drive();
        // Eat all free sectors except three
        let mut left = 3;
        for t in (1..=35u8).rev() {
            if t == 18 {
                continue;
            }
            for s in 0..ImageKind::D41.sectors_per_track(t) {
                if drive.d64_freeblocks(0) > left {
                    drive.allocate_sector(0, t, s).expect("allocate");
                }
            }
        }
        left = drive.d64_freeblocks(0);
        assert!(left <= 3);

        let dent = CbmDirent::with_name(b"BIG");
        let idx = drive.alloc_buffer().expect("buffer");
        drive.bufs[idx].secondary = 1;
        drive.d64_open_write(0, &dent, crate::dirent::TYPE_PRG, idx, false);
        let mut failed = false;
        for b in 0..254u32 * 8 {
            if drive.channel_write(1, (b & 0xff) as u8).is_err() {
                failed = true;
                break;
            }
        }
        assert!(failed);
        assert_eq!(drive.error_code(), errors::DISK_FULL);

        // The partial chain still terminates
        let path = Path { part: 0, dir: 0 };
        drive.set_error(0);
        let found = drive.first_match(path, b"BIG", 0).expect("entry");
        let (mut t, mut s) = (found.track, found.sector);
        let mut hops = 0;
        loop {
            let mut link = [0u8; 2];
            drive.checked_read(0, t, s, &mut link, 20).expect("chain");
            if link[0] == 0 {
                break;
            }
            t = link[0];
            s = link[1];
            hops += 1;
            assert!(hops < 10);
        }
    }

    #[test]
    fn unmounted_partition_has_no_bam_access() {
        let mut drive = test_drive();
        assert_eq!(drive.sectors_free(0, 1), 0);
    }
}
