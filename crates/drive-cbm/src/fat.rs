//! FAT-backed file operations and image mounting.
//!
//! The thin adapter between CBM channel semantics and the external FAT
//! driver: name/extension mapping, the read/write/REL refill callbacks,
//! and the chdir-based mounting of D64/D71/D81/M2I images. All image
//! backends funnel their raw accesses through [`Drive::image_read`] and
//! [`Drive::image_write`] here.

use drive_core::{FileStore, FsError, OpenMode};
use format_d64::ImageKind;

use crate::buffer::{BufferKind, FatFileState};
use crate::dirent::{
    CbmDirent, DirCursor, FLAG_HIDDEN, FLAG_RO, NAME_LENGTH, TYPE_DEL, TYPE_DIR, TYPE_MASK,
    TYPE_PRG, TYPE_REL, TYPE_SEQ, TYPE_USR,
};
use crate::drive::Drive;
use crate::fileops::Path;
use crate::partition::Mount;
use crate::petscii;
use crate::status::errors;

/// Largest file size representable in the 16-bit block count.
const MAX_BLOCKS_SIZE: u64 = 16_255_746;

/// Extensions that map to a file type when extension hiding is on.
const TYPE_EXTENSIONS: [(&str, u8); 5] = [
    ("PRG", TYPE_PRG),
    ("SEQ", TYPE_SEQ),
    ("USR", TYPE_USR),
    ("REL", TYPE_REL),
    ("DEL", TYPE_DEL),
];

/// What kind of image a file name suggests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageExt {
    Disk,
    M2i,
}

/// Check for a known type extension; returns the type and the offset of
/// the dot.
fn check_extension(name: &str) -> Option<(u8, usize)> {
    if name.len() < 4 {
        return None;
    }
    let dot = name.len() - 4;
    if name.as_bytes()[dot] != b'.' {
        return None;
    }
    let ext = &name[dot + 1..];
    TYPE_EXTENSIONS
        .iter()
        .find(|(e, _)| ext.eq_ignore_ascii_case(e))
        .map(|&(_, t)| (t, dot))
}

/// Check for a mountable image extension.
#[must_use]
pub fn check_imageext(name: &str) -> Option<ImageExt> {
    if name.len() < 4 {
        return None;
    }
    let ext = &name[name.len() - 3..];
    if name.as_bytes()[name.len() - 4] != b'.' {
        return None;
    }
    if ["D64", "D41", "D71", "D81"]
        .iter()
        .any(|e| ext.eq_ignore_ascii_case(e))
    {
        Some(ImageExt::Disk)
    } else if ext.eq_ignore_ascii_case("M2I") {
        Some(ImageExt::M2i)
    } else {
        None
    }
}

impl<F: FileStore> Drive<F> {
    /// Map a storage error onto the DOS status. `reading` selects which
    /// of the generic I/O errors is reported.
    pub(crate) fn fs_error(&mut self, err: FsError, reading: bool) {
        let code = match err {
            FsError::NotFound => errors::FILE_NOT_FOUND,
            FsError::Exists | FsError::DirNotEmpty => errors::FILE_EXISTS,
            FsError::NotDirectory => errors::FILE_TYPE_MISMATCH,
            FsError::WriteProtected => errors::WRITE_PROTECT,
            FsError::NoSpace => errors::DISK_FULL,
            FsError::InvalidHandle => errors::DRIVE_NOT_READY,
            FsError::Io => {
                if reading {
                    errors::READ_NOHEADER
                } else {
                    errors::WRITE_VERIFY
                }
            }
        };
        self.set_error(code);
    }

    /// FAT name to open a dirent with: the stored real name if there is
    /// one, the converted CBM name otherwise.
    fn fat_name_of(dent: &CbmDirent) -> String {
        dent.fat_name
            .clone()
            .unwrap_or_else(|| petscii::to_ascii_string(dent.name_bytes()))
    }

    /// Build the on-disk name for a new file, honouring the extension
    /// mode: 3 appends the type to non-PRG files, 4 always appends.
    fn build_name(&self, cbm_name: &[u8], ftype: u8) -> String {
        let mut name = petscii::to_ascii_string(cbm_name);
        let with_ext = match self.file_extension_mode {
            3 => ftype != TYPE_PRG,
            4 => true,
            _ => false,
        };
        if with_ext && check_imageext(&name).is_none() {
            let ext = TYPE_EXTENSIONS
                .iter()
                .find(|(_, t)| *t == ftype & TYPE_MASK)
                .map_or("PRG", |(e, _)| e);
            name.push('.');
            name.push_str(ext);
        }
        name
    }

    // ----- directory enumeration -----

    pub(crate) fn fat_opendir(&mut self, path: Path) -> Result<DirCursor, ()> {
        match self.parts[path.part].fs.open_dir(path.dir) {
            Ok(handle) => Ok(DirCursor::Fat {
                handle,
                dir: path.dir,
            }),
            Err(e) => {
                self.fs_error(e, true);
                Err(())
            }
        }
    }

    pub(crate) fn fat_readdir(
        &mut self,
        part: usize,
        cursor: &mut DirCursor,
    ) -> Result<Option<CbmDirent>, ()> {
        let DirCursor::Fat { handle, .. } = *cursor else {
            return Err(());
        };
        let entry = match self.parts[part].fs.read_dir(handle) {
            Ok(Some(e)) => e,
            Ok(None) => return Ok(None),
            Err(e) => {
                self.fs_error(e, true);
                return Err(());
            }
        };

        let mut dent = CbmDirent {
            fat_name: Some(entry.name.clone()),
            remainder: 0xff,
            ..CbmDirent::default()
        };

        let mut display = entry.name.clone();
        if entry.is_dir {
            dent.typeflags = TYPE_DIR;
            if display.starts_with('.') {
                dent.typeflags |= FLAG_HIDDEN;
            }
        } else {
            let mut typechar = TYPE_PRG;
            if let Some((ftype, dot)) = check_extension(&entry.name) {
                if self.globalflags.extension_hiding {
                    typechar = ftype;
                    display.truncate(dot);
                }
            }
            dent.typeflags = typechar;

            if entry.size > MAX_BLOCKS_SIZE {
                dent.blocks = 63999;
            } else {
                dent.blocks = ((entry.size + 253) / 254) as u16;
            }
            dent.remainder = (entry.size % 254) as u8;
        }

        if entry.read_only {
            dent.typeflags |= FLAG_RO;
        }

        // Plain 8.3-style names stay as they are; only mixed-case long
        // names go through the PETSCII mapping
        let converted = if display.bytes().any(|b| b.is_ascii_lowercase()) {
            petscii::from_ascii_str(&display)
        } else {
            display.into_bytes()
        };
        if converted.len() > NAME_LENGTH {
            dent.set_name(entry.name.as_bytes());
        } else {
            dent.set_name(&converted);
        }

        Ok(Some(dent))
    }

    // ----- refill callbacks -----

    /// Read the next block of a FAT file into the buffer window.
    pub(crate) fn fat_file_read(&mut self, idx: usize) -> Result<(), ()> {
        log::trace!(target: "fat", "refill read");
        let BufferKind::FatFile(st) = &self.bufs[idx].kind else {
            return Err(());
        };
        let st = *st;
        let recordlen = self.bufs[idx].recordlen;

        let pos = self.parts[st.part].fs.tell(st.file).unwrap_or(0);
        self.bufs[idx].fptr = (pos as u32).saturating_sub(u32::from(st.headersize));

        let want = if recordlen != 0 {
            usize::from(recordlen)
        } else {
            254
        };
        let mut chunk = [0u8; 254];
        let n = match self.parts[st.part].fs.read(st.file, &mut chunk[..want]) {
            Ok(n) => n,
            Err(e) => {
                self.fs_error(e, true);
                self.free_buffer(idx);
                return Err(());
            }
        };

        let buf = &mut self.bufs[idx];
        buf.data[2..2 + n].copy_from_slice(&chunk[..n]);
        let mut n = n;
        if n == 0 {
            // The bus protocol can't represent a zero-byte transfer
            n = 1;
            buf.data[2] = if recordlen != 0 { 255 } else { 13 };
        }

        buf.position = 2;
        buf.last_used = (n + 1) as u8;
        if recordlen != 0 {
            // Strip padding nulls from the end of the record
            while buf.data[usize::from(buf.last_used)] == 0 && buf.last_used > 1 {
                buf.last_used -= 1;
            }
        }

        let size = self.parts[st.part].fs.size(st.file).unwrap_or(0);
        let pos = self.parts[st.part].fs.tell(st.file).unwrap_or(0);
        let buf = &mut self.bufs[idx];
        buf.send_eoi = n < 254 || size == pos || recordlen != 0;

        Ok(())
    }

    /// Store the current window contents into the file.
    fn write_data(&mut self, idx: usize) -> Result<(), ()> {
        log::trace!(target: "fat", "flush window");
        let BufferKind::FatFile(st) = &self.bufs[idx].kind else {
            return Err(());
        };
        let st = *st;

        let buf = &mut self.bufs[idx];
        if !buf.must_flush {
            buf.last_used = buf.position.wrapping_sub(1);
        }
        let recordlen = buf.recordlen;
        if recordlen != 0 {
            // Records are written at fixed length, zero-padded
            if usize::from(recordlen) > usize::from(buf.last_used) - 1 {
                for i in usize::from(buf.last_used) + 1..usize::from(recordlen) + 2 {
                    buf.data[i] = 0;
                }
            }
            buf.last_used = recordlen + 1;
        }

        let count = usize::from(buf.last_used) - 1;
        let mut chunk = [0u8; 256];
        chunk[..count].copy_from_slice(&buf.data[2..2 + count]);

        match self.parts[st.part].fs.write(st.file, &chunk[..count]) {
            Ok(n) if n == count => {}
            Ok(_) => {
                self.set_error(errors::DISK_FULL);
                let _ = self.parts[st.part].fs.close(st.file);
                self.free_buffer(idx);
                return Err(());
            }
            Err(e) => {
                self.fs_error(e, true);
                let _ = self.parts[st.part].fs.close(st.file);
                self.free_buffer(idx);
                return Err(());
            }
        }

        self.mark_buffer_clean(idx);
        let pos = self.parts[st.part].fs.tell(st.file).unwrap_or(0);
        let buf = &mut self.bufs[idx];
        buf.must_flush = false;
        buf.position = 2;
        buf.last_used = 2;
        buf.fptr = (pos as u32).saturating_sub(u32::from(st.headersize));
        Ok(())
    }

    /// Refill callback of write channels.
    ///
    /// Handles record writes landing before or past the current end of
    /// file: repositions first, zero-fills the gap afterwards.
    pub(crate) fn fat_file_write(&mut self, idx: usize) -> Result<(), ()> {
        let BufferKind::FatFile(st) = &self.bufs[idx].kind else {
            return Err(());
        };
        let st = *st;

        let size = self.parts[st.part].fs.size(st.file).unwrap_or(0);
        let end = (size as u32).saturating_sub(u32::from(st.headersize));
        let fptr = self.bufs[idx].fptr;

        if fptr != end
            && self
                .parts[st.part]
                .fs
                .seek(st.file, u64::from(st.headersize) + u64::from(fptr))
                .is_err()
        {
            self.set_error(errors::DRIVE_NOT_READY);
            let _ = self.parts[st.part].fs.close(st.file);
            self.free_buffer(idx);
            return Err(());
        }

        let fill = fptr.saturating_sub(end);
        self.write_data(idx)?;

        if fill > 0 {
            // The write landed past the old end: fill the gap
            let recordlen = self.bufs[idx].recordlen;
            if self
                .parts[st.part]
                .fs
                .seek(st.file, u64::from(st.headersize) + u64::from(end))
                .is_err()
            {
                return Err(());
            }
            self.bufs[idx].must_flush = false;
            self.bufs[idx].fptr = end;
            self.bufs[idx].data[2] = if recordlen != 0 { 255 } else { 0 };
            for i in 3..256 {
                self.bufs[idx].data[i] = 0;
            }
            let mut remaining = fill;
            while remaining > 0 {
                let step = if recordlen != 0 {
                    u32::from(recordlen)
                } else {
                    remaining.min(254)
                };
                remaining = remaining.saturating_sub(step);
                self.bufs[idx].last_used = step as u8;
                self.bufs[idx].position = (step + 2) as u8;
                self.write_data(idx)?;
            }
            let size = self.parts[st.part].fs.size(st.file).unwrap_or(0);
            if self.parts[st.part].fs.seek(st.file, size).is_err() {
                self.set_error(errors::DRIVE_NOT_READY);
                let _ = self.parts[st.part].fs.close(st.file);
                self.free_buffer(idx);
                return Err(());
            }
            self.bufs[idx].fptr = (size as u32).saturating_sub(u32::from(st.headersize));
        }

        Ok(())
    }

    /// Seek within a FAT-backed channel.
    ///
    /// `position` addresses the byte offset, `index` an offset inside
    /// the loaded window (used for REL record positioning).
    pub(crate) fn fat_file_seek(&mut self, idx: usize, position: u32, index: u8) -> Result<(), ()> {
        let BufferKind::FatFile(st) = &self.bufs[idx].kind else {
            return Err(());
        };
        let st = *st;

        if self.bufs[idx].dirty {
            self.fat_file_write(idx)?;
        }

        let pos = u64::from(position) + u64::from(st.headersize);
        let size = self.parts[st.part].fs.size(st.file).unwrap_or(0);
        if size >= pos {
            if self.parts[st.part].fs.seek(st.file, pos).is_err() {
                self.set_error(errors::DRIVE_NOT_READY);
                let _ = self.parts[st.part].fs.close(st.file);
                self.free_buffer(idx);
                return Err(());
            }
            self.fat_file_read(idx)?;
        } else {
            let recordlen = self.bufs[idx].recordlen;
            let buf = &mut self.bufs[idx];
            buf.data[2] = if recordlen != 0 { 255 } else { 13 };
            buf.last_used = 2;
            buf.fptr = position;
            self.set_error(errors::RECORD_MISSING);
        }

        let buf = &mut self.bufs[idx];
        buf.position = index.saturating_add(2).min(buf.last_used);
        Ok(())
    }

    /// Refill callback of REL channels: advance to the next record.
    pub(crate) fn fat_file_sync(&mut self, idx: usize) -> Result<(), ()> {
        let fptr = self.bufs[idx].fptr;
        let recordlen = u32::from(self.bufs[idx].recordlen);
        self.fat_file_seek(idx, fptr + recordlen, 0)
    }

    /// Cleanup callback: flush pending writes and close the file.
    pub(crate) fn fat_file_close(&mut self, idx: usize) -> Result<(), ()> {
        if !self.bufs[idx].allocated {
            return Ok(());
        }
        let BufferKind::FatFile(st) = &self.bufs[idx].kind else {
            return Err(());
        };
        let st = *st;

        if self.bufs[idx].write {
            let _ = self.refill(idx);
        }

        self.bufs[idx].kind = BufferKind::None;
        match self.parts[st.part].fs.close(st.file) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.fs_error(e, true);
                Err(())
            }
        }
    }

    // ----- open -----

    pub(crate) fn fat_open_read(&mut self, path: Path, dent: &CbmDirent, idx: usize) {
        let name = Self::fat_name_of(dent);
        let file = match self.parts[path.part].fs.open(path.dir, &name, OpenMode::Read) {
            Ok(f) => f,
            Err(e) => {
                self.fs_error(e, true);
                return;
            }
        };

        self.bufs[idx].read = true;
        self.bufs[idx].kind = BufferKind::FatFile(FatFileState {
            part: path.part,
            file,
            headersize: 0,
        });
        let _ = self.fat_file_read(idx);
    }

    pub(crate) fn fat_open_write(
        &mut self,
        path: Path,
        dent: &CbmDirent,
        ftype: u8,
        idx: usize,
        append: bool,
    ) {
        let (file, headersize) = if append {
            let name = Self::fat_name_of(dent);
            match self.parts[path.part].fs.open(path.dir, &name, OpenMode::Append) {
                Ok(f) => (f, 0),
                Err(e) => {
                    self.fs_error(e, false);
                    return;
                }
            }
        } else {
            // A pre-resolved FAT name (M2I data files) wins over the
            // extension-mode name mapping
            let name = dent
                .fat_name
                .clone()
                .unwrap_or_else(|| self.build_name(dent.name_bytes(), ftype));
            match self.parts[path.part].fs.open(path.dir, &name, OpenMode::Write) {
                Ok(f) => (f, 0),
                Err(e) => {
                    self.fs_error(e, false);
                    return;
                }
            }
        };

        let pos = self.parts[path.part].fs.tell(file).unwrap_or(0);
        self.mark_write_buffer(idx);
        let buf = &mut self.bufs[idx];
        buf.position = 2;
        buf.last_used = 2;
        // An empty SAVE still produces a single 0x0D byte
        buf.data[2] = 13;
        buf.fptr = pos as u32;
        buf.kind = BufferKind::FatFile(FatFileState {
            part: path.part,
            file,
            headersize,
        });
    }

    /// Open or create a relative file. New files store the record
    /// length in a one-byte header.
    pub(crate) fn fat_open_rel(
        &mut self,
        path: Path,
        dent: &CbmDirent,
        idx: usize,
        length: u8,
        existing: bool,
    ) {
        let mut length = length;
        let (file, headersize) = if existing {
            let name = Self::fat_name_of(dent);
            let file = match self
                .parts[path.part]
                .fs
                .open(path.dir, &name, OpenMode::ReadWrite)
            {
                Ok(f) => f,
                Err(e) => {
                    self.fs_error(e, false);
                    return;
                }
            };
            let mut header = [0u8; 1];
            match self.parts[path.part].fs.read(file, &mut header) {
                Ok(1) => {}
                _ => {
                    self.set_error(errors::READ_NOHEADER);
                    let _ = self.parts[path.part].fs.close(file);
                    return;
                }
            }
            if length == 0 {
                length = header[0];
            } else if length != header[0] {
                self.set_error(errors::RECORD_MISSING);
            }
            (file, 1)
        } else {
            if length == 0 {
                self.set_error(errors::SYNTAX_UNABLE);
                return;
            }
            let name = self.build_name(dent.name_bytes(), TYPE_REL);
            let file = match self.parts[path.part].fs.open(path.dir, &name, OpenMode::Write) {
                Ok(f) => f,
                Err(e) => {
                    self.fs_error(e, false);
                    return;
                }
            };
            if self.parts[path.part].fs.write(file, &[length]) != Ok(1) {
                self.set_error(errors::DISK_FULL);
                let _ = self.parts[path.part].fs.close(file);
                return;
            }
            (file, 1)
        };

        self.bufs[idx].recordlen = length;
        self.mark_write_buffer(idx);
        self.bufs[idx].read = true;
        self.bufs[idx].kind = BufferKind::FatFile(FatFileState {
            part: path.part,
            file,
            headersize,
        });

        let _ = self.fat_file_read(idx);
    }

    // ----- directory-level operations -----

    pub(crate) fn fat_delete(&mut self, path: Path, dent: &CbmDirent) -> u8 {
        let name = Self::fat_name_of(dent);
        match self.parts[path.part].fs.remove(path.dir, &name) {
            Ok(()) => 1,
            Err(FsError::NotFound) => 0,
            Err(e) => {
                self.fs_error(e, false);
                255
            }
        }
    }

    /// Change directory or mount an image, depending on what the entry
    /// is.
    pub(crate) fn fat_chdir(&mut self, path: Path, dent: &CbmDirent) -> Result<(), ()> {
        // Left arrow moves one level up
        if dent.name_bytes() == b"_" {
            let parent = match self.parts[path.part].fs.parent(path.dir) {
                Ok(p) => p,
                Err(e) => {
                    self.fs_error(e, true);
                    return Err(());
                }
            };
            self.parts[path.part].current_dir = parent;
            return Ok(());
        }
        if dent.name_bytes().is_empty() {
            self.parts[path.part].current_dir = 0;
            return Ok(());
        }

        if dent.file_type() == TYPE_DIR {
            let name = Self::fat_name_of(dent);
            match self.parts[path.part].fs.subdir(path.dir, &name) {
                Ok(dir) => {
                    self.parts[path.part].current_dir = dir;
                    Ok(())
                }
                Err(e) => {
                    self.fs_error(e, true);
                    Err(())
                }
            }
        } else {
            let name = Self::fat_name_of(dent);
            if check_imageext(&name).is_some() {
                self.mount_image(path, &name)
            } else {
                Ok(())
            }
        }
    }

    /// Mount a D64-family or M2I image over the partition.
    pub(crate) fn mount_image(&mut self, path: Path, name: &str) -> Result<(), ()> {
        self.free_user_buffers(true);

        let (file, writable) = match self
            .parts[path.part]
            .fs
            .open(path.dir, name, OpenMode::ReadWrite)
        {
            Ok(f) => (f, true),
            Err(FsError::WriteProtected) => {
                match self.parts[path.part].fs.open(path.dir, name, OpenMode::Read) {
                    Ok(f) => (f, false),
                    Err(e) => {
                        self.fs_error(e, true);
                        return Err(());
                    }
                }
            }
            Err(e) => {
                self.fs_error(e, true);
                return Err(());
            }
        };

        let mount = match check_imageext(name) {
            Some(ImageExt::M2i) => Mount::M2i { file, writable },
            Some(ImageExt::Disk) => {
                let size = self.parts[path.part].fs.size(file).unwrap_or(0);
                let Some((kind, error_info)) = ImageKind::from_size(size) else {
                    self.set_error(errors::IMAGE_INVALID);
                    let _ = self.parts[path.part].fs.close(file);
                    return Err(());
                };
                self.bam.refcount += 1;
                if error_info {
                    self.error_cache.invalidate();
                }
                Mount::D64 {
                    file,
                    kind,
                    error_info,
                    writable,
                }
            }
            None => {
                let _ = self.parts[path.part].fs.close(file);
                return Err(());
            }
        };

        self.parts[path.part].image_dir = path.dir;
        self.parts[path.part].current_dir = path.dir;
        self.parts[path.part].mount = mount;
        Ok(())
    }

    /// Unmount the image on a partition, dropping back to FAT access.
    pub(crate) fn image_unmount(&mut self, part: usize) -> Result<(), ()> {
        self.free_user_buffers(true);

        let mount = self.parts[part].mount;
        let file = match mount {
            Mount::Fat => return Ok(()),
            Mount::D64 { file, .. } => {
                self.bam_flush()?;
                self.bam.refcount = self.bam.refcount.saturating_sub(1);
                self.bam.invalidate();
                file
            }
            Mount::M2i { file, .. } => file,
        };

        self.parts[part].mount = Mount::Fat;
        self.parts[part].current_dir = self.parts[part].image_dir;
        match self.parts[part].fs.close(file) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.fs_error(e, false);
                Err(())
            }
        }
    }

    pub(crate) fn fat_mkdir(&mut self, path: Path, name: &[u8]) {
        let ascii = petscii::to_ascii_string(name);
        if let Err(e) = self.parts[path.part].fs.mkdir(path.dir, &ascii) {
            self.fs_error(e, false);
        }
    }

    pub(crate) fn fat_rename(&mut self, path: Path, dent: &CbmDirent, newname: &[u8]) {
        let old = Self::fat_name_of(dent);
        let new = if check_extension(&old).is_some() && self.globalflags.extension_hiding {
            // Keep the type extension on the renamed file
            self.build_name_keep_ext(newname, &old)
        } else {
            petscii::to_ascii_string(newname)
        };
        if let Err(e) = self.parts[path.part].fs.rename(path.dir, &old, &new) {
            self.fs_error(e, false);
        }
    }

    fn build_name_keep_ext(&self, newname: &[u8], old: &str) -> String {
        let mut name = petscii::to_ascii_string(newname);
        if let Some((_, dot)) = check_extension(old) {
            name.push_str(&old[dot..]);
        }
        name
    }

    // ----- labels and free space -----

    /// Directory label: the FAT volume label in the root, the directory
    /// name below it.
    pub(crate) fn fat_getdirlabel(&mut self, part: usize, label: &mut [u8; 16]) -> Result<(), ()> {
        label.fill(b' ');
        let dir = self.parts[part].current_dir;
        let name = if dir == 0 {
            self.parts[part].fs.volume_label()
        } else {
            self.parts[part].fs.dir_name(dir)
        };
        match name {
            Ok(name) => {
                let converted = if name.bytes().any(|b| b.is_ascii_lowercase()) {
                    petscii::from_ascii_str(&name)
                } else {
                    name.into_bytes()
                };
                let n = converted.len().min(16);
                label[..n].copy_from_slice(&converted[..n]);
                Ok(())
            }
            Err(e) => {
                self.fs_error(e, true);
                Err(())
            }
        }
    }

    /// Fake disk id derived from the FAT type, "2A" dos marker included.
    pub(crate) fn fat_getid(&mut self, part: usize, id: &mut [u8; 5]) {
        let fat32 = self.parts[part].fs.is_fat32();
        id.copy_from_slice(if fat32 { b"32 2A" } else { b"16 2A" });
    }

    /// Free blocks on the FAT volume.
    ///
    /// FAT32 free-space counting is slow, so it reports 1 unless the
    /// user enabled real counting with `XB+`.
    pub(crate) fn fat_freeblocks(&mut self, part: usize) -> u16 {
        if self.parts[part].fs.is_fat32() && !self.globalflags.fat32_freeblocks {
            return 1;
        }
        match self.parts[part].fs.free_space() {
            Ok(bytes) => (bytes / 254).min(65535) as u16,
            Err(_) => 0,
        }
    }

    // ----- image raw access -----

    /// Read from the mounted image file at a byte offset.
    ///
    /// Returns the number of bytes actually read; short reads are not
    /// an error here (M2I uses them for end-of-file detection).
    pub(crate) fn image_read(
        &mut self,
        part: usize,
        offset: u64,
        out: &mut [u8],
    ) -> Result<usize, ()> {
        let file = match self.parts[part].mount {
            Mount::D64 { file, .. } | Mount::M2i { file, .. } => file,
            Mount::Fat => return Err(()),
        };
        if self.parts[part].fs.seek(file, offset).is_err() {
            self.set_error(errors::DRIVE_NOT_READY);
            return Err(());
        }
        match self.parts[part].fs.read(file, out) {
            Ok(n) => Ok(n),
            Err(e) => {
                self.fs_error(e, true);
                Err(())
            }
        }
    }

    /// Write to the mounted image file at a byte offset.
    pub(crate) fn image_write(
        &mut self,
        part: usize,
        offset: u64,
        data: &[u8],
        flush: bool,
    ) -> Result<(), ()> {
        let (file, writable) = match self.parts[part].mount {
            Mount::D64 { file, writable, .. } | Mount::M2i { file, writable } => (file, writable),
            Mount::Fat => return Err(()),
        };
        if !writable {
            self.set_error(errors::WRITE_PROTECT);
            return Err(());
        }
        if self.parts[part].fs.seek(file, offset).is_err() {
            self.set_error(errors::DRIVE_NOT_READY);
            return Err(());
        }
        match self.parts[part].fs.write(file, data) {
            Ok(n) if n == data.len() => {}
            Ok(_) => {
                self.set_error(errors::DISK_FULL);
                return Err(());
            }
            Err(e) => {
                self.fs_error(e, false);
                return Err(());
            }
        }
        if flush && self.parts[part].fs.sync(file).is_err() {
            self.set_error(errors::DRIVE_NOT_READY);
            return Err(());
        }
        Ok(())
    }
}
