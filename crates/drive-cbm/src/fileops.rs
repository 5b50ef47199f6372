//! Generic file operations: backend dispatch, name matching, directory
//! listings and OPEN handling.
//!
//! Every partition answers the same set of operations; which backend
//! implements them depends on what is mounted (`fat`, `d64`, `m2i`).
//! This module also builds the BASIC-program-shaped directory listing
//! and contains the OPEN-filename adapter that binds a secondary
//! address to a concrete file.

use drive_core::{DirId, FileStore};

use crate::buffer::{BufferKind, DirState};
use crate::dirent::{
    CbmDirent, DirCursor, FLAG_HIDDEN, FLAG_RO, FLAG_SPLAT, NAME_LENGTH, TYPE_CBM, TYPE_DEL,
    TYPE_DIR, TYPE_MASK, TYPE_NAMES, TYPE_PRG, TYPE_REL, TYPE_SEQ, TYPE_USR,
};
use crate::drive::Drive;
use crate::partition::Mount;
use crate::path::{check_invalid_name, match_name, split_spec};
use crate::petscii;
use crate::status::errors;

/// A resolved partition/directory reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Path {
    pub part: usize,
    pub dir: DirId,
}

/// Open modes of the `,R/,W/,A/,M` suffixes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Write,
    Append,
    Modify,
}

/// First line of a directory listing: BASIC load address, line link,
/// line number 0, reverse-on and the quoted 16-character disk name,
/// followed by the id field.
const DIR_HEADER: [u8; 32] = [
    1, 4, // BASIC start address
    1, 1, // next line pointer
    0, 0, // line number 0
    0x12, 0x22, // reverse on, quote
    b' ', b' ', b' ', b' ', b' ', b' ', b' ', b' ', // disk name,
    b' ', b' ', b' ', b' ', b' ', b' ', b' ', b' ', // filled in later
    0x22, 0x20, // quote, space
    b'I', b'K', b' ', b'2', b'A', // id and dos marker
    0, // line-end marker
];

/// Last line: "BLOCKS FREE." plus the end-of-program marker.
const DIR_FOOTER: [u8; 32] = [
    1, 1, // next line pointer
    0, 0, // number of free blocks (filled later)
    b'B', b'L', b'O', b'C', b'K', b'S', b' ', b'F', b'R', b'E', b'E', b'.', //
    0x20, 0x20, 0x20, 0x20, 0x20, 0x20, 0x20, 0x20, //
    0x20, 0x20, 0x20, 0x20, 0x20, 0x00, 0x00, 0x00,
];

/// Offset of the id within the header line.
const HEADER_ID_OFFSET: usize = 26;
/// Offset of the disk name within the header line.
const HEADER_NAME_OFFSET: usize = 8;

/// Render one directory entry as a 32-byte BASIC line.
///
/// The block count doubles as the BASIC line number; the link pointer
/// low byte smuggles the remainder (plus 2, so it is never 0 or 1) to
/// clients that know to look.
fn format_entry(dent: &CbmDirent, line: &mut [u8]) {
    line[..31].fill(b' ');
    line[31] = 0;

    line[0] = if dent.remainder == 0xff {
        1
    } else {
        dent.remainder + 2
    };
    line[1] = 1;
    line[2] = (dent.blocks & 0xff) as u8;
    line[3] = (dent.blocks >> 8) as u8;

    // Right-align the block count by padding before the quote
    let mut pos = 4;
    if dent.blocks < 1000 {
        pos += 1;
    }
    if dent.blocks < 100 {
        pos += 1;
    }
    if dent.blocks < 10 {
        pos += 1;
    }
    line[pos] = b'"';
    pos += 1;

    line[pos..pos + NAME_LENGTH].copy_from_slice(&dent.name);
    for i in 0..=NAME_LENGTH {
        if i == NAME_LENGTH || dent.name[i] == 0x22 || dent.name[i] == 0xa0 {
            line[pos + i] = b'"';
            for j in i + 1..=NAME_LENGTH {
                line[pos + j] &= 0x7f;
            }
            break;
        }
    }
    pos += NAME_LENGTH + 1;

    if dent.typeflags & FLAG_SPLAT != 0 {
        line[pos] = b'*';
    }
    line[pos + 1..pos + 4].copy_from_slice(TYPE_NAMES[usize::from(dent.file_type())]);
    if dent.typeflags & FLAG_RO != 0 {
        line[pos + 4] = b'<';
    }
    if dent.typeflags & FLAG_HIDDEN != 0 {
        line[pos + 5] = b'H';
    }
}

impl<F: FileStore> Drive<F> {
    // ----- backend dispatch -----

    pub(crate) fn fops_opendir(&mut self, path: Path) -> Result<DirCursor, ()> {
        match self.parts[path.part].mount {
            Mount::Fat => self.fat_opendir(path),
            Mount::D64 { .. } => Ok(self.d64_opendir(path.part)),
            Mount::M2i { .. } => Ok(self.m2i_opendir()),
        }
    }

    pub(crate) fn fops_readdir(
        &mut self,
        part: usize,
        cursor: &mut DirCursor,
    ) -> Result<Option<CbmDirent>, ()> {
        match self.parts[part].mount {
            Mount::Fat => self.fat_readdir(part, cursor),
            Mount::D64 { .. } => self.d64_readdir(part, cursor),
            Mount::M2i { .. } => self.m2i_readdir(part, cursor),
        }
    }

    pub(crate) fn fops_open_read(&mut self, path: Path, dent: &CbmDirent, idx: usize) {
        match self.parts[path.part].mount {
            Mount::Fat => self.fat_open_read(path, dent, idx),
            Mount::D64 { .. } => self.d64_open_read(path.part, dent, idx),
            Mount::M2i { .. } => self.m2i_open_read(path, dent, idx),
        }
    }

    pub(crate) fn fops_open_write(
        &mut self,
        path: Path,
        dent: &CbmDirent,
        ftype: u8,
        idx: usize,
        append: bool,
    ) {
        match self.parts[path.part].mount {
            Mount::Fat => self.fat_open_write(path, dent, ftype, idx, append),
            Mount::D64 { .. } => self.d64_open_write(path.part, dent, ftype, idx, append),
            Mount::M2i { .. } => self.m2i_open_write(path, dent, ftype, idx, append),
        }
    }

    pub(crate) fn fops_open_rel(
        &mut self,
        path: Path,
        dent: &CbmDirent,
        idx: usize,
        length: u8,
        existing: bool,
    ) {
        match self.parts[path.part].mount {
            Mount::Fat => self.fat_open_rel(path, dent, idx, length, existing),
            // Relative files are not supported inside images
            Mount::D64 { .. } | Mount::M2i { .. } => self.set_error(errors::SYNTAX_UNABLE),
        }
    }

    /// Delete one file. Returns the number of files removed (0 or 1),
    /// or 255 on error.
    pub(crate) fn fops_delete(&mut self, path: Path, dent: &CbmDirent) -> u8 {
        match self.parts[path.part].mount {
            Mount::Fat => self.fat_delete(path, dent),
            Mount::D64 { .. } => self.d64_delete(path.part, dent),
            Mount::M2i { .. } => self.m2i_delete(path, dent),
        }
    }

    pub(crate) fn fops_disk_label(&mut self, part: usize, label: &mut [u8; 16]) -> Result<(), ()> {
        match self.parts[part].mount {
            Mount::Fat => self.fat_getdirlabel(part, label),
            Mount::D64 { .. } => self.d64_getlabel(part, label),
            Mount::M2i { .. } => self.m2i_getlabel(part, label),
        }
    }

    pub(crate) fn fops_disk_id(&mut self, part: usize, id: &mut [u8; 5]) -> Result<(), ()> {
        match self.parts[part].mount {
            Mount::Fat | Mount::M2i { .. } => {
                self.fat_getid(part, id);
                Ok(())
            }
            Mount::D64 { .. } => self.d64_getid(part, id),
        }
    }

    pub(crate) fn fops_free_blocks(&mut self, part: usize) -> u16 {
        match self.parts[part].mount {
            Mount::Fat | Mount::M2i { .. } => self.fat_freeblocks(part),
            Mount::D64 { .. } => self.d64_freeblocks(part),
        }
    }

    pub(crate) fn fops_read_sector(&mut self, idx: usize, part: usize, track: u8, sector: u8) {
        match self.parts[part].mount {
            Mount::Fat | Mount::M2i { .. } => {
                self.set_error_ts(errors::READ_NOHEADER, track, sector);
            }
            Mount::D64 { .. } => self.d64_read_sector(idx, part, track, sector),
        }
    }

    pub(crate) fn fops_write_sector(&mut self, idx: usize, part: usize, track: u8, sector: u8) {
        match self.parts[part].mount {
            Mount::Fat | Mount::M2i { .. } => {
                self.set_error_ts(errors::READ_NOHEADER, track, sector);
            }
            Mount::D64 { .. } => self.d64_write_sector(idx, part, track, sector),
        }
    }

    pub(crate) fn fops_format(&mut self, part: usize, name: &[u8], id: Option<&[u8]>) {
        match self.parts[part].mount {
            Mount::Fat | Mount::M2i { .. } => self.set_error(errors::SYNTAX_UNKNOWN),
            Mount::D64 { .. } => self.d64_format(part, name, id),
        }
    }

    pub(crate) fn fops_mkdir(&mut self, path: Path, name: &[u8]) {
        match self.parts[path.part].mount {
            Mount::Fat => self.fat_mkdir(path, name),
            Mount::D64 { .. } | Mount::M2i { .. } => self.set_error(errors::SYNTAX_UNABLE),
        }
    }

    pub(crate) fn fops_chdir(&mut self, path: Path, dent: &CbmDirent) -> Result<(), ()> {
        match self.parts[path.part].mount {
            Mount::Fat => self.fat_chdir(path, dent),
            // Inside an image only `_` (unmount) works
            Mount::D64 { .. } | Mount::M2i { .. } => {
                if dent.name_bytes() == b"_" {
                    self.image_unmount(path.part)
                } else {
                    Err(())
                }
            }
        }
    }

    pub(crate) fn fops_rename(&mut self, path: Path, dent: &CbmDirent, newname: &[u8]) {
        match self.parts[path.part].mount {
            Mount::Fat => self.fat_rename(path, dent, newname),
            Mount::D64 { .. } => self.d64_rename(path.part, dent, newname),
            Mount::M2i { .. } => self.m2i_rename(path, dent, newname),
        }
    }

    // ----- refill/cleanup dispatch -----

    /// Refill or flush a buffer window.
    ///
    /// For read channels this loads the next block; for write channels
    /// it stores the current window. Callbacks free the buffer and set
    /// a DOS error when they fail.
    pub(crate) fn refill(&mut self, idx: usize) -> Result<(), ()> {
        match &self.bufs[idx].kind {
            BufferKind::None | BufferKind::Raw => Ok(()),
            BufferKind::Dir(_) => self.dir_refill(idx),
            BufferKind::FatFile(_) => {
                if self.bufs[idx].recordlen != 0 {
                    self.fat_file_sync(idx)
                } else if self.bufs[idx].write {
                    self.fat_file_write(idx)
                } else {
                    self.fat_file_read(idx)
                }
            }
            BufferKind::D64File(_) => {
                if self.bufs[idx].write {
                    self.d64_write(idx)
                } else {
                    self.d64_read(idx)
                }
            }
        }
    }

    /// Flush pending state and finalise the file behind a buffer.
    pub(crate) fn cleanup(&mut self, idx: usize) -> Result<(), ()> {
        match &self.bufs[idx].kind {
            BufferKind::None | BufferKind::Raw | BufferKind::Dir(_) => Ok(()),
            BufferKind::FatFile(_) => self.fat_file_close(idx),
            BufferKind::D64File(_) => {
                if self.bufs[idx].write {
                    self.d64_write_cleanup(idx)
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Seek within a channel (the `P` command).
    pub(crate) fn seek_buffer(&mut self, idx: usize, position: u32, index: u8) -> Result<(), ()> {
        match &self.bufs[idx].kind {
            BufferKind::FatFile(_) => self.fat_file_seek(idx, position, index),
            _ => {
                self.set_error(errors::SYNTAX_UNABLE);
                Err(())
            }
        }
    }

    // ----- name resolution and matching -----

    /// Resolve a partition/path/name specification against the
    /// partition table and FAT directory tree.
    pub(crate) fn resolve_spec(&mut self, input: &[u8]) -> Result<(Path, Vec<u8>), ()> {
        let spec = split_spec(input);

        let part = match spec.partition {
            None | Some(0) => self.current_part,
            Some(n) => {
                let p = usize::from(n) - 1;
                if p >= self.parts.len() {
                    self.set_error_ts(errors::PARTITION_ILLEGAL, n, 0);
                    return Err(());
                }
                p
            }
        };

        let mut dir = self.parts[part].current_dir;
        if spec.has_path && matches!(self.parts[part].mount, Mount::Fat) {
            if spec.absolute {
                dir = 0;
            }
            for component in &spec.components {
                let ascii = petscii::to_ascii_string(component);
                match self.parts[part].fs.subdir(dir, &ascii) {
                    Ok(d) => dir = d,
                    Err(_) => {
                        self.set_error(errors::FILE_NOT_FOUND_39);
                        return Err(());
                    }
                }
            }
        }

        Ok((Path { part, dir }, spec.name))
    }

    /// Next directory entry matching pattern and type.
    ///
    /// `typeflags` selects a required file type in its low bits (0 =
    /// any); hidden entries are skipped unless `FLAG_HIDDEN` is set.
    pub(crate) fn next_match(
        &mut self,
        part: usize,
        cursor: &mut DirCursor,
        pattern: Option<&[u8]>,
        typeflags: u8,
    ) -> Result<Option<CbmDirent>, ()> {
        let postmatch = self.globalflags.postmatch;
        loop {
            let Some(dent) = self.fops_readdir(part, cursor)? else {
                return Ok(None);
            };

            if typeflags & TYPE_MASK != 0 && dent.file_type() != typeflags & TYPE_MASK {
                continue;
            }
            if dent.typeflags & FLAG_HIDDEN != 0 && typeflags & FLAG_HIDDEN == 0 {
                continue;
            }
            if let Some(pattern) = pattern {
                if !match_name(pattern, dent.name_bytes(), postmatch) {
                    continue;
                }
            }
            return Ok(Some(dent));
        }
    }

    /// First entry matching a name; sets FILE NOT FOUND when there is
    /// none.
    pub(crate) fn first_match(
        &mut self,
        path: Path,
        pattern: &[u8],
        typeflags: u8,
    ) -> Option<CbmDirent> {
        let mut cursor = self.fops_opendir(path).ok()?;
        match self.next_match(path.part, &mut cursor, Some(pattern), typeflags) {
            Ok(Some(dent)) => Some(dent),
            Ok(None) => {
                self.set_error(errors::FILE_NOT_FOUND);
                None
            }
            Err(()) => None,
        }
    }

    // ----- directory listing -----

    /// Generate the next listing line into a directory buffer.
    fn dir_refill(&mut self, idx: usize) -> Result<(), ()> {
        log::trace!(target: "dir", "next entry");
        self.bufs[idx].position = 0;
        self.bufs[idx].last_used = 0;

        let BufferKind::Dir(state) = &self.bufs[idx].kind else {
            return Err(());
        };
        let part = state.part;
        let filetype = state.filetype;
        let pattern = state.pattern.clone();
        let mut cursor = state.cursor;

        let matched = self.next_match(part, &mut cursor, pattern.as_deref(), filetype);
        if let BufferKind::Dir(state) = &mut self.bufs[idx].kind {
            state.cursor = cursor;
        }

        match matched {
            Ok(Some(dent)) => {
                let mut line = [0u8; 32];
                format_entry(&dent, &mut line);
                self.bufs[idx].data[..32].copy_from_slice(&line);
                self.bufs[idx].last_used = 31;
                Ok(())
            }
            Ok(None) => self.dir_footer(idx, part),
            Err(()) => {
                self.free_buffer(idx);
                Err(())
            }
        }
    }

    /// Generate the final "BLOCKS FREE." line.
    fn dir_footer(&mut self, idx: usize, part: usize) -> Result<(), ()> {
        let blocks = self.fops_free_blocks(part);
        let buf = &mut self.bufs[idx];
        buf.data[..32].copy_from_slice(&DIR_FOOTER);
        buf.data[2] = (blocks & 0xff) as u8;
        buf.data[3] = (blocks >> 8) as u8;
        buf.position = 0;
        buf.last_used = 31;
        buf.send_eoi = true;
        Ok(())
    }

    /// Set up a buffer to produce a directory listing for `$`.
    fn load_directory(&mut self, secondary: u8) {
        let command = self.command.clone();

        // "$" / "$2" / "$:PATTERN" / "$:PATTERN=T"
        let mut filetype = 0u8;
        let (path, mut pattern) = if command.len() > 1 {
            // A bare partition number lists that partition
            let arg = if command[1..].iter().all(u8::is_ascii_digit) {
                let mut with_colon = command[1..].to_vec();
                with_colon.push(b':');
                with_colon
            } else {
                command[1..].to_vec()
            };
            match self.resolve_spec(&arg) {
                Ok(v) => v,
                Err(()) => return,
            }
        } else {
            (
                Path {
                    part: self.current_part,
                    dir: self.parts[self.current_part].current_dir,
                },
                Vec::new(),
            )
        };

        if let Some(eq) = pattern.iter().position(|&b| b == b'=') {
            filetype = match pattern.get(eq + 1) {
                Some(b'S') => TYPE_SEQ,
                Some(b'P') => TYPE_PRG,
                Some(b'U') => TYPE_USR,
                Some(b'R') => TYPE_REL,
                Some(b'C') => TYPE_CBM,
                Some(b'B' | b'D') => TYPE_DIR,
                Some(b'H') => FLAG_HIDDEN,
                _ => 0,
            };
            pattern.truncate(eq);
        }

        let Some(idx) = self.alloc_buffer() else {
            return;
        };

        let Ok(cursor) = self.fops_opendir(path) else {
            self.free_buffer(idx);
            return;
        };

        let mut label = [b' '; 16];
        if self.fops_disk_label(path.part, &mut label).is_err() {
            self.free_buffer(idx);
            return;
        }
        let mut id = [b' '; 5];
        if self.fops_disk_id(path.part, &mut id).is_err() {
            self.free_buffer(idx);
            return;
        }

        let buf = &mut self.bufs[idx];
        buf.secondary = secondary;
        buf.read = true;
        buf.position = 0;
        buf.last_used = 31;
        buf.send_eoi = false;
        buf.data[..32].copy_from_slice(&DIR_HEADER);
        buf.data[HEADER_NAME_OFFSET..HEADER_NAME_OFFSET + 16].copy_from_slice(&label);
        buf.data[HEADER_ID_OFFSET..HEADER_ID_OFFSET + 5].copy_from_slice(&id);
        buf.kind = BufferKind::Dir(DirState {
            cursor,
            pattern: if pattern.is_empty() {
                None
            } else {
                Some(pattern)
            },
            filetype,
            part: path.part,
        });
    }

    // ----- OPEN handling -----

    /// Open the file named in the command buffer on a secondary address.
    ///
    /// Handles `$`, `#`, `@`, partition/path prefixes and the `,T,M`
    /// suffixes.
    pub fn file_open(&mut self, secondary: u8) {
        self.set_error(errors::OK);

        if self.command.is_empty() {
            self.set_error(errors::SYNTAX_NONAME);
            return;
        }

        if self.command[0] == b'$' {
            if secondary == 0 || !matches!(self.parts[self.current_part].mount, Mount::D64 { .. })
            {
                self.load_directory(secondary);
            } else {
                self.d64_raw_directory(secondary);
            }
            return;
        }

        if self.command[0] == b'#' {
            let Some(idx) = self.alloc_buffer() else {
                return;
            };
            let buf = &mut self.bufs[idx];
            buf.secondary = secondary;
            buf.read = true;
            buf.position = 1; // Sic, matches 1541 behaviour
            buf.last_used = 255;
            buf.send_eoi = true;
            buf.kind = BufferKind::Raw;
            self.mark_write_buffer(idx);
            return;
        }

        // Split off the ,TYPE,MODE suffixes
        let command = self.command.clone();
        let mut fields = command.split(|&b| b == b',');
        let mut name_part = fields.next().unwrap_or(&[]).to_vec();
        let mut mode = OpenMode::Read;
        let mut filetype = TYPE_DEL;
        let mut recordlen = 0u8;
        let mut want_record_len = false;

        for field in fields {
            if want_record_len {
                recordlen = field.first().copied().unwrap_or(0);
                want_record_len = false;
                continue;
            }
            match field.first() {
                Some(b'R') => mode = OpenMode::Read,
                Some(b'W') => mode = OpenMode::Write,
                Some(b'A') => mode = OpenMode::Append,
                Some(b'M') => mode = OpenMode::Modify,
                Some(b'D') => filetype = TYPE_DEL,
                Some(b'S') => filetype = TYPE_SEQ,
                Some(b'P') => filetype = TYPE_PRG,
                Some(b'U') => filetype = TYPE_USR,
                Some(b'L') => {
                    filetype = TYPE_REL;
                    want_record_len = true;
                }
                _ => {}
            }
        }

        // Secondary 0 is always LOAD, secondary 1 always SAVE
        match secondary {
            0 => {
                mode = OpenMode::Read;
                if filetype == TYPE_DEL {
                    filetype = TYPE_PRG;
                }
            }
            1 => {
                mode = OpenMode::Write;
                if filetype == TYPE_DEL {
                    filetype = TYPE_PRG;
                }
            }
            _ => {
                if filetype == TYPE_DEL {
                    filetype = TYPE_SEQ;
                }
            }
        }

        // Save-with-replace marker
        let replace = name_part.first() == Some(&b'@');
        if replace {
            name_part.remove(0);
        }

        let Ok((path, mut fname)) = self.resolve_spec(&name_part) else {
            return;
        };

        // M2I stores space-padded names
        if matches!(self.parts[path.part].mount, Mount::M2i { .. }) {
            while fname.last() == Some(&b' ') {
                fname.pop();
            }
        }

        if fname.is_empty() {
            self.set_error(errors::SYNTAX_NONAME);
            return;
        }

        if (mode == OpenMode::Write || filetype == TYPE_REL) && check_invalid_name(&fname) {
            self.set_error(errors::SYNTAX_JOKER);
            return;
        }

        let Ok(mut cursor) = self.fops_opendir(path) else {
            return;
        };
        let matched = match self.next_match(path.part, &mut cursor, Some(&fname), FLAG_HIDDEN) {
            Ok(m) => m,
            Err(()) => return,
        };

        // Relative files: open existing or create with the given length
        if filetype == TYPE_REL
            || matched
                .as_ref()
                .is_some_and(|d| d.file_type() == TYPE_REL)
        {
            let existing = matched.is_some();
            let dent = matched.unwrap_or_else(|| CbmDirent::with_name(&fname));
            let Some(idx) = self.alloc_buffer() else {
                return;
            };
            self.bufs[idx].secondary = secondary;
            self.fops_open_rel(path, &dent, idx, recordlen, existing);
            if self.current_error != 0 && self.current_error != errors::RECORD_MISSING {
                self.free_buffer(idx);
            }
            return;
        }

        let dent = match (mode, matched) {
            (OpenMode::Write, Some(dent)) => {
                if replace {
                    if self.fops_delete(path, &dent) == 255 {
                        return;
                    }
                    CbmDirent::with_name(&fname)
                } else {
                    self.set_error(errors::FILE_EXISTS);
                    return;
                }
            }
            (OpenMode::Write, None) => {
                // A failed match sets FILE NOT FOUND; creating is fine
                self.set_error(errors::OK);
                CbmDirent::with_name(&fname)
            }
            (_, Some(dent)) => dent,
            (_, None) => {
                self.set_error(errors::FILE_NOT_FOUND);
                return;
            }
        };

        let Some(idx) = self.alloc_buffer() else {
            return;
        };
        self.bufs[idx].secondary = secondary;

        match mode {
            // Modify reads files the drive would otherwise hide
            OpenMode::Read | OpenMode::Modify => self.fops_open_read(path, &dent, idx),
            OpenMode::Write => self.fops_open_write(path, &dent, filetype, idx, false),
            OpenMode::Append => self.fops_open_write(path, &dent, filetype, idx, true),
        }

        if self.current_error != 0 {
            self.free_buffer(idx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drive::tests::{drive_with_files, test_drive};

    #[test]
    fn entry_line_for_small_file() {
        let mut dent = CbmDirent::with_name(b"HELLO");
        dent.blocks = 1;
        dent.typeflags = TYPE_PRG;
        dent.remainder = 0xff;
        let mut line = [0u8; 32];
        format_entry(&dent, &mut line);

        assert_eq!(&line[0..2], &[1, 1]);
        assert_eq!(&line[2..4], &[1, 0]);
        // Three filler bytes, quote, name, quote
        assert_eq!(line[7], b'"');
        assert_eq!(&line[8..13], b"HELLO");
        assert_eq!(line[8 + NAME_LENGTH], b'"');
        assert_eq!(&line[26..29], b"PRG");
        assert_eq!(line[31], 0);
    }

    #[test]
    fn entry_line_markers() {
        let mut dent = CbmDirent::with_name(b"X");
        dent.blocks = 1234;
        dent.typeflags = TYPE_SEQ | FLAG_SPLAT | FLAG_RO;
        dent.remainder = 10;
        let mut line = [0u8; 32];
        format_entry(&dent, &mut line);

        assert_eq!(line[0], 12); // remainder + 2
        assert_eq!(&line[2..4], &[0xd2, 0x04]);
        assert_eq!(line[4], b'"'); // no filler for 4-digit counts
        let tail = 4 + 1 + NAME_LENGTH + 1;
        assert_eq!(line[tail], b'*');
        assert_eq!(&line[tail + 1..tail + 4], b"SEQ");
        assert_eq!(line[tail + 4], b'<');
    }

    #[test]
    fn open_missing_file_sets_62() {
        let mut drive = test_drive();
        drive.set_command(b"NOPE");
        drive.file_open(0);
        assert_eq!(drive.error_code(), errors::FILE_NOT_FOUND);
        assert_eq!(drive.find_buffer(0), None);
    }

    #[test]
    fn open_without_name_sets_34() {
        let mut drive = test_drive();
        drive.set_command(b"");
        drive.file_open(2);
        assert_eq!(drive.error_code(), errors::SYNTAX_NONAME);
    }

    #[test]
    fn open_existing_for_write_sets_63() {
        let mut drive = drive_with_files(&[("DATA", b"x")]);
        drive.set_command(b"DATA,S,W");
        drive.file_open(2);
        assert_eq!(drive.error_code(), errors::FILE_EXISTS);
    }

    #[test]
    fn save_with_replace_deletes_first() {
        let mut drive = drive_with_files(&[("DATA", b"old")]);
        drive.set_command(b"@:DATA");
        drive.file_open(1);
        assert_eq!(drive.error_code(), errors::OK);
        assert!(drive.find_buffer(1).is_some());
        drive.channel_write(1, b'n').expect("write");
        drive.close_channel(1).expect("close");
        assert_eq!(drive.filesystem(0).file_data(0, "DATA").expect("data"), b"n");
    }

    #[test]
    fn wildcard_write_rejected() {
        let mut drive = test_drive();
        drive.set_command(b"AB*,S,W");
        drive.file_open(2);
        assert_eq!(drive.error_code(), errors::SYNTAX_JOKER);
    }

    #[test]
    fn hash_channel_is_raw_buffer() {
        let mut drive = test_drive();
        drive.set_command(b"#");
        drive.file_open(5);
        let idx = drive.find_buffer(5).expect("buffer");
        assert_eq!(drive.bufs[idx].kind, BufferKind::Raw);
        assert_eq!(drive.bufs[idx].position, 1);
        assert_eq!(drive.bufs[idx].last_used, 255);
        assert!(drive.bufs[idx].read && drive.bufs[idx].write);
    }

    #[test]
    fn directory_listing_bytes_for_empty_disk() {
        let mut drive = test_drive();
        drive.filesystem_mut(0).set_free_space(665 * 254);
        drive.set_command(b"$");
        drive.file_open(0);

        let listing = drive.channel_read_all(0);
        // Header line: load address, link, line 0, reverse, quote
        assert_eq!(&listing[..8], &[1, 4, 1, 1, 0, 0, 0x12, 0x22]);
        assert_eq!(&listing[8..16], b"TESTDISK");
        assert_eq!(&listing[24..26], [0x22, 0x20]);
        // Footer directly follows on an empty disk
        assert_eq!(listing.len(), 64);
        assert_eq!(&listing[32..36], &[1, 1, (665_u32 & 0xff) as u8, (665_u32 >> 8) as u8]);
        assert_eq!(&listing[36..48], b"BLOCKS FREE.");
        assert_eq!(&listing[61..64], &[0, 0, 0]);
    }

    #[test]
    fn directory_listing_contains_entries() {
        let mut drive = drive_with_files(&[("GAME.PRG", b"0123456789")]);
        drive.set_command(b"$");
        drive.file_open(0);
        let listing = drive.channel_read_all(0);
        assert_eq!(listing.len(), 96);
        // Entry line: 1 block, name in quotes
        assert_eq!(listing[34], 1);
        assert_eq!(listing[35], 0);
        let line = &listing[32..64];
        let quote = line.iter().position(|&b| b == b'"').expect("quote");
        assert_eq!(&line[quote + 1..quote + 9], b"GAME.PRG");
    }

    #[test]
    fn directory_pattern_filters_entries() {
        let mut drive = drive_with_files(&[("ALPHA", b"1"), ("BETA", b"2")]);
        drive.set_command(b"$:A*");
        drive.file_open(0);
        let listing = drive.channel_read_all(0);
        // Header + one entry + footer
        assert_eq!(listing.len(), 96);
        let line = &listing[32..64];
        assert!(line.windows(5).any(|w| w == b"ALPHA"));
    }
}
