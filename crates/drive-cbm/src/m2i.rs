//! File operations on M2I index files.
//!
//! An M2I mount keeps CBM names and types in an ASCII index file while
//! the data lives in plain files of the same FAT directory. Everything
//! here is bookkeeping on the index; the actual data access is handed
//! to the FAT backend with the translated name.

use drive_core::FileStore;
use format_m2i as m2i;

use crate::dirent::{CbmDirent, DirCursor, EntryPos, NAME_LENGTH, TYPE_DEL, TYPE_MASK};
use crate::drive::Drive;
use crate::fileops::Path;
use crate::partition::Mount;
use crate::path::check_invalid_name;
use crate::status::errors;

impl<F: FileStore> Drive<F> {
    fn m2i_writable(&self, part: usize) -> bool {
        matches!(self.parts[part].mount, Mount::M2i { writable: true, .. })
    }

    /// Load the index line at `offset`.
    ///
    /// `Ok(None)` marks the end of the index (short read).
    fn m2i_load_entry(&mut self, part: usize, offset: u32) -> Result<Option<[u8; m2i::ENTRY_LEN]>, ()> {
        let mut raw = [0u8; m2i::ENTRY_LEN];
        let n = self.image_read(part, u64::from(offset), &mut raw)?;
        if n < m2i::ENTRY_LEN {
            return Ok(None);
        }
        Ok(Some(raw))
    }

    /// Find the index line with the given CBM name.
    fn m2i_find_entry(&mut self, part: usize, name: &[u8]) -> Result<Option<u32>, ()> {
        let mut offset = m2i::FIRST_ENTRY as u32;
        loop {
            let Some(raw) = self.m2i_load_entry(part, offset)? else {
                return Ok(None);
            };
            if let Ok(Some(entry)) = m2i::parse_entry(&raw) {
                if entry.cbm_name == name {
                    return Ok(Some(offset));
                }
            }
            offset += m2i::ENTRY_LEN as u32;
        }
    }

    /// First deleted slot, or the end of the index.
    fn m2i_find_empty(&mut self, part: usize) -> Result<u32, ()> {
        let mut offset = m2i::FIRST_ENTRY as u32;
        loop {
            let Some(raw) = self.m2i_load_entry(part, offset)? else {
                return Ok(offset);
            };
            if m2i::is_deleted(&raw) {
                return Ok(offset);
            }
            offset += m2i::ENTRY_LEN as u32;
        }
    }

    pub(crate) fn m2i_opendir(&mut self) -> DirCursor {
        DirCursor::M2i {
            offset: m2i::FIRST_ENTRY as u32,
        }
    }

    pub(crate) fn m2i_readdir(
        &mut self,
        part: usize,
        cursor: &mut DirCursor,
    ) -> Result<Option<CbmDirent>, ()> {
        let DirCursor::M2i { offset } = cursor else {
            return Err(());
        };

        loop {
            let Some(raw) = self.m2i_load_entry(part, *offset)? else {
                return Ok(None);
            };
            let pos = EntryPos::M2i { offset: *offset };
            *offset += m2i::ENTRY_LEN as u32;

            let Ok(Some(entry)) = m2i::parse_entry(&raw) else {
                continue;
            };

            let mut dent = CbmDirent {
                typeflags: entry.file_type,
                // Sizes would need one FAT lookup per entry; faked like
                // the original to keep listings fast
                blocks: u16::from(entry.file_type != TYPE_DEL),
                remainder: 0xff,
                fat_name: Some(entry.fat_name),
                pos,
                ..CbmDirent::default()
            };
            dent.set_name(&entry.cbm_name);
            return Ok(Some(dent));
        }
    }

    pub(crate) fn m2i_getlabel(&mut self, part: usize, label: &mut [u8; 16]) -> Result<(), ()> {
        if self.image_read(part, 0, label)? < 16 {
            return Err(());
        }
        Ok(())
    }

    pub(crate) fn m2i_open_read(&mut self, path: Path, dent: &CbmDirent, idx: usize) {
        // The index entry already resolved the FAT name
        if dent.fat_name.is_none() {
            self.set_error(errors::FILE_NOT_FOUND);
            return;
        }
        self.fat_open_read(
            Path {
                part: path.part,
                dir: self.parts[path.part].image_dir,
            },
            dent,
            idx,
        );
    }

    pub(crate) fn m2i_open_write(
        &mut self,
        path: Path,
        dent: &CbmDirent,
        ftype: u8,
        idx: usize,
        append: bool,
    ) {
        if !self.m2i_writable(path.part) {
            self.set_error(errors::WRITE_PROTECT);
            return;
        }
        let fat_path = Path {
            part: path.part,
            dir: self.parts[path.part].image_dir,
        };

        if append {
            if dent.fat_name.is_none() {
                self.set_error(errors::FILE_NOT_FOUND);
                return;
            }
            self.fat_open_write(fat_path, dent, ftype, idx, true);
            return;
        }

        if check_invalid_name(dent.name_bytes()) {
            self.set_error(errors::SYNTAX_JOKER);
            return;
        }

        let Ok(offset) = self.m2i_find_empty(path.part) else {
            return;
        };

        // Generate a unique numeric FAT name
        let mut counter = 0u32;
        let fat_name = loop {
            let candidate = format!("{counter:08}");
            if self
                .parts[path.part]
                .fs
                .stat(fat_path.dir, &candidate)
                .is_err()
            {
                break candidate;
            }
            counter += 1;
            if counter > 99_999_999 {
                self.set_error(errors::DISK_FULL);
                return;
            }
        };

        let Some(line) = m2i::build_entry(ftype & TYPE_MASK, &fat_name, dent.name_bytes()) else {
            self.set_error(errors::SYNTAX_UNABLE);
            return;
        };
        if self
            .image_write(path.part, u64::from(offset), &line, true)
            .is_err()
        {
            return;
        }

        let mut fat_dent = dent.clone();
        fat_dent.fat_name = Some(fat_name);
        self.fat_open_write(fat_path, &fat_dent, ftype, idx, false);

        if self.current_error != 0 {
            // Data file creation failed: mark the index line deleted
            let _ = self.image_write(path.part, u64::from(offset), b"-", true);
        }
    }

    pub(crate) fn m2i_delete(&mut self, path: Path, dent: &CbmDirent) -> u8 {
        let Ok(found) = self.m2i_find_entry(path.part, dent.name_bytes()) else {
            return 255;
        };
        let Some(offset) = found else {
            return 0;
        };

        let fat_path = Path {
            part: path.part,
            dir: self.parts[path.part].image_dir,
        };
        // Delete the data file; the index entry goes away regardless
        self.fat_delete(fat_path, dent);

        if self
            .image_write(path.part, u64::from(offset), b"-", true)
            .is_err()
        {
            return 0;
        }
        1
    }

    pub(crate) fn m2i_rename(&mut self, path: Path, dent: &CbmDirent, newname: &[u8]) {
        let Ok(found) = self.m2i_find_entry(path.part, dent.name_bytes()) else {
            return;
        };
        let Some(offset) = found else {
            self.set_error(errors::FILE_NOT_FOUND);
            return;
        };

        let Ok(Some(mut raw)) = self.m2i_load_entry(path.part, offset) else {
            return;
        };
        raw[m2i::CBMNAME_OFFSET..m2i::CBMNAME_OFFSET + NAME_LENGTH].fill(b' ');
        let n = newname.len().min(NAME_LENGTH);
        raw[m2i::CBMNAME_OFFSET..m2i::CBMNAME_OFFSET + n].copy_from_slice(&newname[..n]);
        let _ = self.image_write(path.part, u64::from(offset), &raw, true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dirent::{TYPE_PRG, TYPE_SEQ};
    use crate::drive::{Drive, DriveConfig};
    use drive_core::MemStore;

    fn m2i_drive() -> Drive<MemStore> {
        let mut index = Vec::new();
        index.extend_from_slice(&m2i::build_header(b"MY COLLECTION"));
        index.extend_from_slice(&m2i::build_entry(TYPE_PRG, "GAME.BIN", b"GAME").expect("entry"));
        index.extend_from_slice(&m2i::build_entry(TYPE_SEQ, "NOTES.TXT", b"NOTES").expect("entry"));

        let mut fs = MemStore::new("SD");
        fs.add_file(0, "SET.M2I", &index);
        fs.add_file(0, "GAME.BIN", b"\x01\x08GAME DATA");
        fs.add_file(0, "NOTES.TXT", b"hello");
        let mut drive = Drive::new(vec![fs], DriveConfig::default());
        drive
            .mount_image(Path { part: 0, dir: 0 }, "SET.M2I")
            .expect("mount");
        drive
    }

    #[test]
    fn readdir_lists_index_entries() {
        let mut drive = m2i_drive();
        let mut cursor = drive.m2i_opendir();
        let first = drive.m2i_readdir(0, &mut cursor).expect("read").expect("entry");
        assert_eq!(first.name_bytes(), b"GAME");
        assert_eq!(first.file_type(), TYPE_PRG);
        assert_eq!(first.fat_name.as_deref(), Some("GAME.BIN"));
        let second = drive.m2i_readdir(0, &mut cursor).expect("read").expect("entry");
        assert_eq!(second.name_bytes(), b"NOTES");
        assert!(drive.m2i_readdir(0, &mut cursor).expect("read").is_none());
    }

    #[test]
    fn open_reads_backing_file() {
        let mut drive = m2i_drive();
        drive.set_command(b"GAME");
        drive.file_open(0);
        assert_eq!(drive.error_code(), 0);
        assert_eq!(drive.channel_read_all(0), b"\x01\x08GAME DATA");
    }

    #[test]
    fn write_creates_index_entry_and_data_file() {
        let mut drive = m2i_drive();
        drive.set_command(b"NEWFILE,S,W");
        drive.file_open(2);
        assert_eq!(drive.error_code(), 0);
        for b in b"DATA" {
            drive.channel_write(2, *b).expect("write");
        }
        drive.close_channel(2).expect("close");

        // The generated FAT file exists and the index lists the entry
        assert_eq!(
            drive.filesystem(0).file_data(0, "00000000").expect("file"),
            b"DATA"
        );
        let mut cursor = drive.m2i_opendir();
        let mut names = Vec::new();
        while let Some(dent) = drive.m2i_readdir(0, &mut cursor).expect("read") {
            names.push(dent.name_bytes().to_vec());
        }
        assert!(names.contains(&b"NEWFILE".to_vec()));
    }

    #[test]
    fn scratch_marks_entry_deleted() {
        let mut drive = m2i_drive();
        drive.set_command(b"S:GAME");
        drive.execute_command();
        assert_eq!(drive.status_line(), b"01,FILES SCRATCHED,01,00\r");
        assert!(drive.filesystem(0).file_data(0, "GAME.BIN").is_none());

        let mut cursor = drive.m2i_opendir();
        let mut names = Vec::new();
        while let Some(dent) = drive.m2i_readdir(0, &mut cursor).expect("read") {
            names.push(dent.name_bytes().to_vec());
        }
        assert!(!names.contains(&b"GAME".to_vec()));
    }

    #[test]
    fn label_comes_from_header() {
        let mut drive = m2i_drive();
        let mut label = [0u8; 16];
        drive.m2i_getlabel(0, &mut label).expect("label");
        assert_eq!(&label[..13], b"MY COLLECTION");
    }

    #[test]
    fn rel_open_refused() {
        let mut drive = m2i_drive();
        drive.set_command(b"RELFILE,L,\x10");
        drive.file_open(4);
        assert_eq!(drive.error_code(), errors::SYNTAX_UNABLE);
    }
}
