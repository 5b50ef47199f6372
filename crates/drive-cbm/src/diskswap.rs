//! Swap lists: mounting through the front-panel keys.
//!
//! A swap list is a plain text file naming one image or directory per
//! line. The PREV/NEXT/HOME keys step through it; each step frees all
//! user channels and mounts the selected entry. Lines are CR, LF or
//! CRLF terminated.

use drive_core::{FileStore, KEY_HOME, KEY_NEXT, KEY_PREV, OpenMode};

use crate::dirent::FLAG_HIDDEN;
use crate::drive::Drive;
use crate::fileops::Path;
use crate::status::errors;

/// State of the active swap list.
pub(crate) struct SwapList {
    pub part: usize,
    /// Directory holding the list and its entries.
    pub dir: u32,
    /// FAT name of the list file.
    pub name: String,
    /// Currently mounted entry; 255 requests the last one.
    pub entry: u8,
}

impl<F: FileStore> Drive<F> {
    /// Activate a swap list (the `XS` command).
    pub(crate) fn set_changelist(&mut self, path: Path, name: &[u8]) {
        if name.is_empty() {
            self.clear_swaplist();
            return;
        }

        let ascii = crate::petscii::to_ascii_string(name);
        if self.parts[path.part].fs.stat(path.dir, &ascii).is_err() {
            self.set_error(errors::FILE_NOT_FOUND);
            return;
        }

        self.swaplist = Some(SwapList {
            part: path.part,
            dir: path.dir,
            name: ascii,
            entry: 0,
        });
        self.globalflags.autoswap_active = true;

        // Mount the first entry right away
        self.mount_swap_entry();
    }

    /// Forget the active swap list.
    pub(crate) fn clear_swaplist(&mut self) {
        self.swaplist = None;
        self.globalflags.autoswap_active = false;
    }

    /// Read line `n` of the swap list, wrapping at the end.
    ///
    /// Returns the line and its (possibly wrapped) index.
    fn swap_line(&mut self, n: u8) -> Option<(Vec<u8>, u8)> {
        let list = self.swaplist.as_ref()?;
        let (part, dir, name) = (list.part, list.dir, list.name.clone());

        let file = self.parts[part].fs.open(dir, &name, OpenMode::Read).ok()?;
        let size = self.parts[part].fs.size(file).unwrap_or(0);
        let mut contents = vec![0u8; usize::try_from(size).ok()?];
        let ok = matches!(self.parts[part].fs.read(file, &mut contents), Ok(len) if len == contents.len());
        let _ = self.parts[part].fs.close(file);
        if !ok {
            return None;
        }

        let lines: Vec<&[u8]> = contents
            .split(|&b| b == b'\r' || b == b'\n')
            .filter(|line| !line.is_empty())
            .collect();
        if lines.is_empty() {
            return None;
        }

        let index = if n == 255 {
            lines.len() - 1
        } else {
            usize::from(n) % lines.len()
        };
        Some((lines[index].to_vec(), index as u8))
    }

    /// Mount the entry the swap list currently points at.
    fn mount_swap_entry(&mut self) {
        let Some(list) = self.swaplist.as_ref() else {
            return;
        };
        let (part, dir, entry) = (list.part, list.dir, list.entry);

        let old_error = self.current_error;
        self.set_error(errors::OK);
        self.free_user_buffers(true);

        let Some((line, index)) = self.swap_line(entry) else {
            self.set_error(old_error);
            return;
        };
        if let Some(list) = self.swaplist.as_mut() {
            list.entry = index;
        }

        // Unmount whatever image is active, then treat the line like a
        // CD target relative to the list's directory
        if self.parts[part].has_image() {
            let _ = self.image_unmount(part);
        }
        self.parts[part].current_dir = dir;

        let path = Path { part, dir };
        let Some(dent) = self.first_match(path, &line, FLAG_HIDDEN) else {
            return;
        };
        let _ = self.fops_chdir(path, &dent);

        if self.current_error == errors::OK {
            self.set_error(old_error);
        }
    }

    /// Handle the disk-change keys. Returns `true` if a key acted.
    pub(crate) fn handle_swap_keys(&mut self) -> bool {
        if self.swaplist.is_none() {
            return false;
        }

        if self.ui.key_pressed(KEY_NEXT) {
            self.ui.reset_key(KEY_NEXT);
            if let Some(list) = self.swaplist.as_mut() {
                list.entry = list.entry.wrapping_add(1);
            }
            self.mount_swap_entry();
            return true;
        }
        if self.ui.key_pressed(KEY_PREV) {
            self.ui.reset_key(KEY_PREV);
            if let Some(list) = self.swaplist.as_mut() {
                list.entry = if list.entry == 0 {
                    255
                } else {
                    list.entry - 1
                };
            }
            self.mount_swap_entry();
            return true;
        }
        if self.ui.key_pressed(KEY_HOME) {
            self.ui.reset_key(KEY_HOME);
            if let Some(list) = self.swaplist.as_mut() {
                list.entry = 0;
            }
            self.mount_swap_entry();
            return true;
        }
        false
    }
}
