//! Channel-15 DOS command parser.
//!
//! Commands arrive as EOI-delimited byte strings on secondary 15 and are
//! dispatched off their first letter(s). Errors never unwind further
//! than the status channel; a rejected command leaves all other state
//! untouched.

use drive_core::{MediaState, RtcState, RtcTime};

use crate::buffer::ERROR_CHANNEL;
use crate::dirent::{CbmDirent, FLAG_HIDDEN, TYPE_DIR, TYPE_REL};
use crate::drive::{COMMAND_BUFFER_SIZE, Drive, ERROR_BUFFER_SIZE};
use crate::fastloader::{Loader, crc16_update};
use crate::partition::Mount;
use crate::path::{check_invalid_name, parse_number, parse_partition};
use crate::status::errors;

use drive_core::FileStore;

/// Address/value pairs some programs read via `M-R` to detect a 1541.
const C1541_MAGICS: [(u16, [u8; 2]); 3] = [
    (0xfea0, [0x0d, 0xed]), // DreamLoad, ULoad Model 3
    (0xe5c6, [0x34, 0xb1]), // DreamLoad, ULoad Model 3
    (0xfffe, [0x00, 0x00]), // disables the AR6 fastloader probe
];

/// Day-of-week names as used by the CMD FD.
const DOW_NAMES: &[u8; 28] = b"SUN.MON.TUESWED.THURFRI.SAT.";

/// Skeleton of the ASCII time format.
const ASCIITIME_SKEL: &[u8; 22] = b" xx/xx/xx xx:xx:xx xM\r";

fn int2bcd(value: u8) -> u8 {
    ((value / 10) << 4) | (value % 10)
}

fn bcd2int(value: u8) -> u8 {
    (value >> 4) * 10 + (value & 0x0f)
}

/// Write a two-digit number into a byte slice at `pos`.
fn put_number(out: &mut [u8], pos: usize, value: u8) {
    out[pos] = b'0' + (value / 10) % 10;
    out[pos + 1] = b'0' + value % 10;
}

impl<F: FileStore> Drive<F> {
    /// Parse and execute the accumulated command-channel bytes.
    ///
    /// Returns a fastloader to enter when an `M-E` matched a detected
    /// protocol; the bus loop runs it with the port in hand.
    pub fn execute_command(&mut self) -> Option<Loader> {
        self.set_error(errors::OK);

        if self.command.len() == COMMAND_BUFFER_SIZE {
            self.set_error(errors::SYNTAX_TOOLONG);
            return None;
        }

        // One trailing CR is part of the frame, not the command
        let mut len = self.command.len();
        if len > 0 && self.command[len - 1] == 0x0d {
            len -= 1;
        }
        if len == 0 {
            self.set_error(errors::SYNTAX_UNABLE);
            return None;
        }

        if self.detected_loader == Loader::None {
            log::debug!(target: "doscmd", "command: {:?}", &self.command[..len]);
        }

        // Zero padding lets the parsers index past the end like the
        // fixed-size firmware buffer
        let mut cmd = self.command[..len].to_vec();
        cmd.resize(COMMAND_BUFFER_SIZE + 2, 0);

        // MD/CD/RD clash with other commands, so they're checked first
        if cmd[0] != b'X' && cmd[1] == b'D' {
            self.parse_dircommand(&cmd, len);
            return None;
        }

        match cmd[0] {
            b'B' => self.parse_block(&cmd),
            b'C' => {
                if cmd[1] == b'P' || cmd[1] == 0xd0 {
                    self.parse_changepart(&cmd);
                } else {
                    self.parse_copy(&cmd, len);
                }
            }
            b'D' => self.parse_direct(&cmd),
            b'E' => self.parse_nvram(&cmd, len),
            b'G' => self.parse_getpartition(&cmd, len),
            b'I' => self.parse_initialize(),
            b'M' => return self.parse_memory(&cmd, len),
            b'N' => self.parse_new(&cmd, len),
            b'P' => self.parse_position(&cmd, len),
            b'R' => self.parse_rename(&cmd, len),
            b'S' => {
                if len == 3 && cmd[1] == b'-' {
                    // Swap drive number, unsupported
                    self.set_error(errors::SYNTAX_UNABLE);
                } else {
                    self.parse_scratch(&cmd, len);
                }
            }
            b'T' => self.parse_time(&cmd, len),
            b'U' => self.parse_user(&cmd, len),
            b'X' => self.parse_xcommand(&cmd, len),
            _ => self.set_error(errors::SYNTAX_UNKNOWN),
        }
        None
    }

    // ----- CD/MD/RD -----

    fn parse_dircommand(&mut self, cmd: &[u8], len: usize) {
        match cmd[0] {
            b'M' => self.parse_mkdir(cmd, len),
            b'C' => self.parse_chdir(cmd, len),
            b'R' => self.parse_rmdir(cmd, len),
            _ => self.set_error(errors::SYNTAX_UNKNOWN),
        }
    }

    fn parse_mkdir(&mut self, cmd: &[u8], len: usize) {
        if !cmd[..len].contains(&b':') {
            self.set_error(errors::SYNTAX_NONAME);
            return;
        }
        let Ok((path, name)) = self.resolve_spec(&cmd[2..len]) else {
            return;
        };
        self.fops_mkdir(path, &name);
    }

    fn parse_chdir(&mut self, cmd: &[u8], len: usize) {
        let Ok((path, name)) = self.resolve_spec(&cmd[2..len]) else {
            return;
        };

        if name.is_empty() {
            if cmd[..len].contains(&b'/') {
                // Pure path reference: the resolver already walked it
                self.parts[path.part].current_dir = path.dir;
            } else {
                self.set_error(errors::FILE_NOT_FOUND_39);
                return;
            }
        } else if name == b"_" {
            let dent = CbmDirent::with_name(b"_");
            if self.fops_chdir(path, &dent).is_err() {
                return;
            }
        } else {
            let Some(dent) = self.first_match(path, &name, FLAG_HIDDEN) else {
                return;
            };
            if self.fops_chdir(path, &dent).is_err() {
                return;
            }
        }

        if self.globalflags.autoswap_active {
            self.clear_swaplist();
        }
    }

    fn parse_rmdir(&mut self, cmd: &[u8], len: usize) {
        // No deletion across subdirectories
        if cmd[..len].contains(&b'/') {
            self.set_error(errors::SYNTAX_NONAME);
            return;
        }

        let mut pos = 2;
        let part = parse_partition(cmd, &mut pos, self.current_part);
        if cmd[pos] != b':' {
            self.set_error(errors::SYNTAX_NONAME);
            return;
        }
        if part >= self.parts.len() {
            self.set_error_ts(errors::PARTITION_ILLEGAL, part as u8 + 1, 0);
            return;
        }
        if !matches!(self.parts[part].mount, Mount::Fat) {
            self.set_error(errors::SYNTAX_UNABLE);
            return;
        }

        let name: Vec<u8> = cmd[pos + 1..len].to_vec();
        let dir = self.parts[part].current_dir;
        let ascii = crate::petscii::to_ascii_string(&name);
        match self.parts[part].fs.rmdir(dir, &ascii) {
            Ok(()) => self.set_error_ts(errors::SCRATCHED, 1, 0),
            Err(drive_core::FsError::NotFound) => self.set_error_ts(errors::SCRATCHED, 0, 0),
            Err(e) => self.fs_error(e, false),
        }
    }

    // ----- block commands -----

    /// Parse the `,`-separated numeric parameters of a block command.
    fn parse_blockparam(&self, cmd: &[u8], values: &mut [u8; 4]) -> Option<usize> {
        let mut pos = match cmd.iter().position(|&b| b == b':') {
            Some(colon) => colon + 1,
            None => {
                if self.command.len() < 3 {
                    return None;
                }
                3
            }
        };

        let mut count = 0;
        while count < 4 {
            while cmd[pos] == b' ' || cmd[pos] == 0x1d || cmd[pos] == b',' {
                pos += 1;
            }
            if cmd[pos] == 0 {
                break;
            }
            values[count] = parse_number(cmd, &mut pos);
            count += 1;
        }
        Some(count)
    }

    pub(crate) fn parse_block(&mut self, cmd: &[u8]) {
        let Some(dash) = cmd.iter().position(|&b| b == b'-') else {
            self.set_error(errors::SYNTAX_UNABLE);
            return;
        };

        let mut params = [0u8; 4];
        if self.parse_blockparam(cmd, &mut params).is_none() {
            return;
        }

        match cmd[dash + 1] {
            letter @ (b'R' | b'W') => {
                let Some(idx) = self.find_buffer(params[0]) else {
                    self.set_error(errors::NO_CHANNEL);
                    return;
                };

                let part = if params[1] == 0 {
                    self.current_part
                } else {
                    usize::from(params[1])
                };
                if part >= self.parts.len() {
                    self.set_error_ts(errors::PARTITION_ILLEGAL, params[1], 0);
                    return;
                }

                if letter == b'R' {
                    self.fops_read_sector(idx, part, params[2], params[3]);
                    let buf = &mut self.bufs[idx];
                    if cmd[0] == b'B' {
                        buf.position = 1;
                        buf.last_used = buf.data[0];
                    } else {
                        buf.position = 0;
                        buf.last_used = 255;
                    }
                } else {
                    if cmd[0] == b'B' {
                        let buf = &mut self.bufs[idx];
                        buf.data[0] = buf.position.wrapping_sub(1);
                    }
                    self.fops_write_sector(idx, part, params[2], params[3]);
                }
            }
            b'P' => {
                let Some(idx) = self.find_buffer(params[0]) else {
                    self.set_error(errors::NO_CHANNEL);
                    return;
                };
                self.bufs[idx].position = params[1];
                self.bufs[idx].must_flush = false;
            }
            _ => self.set_error(errors::SYNTAX_UNABLE),
        }
    }

    // ----- copy -----

    fn parse_copy(&mut self, cmd: &[u8], len: usize) {
        let Some(eq) = cmd[..len].iter().position(|&b| b == b'=') else {
            self.set_error(errors::SYNTAX_UNKNOWN);
            return;
        };

        let Ok((dstpath, dstname)) = self.resolve_spec(&cmd[1..eq]) else {
            return;
        };
        if dstname.is_empty() {
            self.set_error(errors::SYNTAX_NONAME);
            return;
        }
        if check_invalid_name(&dstname) {
            self.set_error(errors::SYNTAX_UNKNOWN);
            return;
        }

        // The destination must not exist yet
        let mut cursor = match self.fops_opendir(dstpath) {
            Ok(c) => c,
            Err(()) => return,
        };
        match self.next_match(dstpath.part, &mut cursor, Some(&dstname), FLAG_HIDDEN) {
            Ok(Some(_)) => {
                self.set_error(errors::FILE_EXISTS);
                return;
            }
            Ok(None) => {}
            Err(()) => return,
        }
        self.set_error(errors::OK);

        let Some(srcidx) = self.alloc_buffer() else {
            return;
        };
        let Some(dstidx) = self.alloc_buffer() else {
            self.free_buffer(srcidx);
            return;
        };
        let mut srcidx = srcidx;

        let sources: Vec<Vec<u8>> = cmd[eq + 1..len]
            .split(|&b| b == b',')
            .map(<[u8]>::to_vec)
            .collect();
        let mut savedtype = 0u8;

        for srcspec in sources {
            let Ok((srcpath, srcname)) = self.resolve_spec(&srcspec) else {
                break;
            };
            let Some(dent) = self.first_match(srcpath, &srcname, FLAG_HIDDEN) else {
                break;
            };

            // REL and non-REL files don't concatenate
            if dent.file_type() == TYPE_REL {
                if savedtype != 0 && savedtype != TYPE_REL {
                    self.set_error(errors::FILE_TYPE_MISMATCH);
                    break;
                }
                self.fops_open_rel(srcpath, &dent, srcidx, 0, true);
            } else {
                if savedtype == TYPE_REL {
                    self.set_error(errors::FILE_TYPE_MISMATCH);
                    break;
                }
                self.fops_open_read(srcpath, &dent, srcidx);
            }
            if self.current_error != 0 {
                break;
            }

            // The first source selects the destination type
            if savedtype == 0 {
                savedtype = dent.file_type();
                let dstdent = CbmDirent::with_name(&dstname);
                if savedtype == TYPE_REL {
                    let reclen = self.bufs[srcidx].recordlen;
                    self.fops_open_rel(dstpath, &dstdent, dstidx, reclen, false);
                } else {
                    self.fops_open_write(dstpath, &dstdent, savedtype, dstidx, false);
                }
                if self.current_error != 0 {
                    break;
                }
            }

            loop {
                let src = &self.bufs[srcidx];
                let dst = &self.bufs[dstidx];
                let mut tocopy = if savedtype == TYPE_REL {
                    usize::from(src.recordlen)
                } else {
                    256 - usize::from(dst.position)
                };
                tocopy = tocopy
                    .min((usize::from(src.last_used) + 1).saturating_sub(usize::from(src.position)))
                    .min(256 - usize::from(dst.position));
                if tocopy == 0 {
                    break;
                }

                let from = usize::from(src.position);
                let to = usize::from(dst.position);
                let chunk: Vec<u8> = src.data[from..from + tocopy].to_vec();
                self.bufs[dstidx].data[to..to + tocopy].copy_from_slice(&chunk);
                self.mark_buffer_dirty(dstidx);

                self.bufs[srcidx].position =
                    self.bufs[srcidx].position.wrapping_add((tocopy - 1) as u8);
                self.bufs[dstidx].position = self.bufs[dstidx].position.wrapping_add(tocopy as u8);
                self.bufs[dstidx].last_used = self.bufs[dstidx].position.wrapping_sub(1);

                let src = &self.bufs[srcidx];
                if src.send_eoi && src.position == src.last_used {
                    break;
                }

                let at_end = src.position == src.last_used;
                self.bufs[srcidx].position = self.bufs[srcidx].position.wrapping_add(1);
                if (self.bufs[srcidx].recordlen != 0 || at_end) && self.refill(srcidx).is_err() {
                    self.cleanup_copy(srcidx, dstidx);
                    return;
                }
                if (self.bufs[dstidx].recordlen != 0 || self.bufs[dstidx].position == 0)
                    && self.refill(dstidx).is_err()
                {
                    self.cleanup_copy(srcidx, dstidx);
                    return;
                }
            }

            // Close the source and get a pristine buffer for the next one
            let _ = self.cleanup(srcidx);
            self.free_buffer(srcidx);
            match self.alloc_buffer() {
                Some(i) => srcidx = i,
                None => break,
            }
        }

        self.cleanup_copy(srcidx, dstidx);
    }

    fn cleanup_copy(&mut self, srcidx: usize, dstidx: usize) {
        let _ = self.cleanup(dstidx);
        let _ = self.cleanup(srcidx);
        self.free_buffer(dstidx);
        self.free_buffer(srcidx);
    }

    // ----- partition selection -----

    fn parse_changepart(&mut self, cmd: &[u8]) {
        let part = if cmd[1] == 0xd0 {
            // Binary variant (shift-P)
            usize::from(cmd[2].wrapping_sub(1))
        } else {
            let mut pos = 2;
            parse_partition(cmd, &mut pos, self.current_part)
        };

        if part >= self.parts.len() {
            self.set_error_ts(errors::PARTITION_ILLEGAL, part as u8 + 1, 0);
            return;
        }

        self.current_part = part;
        if self.globalflags.autoswap_active {
            self.clear_swaplist();
        }
        self.set_error_ts(errors::PARTITION_SELECTED, part as u8 + 1, 0);
    }

    // ----- direct media access -----

    fn parse_direct(&mut self, cmd: &[u8]) {
        let Some(idx) = self.find_buffer(cmd[2]) else {
            self.set_error(errors::NO_CHANNEL);
            return;
        };

        self.bufs[idx].position = 0;
        self.bufs[idx].last_used = 255;

        if self.blockdev.is_none() {
            self.set_error(errors::DRIVE_NOT_READY);
            return;
        }

        match cmd[1] {
            b'I' => {
                let page = cmd[4];
                let mut data = [0u8; 256];
                let dev = self.blockdev.as_mut().expect("checked above");
                if dev.info(page, &mut data).is_err() {
                    self.set_error(errors::DRIVE_NOT_READY);
                    return;
                }
                self.bufs[idx].data = data;
            }
            // Raw sectors are 512 bytes; without chained buffers they
            // don't fit a single channel buffer
            b'R' | b'W' => self.set_error(errors::BUFFER_TOO_SMALL),
            _ => self.set_error(errors::SYNTAX_UNABLE),
        }
    }

    // ----- NVRAM access -----

    fn parse_nvram(&mut self, cmd: &[u8], len: usize) {
        if len < 6 {
            self.set_error(errors::SYNTAX_UNKNOWN);
            return;
        }
        if cmd[1] != b'-' || (cmd[2] != b'W' && cmd[2] != b'R') {
            self.set_error(errors::SYNTAX_UNKNOWN);
            return;
        }

        let address = u16::from(cmd[3]) | (u16::from(cmd[4]) << 8);
        let length = cmd[5];

        if u32::from(address) + u32::from(length) > u32::from(self.nvram.len()) {
            self.set_error(errors::SYNTAX_TOOLONG);
            return;
        }

        if cmd[2] == b'W' {
            for i in 0..usize::from(length) {
                self.nvram.write(address + i as u16, cmd[6 + i]);
            }
        } else {
            if usize::from(length) > ERROR_BUFFER_SIZE {
                self.set_error(errors::SYNTAX_TOOLONG);
                return;
            }
            for i in 0..usize::from(length) {
                let value = self.nvram.read(address + i as u16);
                self.bufs[ERROR_CHANNEL].data[i] = value;
            }
            self.bufs[ERROR_CHANNEL].position = 0;
            self.bufs[ERROR_CHANNEL].last_used = length.wrapping_sub(1);
        }
    }

    // ----- partition info -----

    fn parse_getpartition(&mut self, cmd: &[u8], len: usize) {
        if len < 3 {
            return;
        }
        if cmd[1] != b'-' || cmd[2] != b'P' {
            self.set_error(errors::SYNTAX_UNKNOWN);
            return;
        }

        let part = if len == 3 {
            self.current_part + 1
        } else {
            usize::from(cmd[3])
        };
        if part == 0 || part > self.parts.len() {
            self.set_error(errors::PARTITION_ILLEGAL);
            return;
        }
        let part = part - 1;

        let mut label = [b' '; 16];
        if self.fops_disk_label(part, &mut label).is_err() {
            return;
        }

        let buf = &mut self.bufs[ERROR_CHANNEL];
        buf.data[..32].fill(0);
        buf.data[0] = 1; // Partition type: native
        buf.data[2] = part as u8 + 1;
        buf.data[3..19].copy_from_slice(&label);
        // FAT base and cluster count aren't visible through the
        // filesystem boundary; they read as zero
        buf.data[26] = 13;
        buf.position = 0;
        buf.last_used = 31;
    }

    // ----- initialize -----

    fn parse_initialize(&mut self) {
        if self.parts[self.current_part].fs.media_state() == MediaState::Missing {
            self.set_error_ts(errors::READ_NOSYNC, 18, 0);
        } else {
            self.free_user_buffers(true);
        }
    }

    // ----- memory commands -----

    fn parse_memory(&mut self, cmd: &[u8], len: usize) -> Option<Loader> {
        match cmd[2] {
            b'W' => {
                self.handle_memwrite(cmd, len);
                None
            }
            b'E' => self.handle_memexec(cmd, len),
            b'R' => {
                self.handle_memread(cmd, len);
                None
            }
            _ => {
                self.set_error(errors::SYNTAX_UNKNOWN);
                None
            }
        }
    }

    fn handle_memexec(&mut self, cmd: &[u8], len: usize) -> Option<Loader> {
        if len < 5 {
            return None;
        }

        let address = u16::from(cmd[3]) | (u16::from(cmd[4]) << 8);
        if self.detected_loader == Loader::None {
            log::debug!(target: "doscmd", "M-E at {address:#06x}, crc {:#06x}", self.datacrc);
        }
        self.datacrc = 0xffff;

        let loader = Loader::for_execute(self.detected_loader, address);
        self.detected_loader = Loader::None;
        loader
    }

    fn handle_memread(&mut self, cmd: &[u8], len: usize) {
        if len < 6 {
            return;
        }

        let address = u16::from(cmd[3]) | (u16::from(cmd[4]) << 8);
        for (magic, values) in C1541_MAGICS {
            if magic == address {
                self.bufs[ERROR_CHANNEL].data[0] = values[0];
                self.bufs[ERROR_CHANNEL].data[1] = values[1];
                break;
            }
        }

        // The host may ask for more bytes than we track; it gets
        // whatever the status buffer holds
        self.bufs[ERROR_CHANNEL].position = 0;
        self.bufs[ERROR_CHANNEL].last_used = cmd[5].wrapping_sub(1);
    }

    fn handle_memwrite(&mut self, cmd: &[u8], len: usize) {
        if len < 6 {
            return;
        }

        let address = u16::from(cmd[3]) | (u16::from(cmd[4]) << 8);
        let length = cmd[5];

        if address == 119 {
            // Device address change, 1541 style
            self.device_address = cmd[6] & 0x1f;
            return;
        }

        if address == 0x1c06 || address == 0x1c07 {
            // Attempts to raise the VIA timer frequency are ignored
            return;
        }

        // Turbodisk sends the file name in its final M-W, so the
        // matching CRC is the one *before* this block
        if self.datacrc == 0x9c9f {
            self.detected_loader = Loader::Turbodisk;
        } else if self.detected_loader != Loader::GiJoe {
            self.detected_loader = Loader::None;
        }

        for i in 0..usize::from(length) {
            let byte = cmd[6 + i];
            self.datacrc = crc16_update(self.datacrc, byte);
            // Identical code, but lots of different upload variations
            if self.datacrc == 0x38a2 && byte == 0x60 {
                self.detected_loader = Loader::GiJoe;
            }
        }

        match self.datacrc {
            // 0x6510 is an FC3 cart, 0x7e38 a protocol-compatible EXOS v3
            0x6510 | 0x7e38 => self.detected_loader = Loader::Fc3Load,
            0x2c86 => self.detected_loader = Loader::Fc3Save,
            0x9930 => self.detected_loader = Loader::Fc3Freezed,
            0x2e69 => self.detected_loader = Loader::Dreamload,
            0xdd81 => self.detected_loader = Loader::ULoad3,
            0x5a01 => self.detected_loader = Loader::EpyxCart,
            _ => {}
        }

        if self.detected_loader == Loader::None {
            log::debug!(target: "doscmd", "M-W crc result: {:#06x}", self.datacrc);
        }
    }

    // ----- format -----

    fn parse_new(&mut self, cmd: &[u8], len: usize) {
        let mut pos = 1;
        let part = parse_partition(cmd, &mut pos, self.current_part);
        let Some(colon) = cmd[..len].iter().position(|&b| b == b':') else {
            self.set_error(errors::SYNTAX_NONAME);
            return;
        };
        if part >= self.parts.len() {
            self.set_error_ts(errors::PARTITION_ILLEGAL, part as u8 + 1, 0);
            return;
        }

        let rest = &cmd[colon + 1..len];
        let (name, id) = match rest.iter().position(|&b| b == b',') {
            Some(comma) => (&rest[..comma], Some(&rest[comma + 1..])),
            None => (rest, None),
        };
        self.fops_format(part, name, id);
    }

    // ----- position -----

    fn parse_position(&mut self, cmd: &[u8], len: usize) {
        if len < 2 {
            self.set_error(errors::NO_CHANNEL);
            return;
        }
        let Some(idx) = self.find_buffer(cmd[1] & 0x0f) else {
            self.set_error(errors::NO_CHANNEL);
            return;
        };

        if self.bufs[idx].recordlen != 0 {
            let recordlen = self.bufs[idx].recordlen;
            let lo = if len > 2 { cmd[2] } else { 1 };
            let hi = if len > 3 { cmd[3] } else { 0 };
            let pos = if len > 4 { cmd[4] } else { 1 };

            if pos >= recordlen {
                self.set_error(errors::RECORD_OVERFLOW);
                return;
            }

            let record = (u32::from(hi) * 256 + u32::from(lo)).saturating_sub(1);
            let _ = self.seek_buffer(idx, record * u32::from(recordlen), pos.saturating_sub(1));
        } else {
            let offset = u32::from(cmd[2])
                | (u32::from(cmd[3]) << 8)
                | (u32::from(cmd[4]) << 16)
                | (u32::from(cmd[5]) << 24);
            let _ = self.seek_buffer(idx, offset, 0);
        }
    }

    // ----- rename -----

    fn parse_rename(&mut self, cmd: &[u8], len: usize) {
        let Some(eq) = cmd[..len].iter().position(|&b| b == b'=') else {
            self.set_error(errors::SYNTAX_UNKNOWN);
            return;
        };

        let Ok((newpath, newname)) = self.resolve_spec(&cmd[1..eq]) else {
            return;
        };
        let Ok((oldpath, oldname)) = self.resolve_spec(&cmd[eq + 1..len]) else {
            return;
        };

        // Rename can't move files between directories
        if oldpath != newpath {
            self.set_error(errors::FILE_NOT_FOUND);
            return;
        }
        if check_invalid_name(&newname) {
            self.set_error(errors::SYNTAX_UNKNOWN);
            return;
        }
        if newname.is_empty() {
            self.set_error(errors::SYNTAX_NONAME);
            return;
        }

        // The new name must be free
        let Ok(mut cursor) = self.fops_opendir(newpath) else {
            return;
        };
        match self.next_match(newpath.part, &mut cursor, Some(&newname), FLAG_HIDDEN) {
            Ok(Some(_)) => {
                self.set_error(errors::FILE_EXISTS);
                return;
            }
            Ok(None) => {}
            Err(()) => return,
        }
        self.set_error(errors::OK);

        let Some(dent) = self.first_match(oldpath, &oldname, FLAG_HIDDEN) else {
            return;
        };
        self.fops_rename(oldpath, &dent, &newname);
    }

    // ----- scratch -----

    fn parse_scratch(&mut self, cmd: &[u8], len: usize) {
        let mut count: u8 = 0;

        for spec in cmd[1..len].split(|&b| b == b',') {
            let Ok((path, name)) = self.resolve_spec(spec) else {
                return;
            };

            // Collect matches first; deleting while walking would skip
            // entries on some backends
            let Ok(mut cursor) = self.fops_opendir(path) else {
                return;
            };
            let mut matches = Vec::new();
            loop {
                match self.next_match(path.part, &mut cursor, Some(&name), FLAG_HIDDEN) {
                    Ok(Some(dent)) => {
                        if dent.file_type() != TYPE_DIR {
                            matches.push(dent);
                        }
                    }
                    Ok(None) => break,
                    Err(()) => return,
                }
            }

            for dent in matches {
                let removed = self.fops_delete(path, &dent);
                if removed == 255 {
                    return;
                }
                count += removed;
            }
        }

        self.set_error_ts(errors::SCRATCHED, count, 0);
    }

    // ----- time -----

    fn parse_time(&mut self, cmd: &[u8], len: usize) {
        if self.rtc.state() == RtcState::NotFound {
            self.set_error(errors::SYNTAX_UNKNOWN);
            return;
        }
        match cmd[2] {
            b'R' => self.parse_timeread(cmd),
            b'W' => self.parse_timewrite(cmd, len),
            _ => self.set_error(errors::SYNTAX_UNKNOWN),
        }
    }

    fn parse_timeread(&mut self, cmd: &[u8]) {
        if self.rtc.state() != RtcState::Ok {
            self.set_error(errors::SYNTAX_UNABLE);
            return;
        }

        let time = self.rtc.read();
        let mut hour = time.hour % 12;
        if hour == 0 {
            hour = 12;
        }

        let buf = &mut self.bufs[ERROR_CHANNEL];
        buf.position = 0;
        match cmd[3] {
            b'A' => {
                buf.data[4..4 + ASCIITIME_SKEL.len()].copy_from_slice(ASCIITIME_SKEL);
                let dow = usize::from(time.wday) * 4;
                buf.data[..4].copy_from_slice(&DOW_NAMES[dow..dow + 4]);
                put_number(&mut buf.data, 5, time.month + 1);
                put_number(&mut buf.data, 8, time.mday);
                put_number(&mut buf.data, 11, (time.year % 100) as u8);
                put_number(&mut buf.data, 14, hour);
                put_number(&mut buf.data, 17, time.min);
                put_number(&mut buf.data, 20, time.sec);
                buf.data[23] = if time.hour < 12 { b'A' } else { b'P' };
                buf.last_used = 25;
            }
            b'B' => {
                buf.data[0] = time.wday;
                buf.data[1] = int2bcd((time.year % 100) as u8);
                buf.data[2] = int2bcd(time.month + 1);
                buf.data[3] = int2bcd(time.mday);
                buf.data[4] = int2bcd(hour);
                buf.data[5] = int2bcd(time.min);
                buf.data[6] = int2bcd(time.sec);
                buf.data[7] = u8::from(time.hour >= 12);
                buf.data[8] = 13;
                buf.last_used = 8;
            }
            b'D' => {
                buf.data[0] = time.wday;
                buf.data[1] = time.year as u8;
                buf.data[2] = time.month + 1;
                buf.data[3] = time.mday;
                buf.data[4] = hour;
                buf.data[5] = time.min;
                buf.data[6] = time.sec;
                buf.data[7] = u8::from(time.hour >= 12);
                buf.data[8] = 13;
                buf.last_used = 8;
            }
            _ => self.set_error(errors::SYNTAX_UNKNOWN),
        }
    }

    fn parse_timewrite(&mut self, cmd: &[u8], len: usize) {
        let mut time = RtcTime {
            year: 0,
            month: 0,
            mday: 0,
            wday: 0,
            hour: 0,
            min: 0,
            sec: 0,
        };

        match cmd[3] {
            b'A' => {
                // Dropping the AM/PM marker for 24h format is allowed
                if len < 27 {
                    self.set_error(errors::SYNTAX_UNABLE);
                    return;
                }
                let Some(wday) = (0..7).find(|&d| cmd[4..8] == DOW_NAMES[d * 4..d * 4 + 4]) else {
                    self.set_error(errors::SYNTAX_UNKNOWN);
                    return;
                };
                time.wday = wday as u8;
                let mut pos = 9;
                time.month = parse_number(cmd, &mut pos).wrapping_sub(1);
                pos += 1;
                time.mday = parse_number(cmd, &mut pos);
                pos += 1;
                time.year = u16::from(parse_number(cmd, &mut pos));
                pos += 1;
                time.hour = parse_number(cmd, &mut pos);
                pos += 1;
                time.min = parse_number(cmd, &mut pos);
                pos += 1;
                time.sec = parse_number(cmd, &mut pos);
                if cmd[28] == b'M' {
                    // Adjust for AM/PM only if a marker is present
                    if time.hour == 12 {
                        time.hour = 0;
                    }
                    if cmd[27] == b'P' {
                        time.hour += 12;
                    }
                }
            }
            b'B' => {
                if len < 12 {
                    self.set_error(errors::SYNTAX_UNABLE);
                    return;
                }
                time.wday = cmd[4];
                time.year = u16::from(bcd2int(cmd[5]));
                time.month = bcd2int(cmd[6]).wrapping_sub(1);
                time.mday = bcd2int(cmd[7]);
                time.hour = bcd2int(cmd[8]);
                if time.hour == 12 {
                    time.hour = 0;
                }
                time.min = bcd2int(cmd[9]);
                time.sec = bcd2int(cmd[10]);
                if cmd[11] != 0 {
                    time.hour += 12;
                }
            }
            b'D' => {
                if len < 12 {
                    self.set_error(errors::SYNTAX_UNABLE);
                    return;
                }
                time.wday = cmd[4];
                time.year = u16::from(cmd[5]);
                time.month = cmd[6].wrapping_sub(1);
                time.mday = cmd[7];
                time.hour = cmd[8];
                if time.hour == 12 {
                    time.hour = 0;
                }
                time.min = cmd[9];
                time.sec = cmd[10];
                if cmd[11] != 0 {
                    time.hour += 12;
                }
            }
            _ => {
                self.set_error(errors::SYNTAX_UNKNOWN);
                return;
            }
        }

        // Y2K fix for legacy apps
        if time.year < 80 {
            time.year += 100;
        }

        // The CMD drives don't validate, we do - partially
        if time.mday == 0
            || time.mday > 31
            || time.month > 11
            || time.wday > 6
            || time.hour > 23
            || time.min > 59
            || time.sec > 59
        {
            self.set_error(errors::SYNTAX_UNABLE);
            return;
        }

        self.rtc.write(&time);
    }

    // ----- U commands -----

    fn parse_user(&mut self, cmd: &[u8], len: usize) {
        match cmd[1] {
            b'A' | b'1' => {
                // Rewrite as B-R; parse_block starts looking after the dash
                let mut rewritten = cmd.to_vec();
                rewritten[0] = b'-';
                rewritten[1] = b'R';
                self.parse_block(&rewritten);
            }
            b'B' | b'2' => {
                let mut rewritten = cmd.to_vec();
                rewritten[0] = b'-';
                rewritten[1] = b'W';
                self.parse_block(&rewritten);
            }
            b'I' | b'9' => {
                if len == 2 {
                    // Soft reset: just the version message
                    self.set_error(errors::DOSVERSION);
                    return;
                }
                match cmd[2] {
                    b'+' => self.flags.vc20mode = false,
                    b'-' => self.flags.vc20mode = true,
                    _ => self.set_error(errors::SYNTAX_UNKNOWN),
                }
            }
            b'J' | b':' | 202 => {
                // Reset; Ultima 5 sends UJ and expects the version string
                self.free_user_buffers(false);
                self.set_error(errors::DOSVERSION);
            }
            b'0' => {
                if cmd[2] & 0x1f == 0x1e && (4..=30).contains(&cmd[3]) {
                    self.device_address = cmd[3];
                } else {
                    self.set_error(errors::SYNTAX_UNKNOWN);
                }
            }
            _ => self.set_error(errors::SYNTAX_UNKNOWN),
        }
    }

    // ----- X extension commands -----

    fn parse_bool(&mut self, cmd: &[u8]) -> Option<bool> {
        match cmd[2] {
            b'+' => Some(true),
            b'-' => Some(false),
            _ => {
                self.set_error(errors::SYNTAX_UNKNOWN);
                None
            }
        }
    }

    fn parse_xcommand(&mut self, cmd: &[u8], len: usize) {
        let address = self.device_address;
        match cmd[1] {
            b'B' => {
                // Free-block count faking on FAT32
                if let Some(value) = self.parse_bool(cmd) {
                    self.globalflags.fat32_freeblocks = value;
                    self.set_error_ts(errors::STATUS, address, 0);
                }
            }
            b'E' => {
                // File extension mode
                match cmd[2] {
                    b'+' => self.globalflags.extension_hiding = true,
                    b'-' => self.globalflags.extension_hiding = false,
                    _ => {
                        let mut pos = 2;
                        let num = parse_number(cmd, &mut pos);
                        if num > 4 {
                            self.set_error(errors::SYNTAX_UNKNOWN);
                            return;
                        }
                        self.file_extension_mode = num;
                        if num >= 3 {
                            self.globalflags.extension_hiding = true;
                        }
                    }
                }
                self.set_error_ts(errors::STATUS, address, 0);
            }
            b'D' => {
                // Drive mux configuration needs multi-device hardware
                self.set_error(errors::SYNTAX_UNKNOWN);
            }
            b'I' => {
                // Image-as-directory mode
                let mut pos = 2;
                let num = parse_number(cmd, &mut pos);
                if num <= 2 {
                    self.image_as_dir = num;
                } else {
                    self.set_error(errors::SYNTAX_UNKNOWN);
                }
            }
            b'W' => {
                self.write_configuration();
                self.set_error_ts(errors::STATUS, address, 0);
            }
            b'S' => {
                let Ok((path, name)) = self.resolve_spec(&cmd[2..len]) else {
                    return;
                };
                self.set_changelist(path, &name);
            }
            b'*' => {
                if let Some(value) = self.parse_bool(cmd) {
                    self.globalflags.postmatch = value;
                    self.set_error_ts(errors::STATUS, address, 0);
                }
            }
            b'?' => self.set_error_longversion(),
            _ => self.set_error_ts(errors::STATUS, address, 0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drive::tests::{drive_with_files, test_drive};
    use drive_core::SimRtc;

    fn run(drive: &mut Drive<drive_core::MemStore>, command: &[u8]) {
        drive.set_command(command);
        drive.execute_command();
    }

    #[test]
    fn unknown_command_sets_30() {
        let mut drive = test_drive();
        run(&mut drive, b"Q");
        assert_eq!(drive.error_code(), errors::SYNTAX_UNKNOWN);
    }

    #[test]
    fn empty_command_sets_31() {
        let mut drive = test_drive();
        run(&mut drive, b"");
        assert_eq!(drive.error_code(), errors::SYNTAX_UNABLE);
    }

    #[test]
    fn trailing_cr_is_ignored() {
        let mut drive = test_drive();
        run(&mut drive, b"UI");
        let status1 = drive.status_line().to_vec();
        run(&mut drive, b"UI\r");
        assert_eq!(drive.status_line(), status1);
    }

    #[test]
    fn ui_reports_version() {
        let mut drive = test_drive();
        run(&mut drive, b"UI");
        assert_eq!(drive.error_code(), errors::DOSVERSION);
    }

    #[test]
    fn ui_toggles_vc20_timing() {
        let mut drive = test_drive();
        run(&mut drive, b"UI-");
        assert!(drive.flags.vc20mode);
        run(&mut drive, b"UI+");
        assert!(!drive.flags.vc20mode);
    }

    #[test]
    fn uj_frees_buffers_and_reports_version() {
        let mut drive = test_drive();
        drive.set_command(b"#");
        drive.file_open(2);
        assert!(drive.find_buffer(2).is_some());
        run(&mut drive, b"UJ");
        assert_eq!(drive.find_buffer(2), None);
        assert_eq!(drive.error_code(), errors::DOSVERSION);
    }

    #[test]
    fn u0_changes_device_address() {
        let mut drive = test_drive();
        run(&mut drive, &[b'U', b'0', 0x3e, 9]);
        assert_eq!(drive.address(), 9);
        run(&mut drive, &[b'U', b'0', 0x3e, 31]);
        assert_eq!(drive.error_code(), errors::SYNTAX_UNKNOWN);
        assert_eq!(drive.address(), 9);
    }

    #[test]
    fn scratch_with_wildcard_reports_count() {
        let mut drive =
            drive_with_files(&[("ALPHA", b"1"), ("APPLE", b"2"), ("BANANA", b"3")]);
        run(&mut drive, b"S0:A*");
        assert_eq!(drive.status_line(), b"01,FILES SCRATCHED,02,00\r");
        assert!(drive.filesystem(0).file_data(0, "ALPHA").is_none());
        assert!(drive.filesystem(0).file_data(0, "APPLE").is_none());
        assert!(drive.filesystem(0).file_data(0, "BANANA").is_some());
    }

    #[test]
    fn rename_within_directory() {
        let mut drive = drive_with_files(&[("OLD", b"data")]);
        run(&mut drive, b"R:NEW=OLD");
        assert_eq!(drive.error_code(), 0);
        assert!(drive.filesystem(0).file_data(0, "NEW").is_some());
        assert!(drive.filesystem(0).file_data(0, "OLD").is_none());
    }

    #[test]
    fn rename_to_existing_sets_63() {
        let mut drive = drive_with_files(&[("A", b"1"), ("B", b"2")]);
        run(&mut drive, b"R:B=A");
        assert_eq!(drive.error_code(), errors::FILE_EXISTS);
    }

    #[test]
    fn copy_concatenates_sources() {
        let mut drive = drive_with_files(&[("ONE", b"first"), ("TWO", b"second")]);
        run(&mut drive, b"C:BOTH=ONE,TWO");
        assert_eq!(drive.error_code(), 0);
        assert_eq!(
            drive.filesystem(0).file_data(0, "BOTH").expect("copy"),
            b"firstsecond"
        );
    }

    #[test]
    fn copy_to_existing_sets_63() {
        let mut drive = drive_with_files(&[("SRC", b"x"), ("DST", b"y")]);
        run(&mut drive, b"C:DST=SRC");
        assert_eq!(drive.error_code(), errors::FILE_EXISTS);
    }

    #[test]
    fn mkdir_chdir_rmdir_cycle() {
        let mut drive = test_drive();
        run(&mut drive, b"MD:GAMES");
        assert_eq!(drive.error_code(), 0);

        run(&mut drive, b"CD:GAMES");
        assert_eq!(drive.error_code(), 0);
        assert_ne!(drive.parts[0].current_dir, 0);

        run(&mut drive, b"CD:_");
        assert_eq!(drive.parts[0].current_dir, 0);

        run(&mut drive, b"RD:GAMES");
        assert_eq!(drive.status_line(), b"01,FILES SCRATCHED,01,00\r");
    }

    #[test]
    fn cd_into_image_mounts_it() {
        let mut drive = test_drive();
        drive
            .filesystem_mut(0)
            .add_file(0, "DISK.D64", &vec![0u8; format_d64::D64_SIZE]);
        run(&mut drive, b"CD:DISK.D64");
        assert_eq!(drive.error_code(), 0);
        assert!(matches!(drive.parts[0].mount, Mount::D64 { .. }));

        // Left arrow unmounts
        run(&mut drive, b"CD:_");
        assert!(matches!(drive.parts[0].mount, Mount::Fat));
    }

    #[test]
    fn block_commands_work_on_hash_channel() {
        let mut drive = test_drive();
        drive
            .filesystem_mut(0)
            .add_file(0, "DISK.D64", &vec![0u8; format_d64::D64_SIZE]);
        run(&mut drive, b"CD:DISK.D64");

        drive.set_command(b"#");
        drive.file_open(2);

        // Write a recognisable sector through U2
        let idx = drive.find_buffer(2).expect("buffer");
        drive.bufs[idx].data = [0x42; 256];
        run(&mut drive, &[b'U', b'2', b':', b'2', b',', b'0', b',', b'1', b',', b'0']);
        assert_eq!(drive.error_code(), 0);

        // Read it back through U1
        let idx = drive.find_buffer(2).expect("buffer");
        drive.bufs[idx].data = [0; 256];
        run(&mut drive, &[b'U', b'1', b':', b'2', b',', b'0', b',', b'1', b',', b'0']);
        assert_eq!(drive.error_code(), 0);
        let idx = drive.find_buffer(2).expect("buffer");
        assert_eq!(drive.bufs[idx].data[10], 0x42);
        assert_eq!(drive.bufs[idx].position, 0);
        assert_eq!(drive.bufs[idx].last_used, 255);
    }

    #[test]
    fn buffer_position_command() {
        let mut drive = test_drive();
        drive.set_command(b"#");
        drive.file_open(3);
        run(&mut drive, &[b'B', b'-', b'P', b' ', b'3', b',', b'7', b'0']);
        let idx = drive.find_buffer(3).expect("buffer");
        assert_eq!(drive.bufs[idx].position, 70);
    }

    #[test]
    fn block_command_without_channel_sets_70() {
        let mut drive = test_drive();
        run(&mut drive, b"B-R:5,0,1,0");
        assert_eq!(drive.error_code(), errors::NO_CHANNEL);
    }

    #[test]
    fn memory_write_arms_turbodisk() {
        let mut drive = test_drive();
        // Find a payload whose CRC-16/CCITT lands on 0x9c9f: brute
        // force a two-byte tail over a fixed prefix
        let mut payload = vec![0x20u8; 6];
        'outer: for a in 0..=255u8 {
            for b in 0..=255u8 {
                payload[4] = a;
                payload[5] = b;
                let mut crc = 0xffffu16;
                for &byte in &payload {
                    crc = crc16_update(crc, byte);
                }
                if crc == 0x9c9f {
                    break 'outer;
                }
            }
        }

        let mut command = vec![b'M', b'-', b'W', 0x00, 0x03, payload.len() as u8];
        command.extend_from_slice(&payload);
        run(&mut drive, &command);
        assert_eq!(drive.loader(), Loader::None);

        // The *next* M-W sees the matching CRC and arms Turbodisk
        run(&mut drive, &[b'M', b'-', b'W', 0x00, 0x03, 0]);
        assert_eq!(drive.loader(), Loader::Turbodisk);
    }

    #[test]
    fn memory_execute_dispatches_and_resets() {
        let mut drive = test_drive();
        drive.detected_loader = Loader::Turbodisk;
        drive.set_command(&[b'M', b'-', b'E', 0x03, 0x03]);
        let loader = drive.execute_command();
        assert_eq!(loader, Some(Loader::Turbodisk));
        assert_eq!(drive.loader(), Loader::None);
        assert_eq!(drive.datacrc, 0xffff);

        // Address mismatch enters nothing
        drive.detected_loader = Loader::Turbodisk;
        drive.set_command(&[b'M', b'-', b'E', 0x00, 0x10]);
        assert_eq!(drive.execute_command(), None);
    }

    #[test]
    fn memory_write_changes_device_address() {
        let mut drive = test_drive();
        run(&mut drive, &[b'M', b'-', b'W', 119, 0, 1, 11]);
        assert_eq!(drive.address(), 11);
    }

    #[test]
    fn memory_read_returns_magic_values() {
        let mut drive = test_drive();
        run(&mut drive, &[b'M', b'-', b'R', 0xa0, 0xfe, 2]);
        let buf = &drive.bufs[ERROR_CHANNEL];
        assert_eq!(buf.data[0], 0x0d);
        assert_eq!(buf.data[1], 0xed);
        assert_eq!(buf.last_used, 1);
    }

    #[test]
    fn nvram_round_trip() {
        let nvram = drive_core::SharedNvram::new(64);
        let mut config = crate::drive::DriveConfig::default();
        config.nvram = Box::new(nvram.clone());
        let mut drive = Drive::new(vec![drive_core::MemStore::new("T")], config);

        run(&mut drive, &[b'E', b'-', b'W', 10, 0, 3, 0xaa, 0xbb, 0xcc]);
        assert_eq!(drive.error_code(), 0);
        assert_eq!(&nvram.contents()[10..13], &[0xaa, 0xbb, 0xcc]);

        run(&mut drive, &[b'E', b'-', b'R', 10, 0, 3]);
        assert_eq!(drive.channel_read_all(15), &[0xaa, 0xbb, 0xcc]);
    }

    #[test]
    fn nvram_out_of_range_sets_32() {
        let mut drive = test_drive();
        run(&mut drive, &[b'E', b'-', b'R', 0xff, 0xff, 4]);
        assert_eq!(drive.error_code(), errors::SYNTAX_TOOLONG);
    }

    #[test]
    fn partition_info_reply() {
        let mut drive = test_drive();
        run(&mut drive, b"G-P");
        let buf = &drive.bufs[ERROR_CHANNEL];
        assert_eq!(buf.data[0], 1);
        assert_eq!(buf.data[2], 1);
        assert_eq!(&buf.data[3..11], b"TESTDISK");
        assert_eq!(buf.data[26], 13);
        assert_eq!(buf.last_used, 31);
    }

    #[test]
    fn change_partition_validates_range() {
        let mut drive = test_drive();
        run(&mut drive, b"CP2");
        assert_eq!(drive.error_code(), errors::PARTITION_ILLEGAL);
        run(&mut drive, b"CP1");
        assert_eq!(drive.status_line(), b"02,PARTITION SELECTED,01,00\r");
    }

    #[test]
    fn time_commands_without_rtc_set_30() {
        let mut drive = test_drive();
        run(&mut drive, b"T-RA");
        assert_eq!(drive.error_code(), errors::SYNTAX_UNKNOWN);
    }

    #[test]
    fn time_read_ascii_format() {
        let time = RtcTime {
            year: 108,
            month: 4,
            mday: 20,
            wday: 2,
            hour: 15,
            min: 4,
            sec: 32,
        };
        let mut config = crate::drive::DriveConfig::default();
        config.rtc = Box::new(SimRtc::running(time));
        let mut drive = Drive::new(vec![drive_core::MemStore::new("T")], config);

        run(&mut drive, b"T-RA");
        assert_eq!(drive.error_code(), 0);
        let reply = drive.channel_read_all(15);
        assert_eq!(&reply, b"TUES 05/20/08 03:04:32 PM\r");
    }

    #[test]
    fn time_write_decimal_round_trip() {
        let mut config = crate::drive::DriveConfig::default();
        config.rtc = Box::new(SimRtc::running(RtcTime::fallback()));
        let mut drive = Drive::new(vec![drive_core::MemStore::new("T")], config);

        // Tuesday 2008-05-20 15:04:32 (12h format: 3 PM)
        run(
            &mut drive,
            &[b'T', b'-', b'W', b'D', 2, 8, 5, 20, 3, 4, 32, 1],
        );
        assert_eq!(drive.error_code(), 0);

        run(&mut drive, b"T-RD");
        let reply = drive.channel_read_all(15);
        assert_eq!(reply, &[2, 108, 5, 20, 3, 4, 32, 1, 13]);
    }

    #[test]
    fn time_write_validates_fields() {
        let mut config = crate::drive::DriveConfig::default();
        config.rtc = Box::new(SimRtc::running(RtcTime::fallback()));
        let mut drive = Drive::new(vec![drive_core::MemStore::new("T")], config);
        run(
            &mut drive,
            &[b'T', b'-', b'W', b'D', 9, 8, 5, 20, 3, 4, 32, 1],
        );
        assert_eq!(drive.error_code(), errors::SYNTAX_UNABLE);
    }

    #[test]
    fn extension_mode_command() {
        let mut drive = test_drive();
        run(&mut drive, b"XE+");
        assert!(drive.globalflags.extension_hiding);
        assert_eq!(drive.error_code(), errors::STATUS);
        run(&mut drive, b"XE-");
        assert!(!drive.globalflags.extension_hiding);
        run(&mut drive, b"XE4");
        assert_eq!(drive.file_extension_mode, 4);
        assert!(drive.globalflags.extension_hiding);
        run(&mut drive, b"XE9");
        assert_eq!(drive.error_code(), errors::SYNTAX_UNKNOWN);
    }

    #[test]
    fn postmatch_command_toggles_flag() {
        let mut drive = test_drive();
        run(&mut drive, b"X*+");
        assert!(drive.globalflags.postmatch);
        run(&mut drive, b"X*-");
        assert!(!drive.globalflags.postmatch);
    }

    #[test]
    fn long_version_command() {
        let mut drive = test_drive();
        run(&mut drive, b"X?");
        assert!(drive.status_line().starts_with(b"73,CBMDRIVE"));
        let line = drive.status_line().to_vec();
        assert!(line.windows(5).any(|w| w == b"/RUST"));
    }

    #[test]
    fn initialize_frees_buffers() {
        let mut drive = test_drive();
        drive.set_command(b"#");
        drive.file_open(4);
        run(&mut drive, b"I");
        assert_eq!(drive.find_buffer(4), None);
    }

    #[test]
    fn direct_commands_without_blockdev() {
        let mut drive = test_drive();
        drive.set_command(b"#");
        drive.file_open(2);
        run(&mut drive, &[b'D', b'I', 2, 0, 0, 0, 0, 0]);
        assert_eq!(drive.error_code(), errors::DRIVE_NOT_READY);
    }
}
