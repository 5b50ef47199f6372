//! Fastloader detection and protocol drivers.
//!
//! Custom loaders announce themselves through the CRC of the drive code
//! they upload with `M-W`, then enter through `M-E` at a protocol-
//! specific address. Both tables are part of the external contract.
//! While a loader runs it owns the bus; it returns to the normal state
//! machine on its end marker, on ATN, or on a user key press.

pub mod wire;

use crc::{CRC_16_IBM_3740, Crc};
use drive_core::{FileStore, KEY_HOME, KEY_NEXT, KEY_PREV, KEY_SLEEP, TimedIecPort};

use crate::drive::Drive;
use crate::status::errors;

/// CRC-16/CCITT-FALSE, the polynomial the detection table is built on.
const DETECT_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

/// Fold one byte into the running detection CRC.
#[must_use]
pub fn crc16_update(crc: u16, byte: u8) -> u16 {
    let mut digest = DETECT_CRC.digest_with_initial(crc);
    digest.update(&[byte]);
    digest.finalize()
}

/// The fastloader protocols the dispatcher knows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Loader {
    #[default]
    None,
    Turbodisk,
    Fc3Load,
    Fc3Save,
    Fc3Freezed,
    Dreamload,
    /// Older Dreamload revision, jobcodes on ATN edges.
    DreamloadOld,
    ULoad3,
    GiJoe,
    EpyxCart,
}

impl Loader {
    /// Match a detected loader against an `M-E` entry address.
    #[must_use]
    pub fn for_execute(detected: Loader, address: u16) -> Option<Loader> {
        match (detected, address) {
            (Loader::Turbodisk, 0x0303) => Some(Loader::Turbodisk),
            // FC3 LOAD uses 0x059a, EXOS uses 0x0400
            (Loader::Fc3Load, 0x059a | 0x0400) => Some(Loader::Fc3Load),
            (Loader::Fc3Save, 0x059c) => Some(Loader::Fc3Save),
            (Loader::Fc3Freezed, 0x0403) => Some(Loader::Fc3Freezed),
            (Loader::Dreamload, 0x0700) => Some(Loader::Dreamload),
            (Loader::ULoad3, 0x0336) => Some(Loader::ULoad3),
            (Loader::GiJoe, 0x0500) => Some(Loader::GiJoe),
            (Loader::EpyxCart, 0x01a9) => Some(Loader::EpyxCart),
            _ => None,
        }
    }
}

impl<F: FileStore> Drive<F> {
    /// Poll the user keys from inside a loader loop.
    ///
    /// Disk-change keys swap media; returns `true` on the sleep key,
    /// which aborts the loader.
    fn check_keys(&mut self) -> bool {
        if self.ui.key_pressed(KEY_NEXT | KEY_PREV | KEY_HOME) {
            self.handle_swap_keys();
        }
        if self.ui.key_pressed(KEY_SLEEP) {
            self.ui.reset_key(KEY_SLEEP);
            self.ui.busy_led(false);
            self.ui.dirty_led(true);
            return true;
        }
        false
    }

    /// Enter a fastloader after a matching `M-E`.
    pub fn run_loader(&mut self, port: &mut impl TimedIecPort, loader: Loader) {
        log::debug!(target: "fastloader", "entering {loader:?}");
        match loader {
            Loader::None => {}
            Loader::Turbodisk => self.load_turbodisk(port),
            Loader::Fc3Load => self.load_fc3(port, false),
            Loader::Fc3Save => self.save_fc3(port),
            Loader::Fc3Freezed => self.load_fc3(port, true),
            Loader::Dreamload | Loader::DreamloadOld => self.load_dreamload(port),
            Loader::ULoad3 => self.load_uload3(port),
            Loader::GiJoe => self.load_gijoe(port),
            Loader::EpyxCart => self.load_epyxcart(port),
        }
    }

    // --- Turbodisk ---

    fn load_turbodisk(&mut self, port: &mut impl TimedIecPort) {
        if !port.stable_clock() {
            // The bit times are too tight for an uncalibrated clock
            self.set_error(errors::CLOCK_UNSTABLE);
            return;
        }

        port.set_clock(false);

        // The file name rides at the end of the final M-W command
        let len = usize::from(*self.command.get(9).unwrap_or(&0));
        let name: Vec<u8> = self
            .command
            .iter()
            .skip(10)
            .take(len)
            .copied()
            .collect();
        self.set_command(&name);
        self.file_open(0);

        let Some(idx) = self.find_buffer(0) else {
            wire::turbodisk_byte(port, 0xff);
            port.set_clock(true);
            port.set_data(true);
            return;
        };

        let mut first_sector = true;
        loop {
            // Status byte: 0 marks the final block
            if self.bufs[idx].send_eoi {
                wire::turbodisk_byte(port, 0);
            } else {
                wire::turbodisk_byte(port, 1);
            }

            if first_sector {
                // The load address is transferred separately
                let pos = usize::from(self.bufs[idx].position);
                wire::turbodisk_byte(port, self.bufs[idx].data[pos]);
                wire::turbodisk_byte(port, self.bufs[idx].data[pos + 1]);
                self.bufs[idx].position += 2;
                first_sector = false;
            }

            if self.bufs[idx].send_eoi {
                // The last sector goes out byte by byte
                let position = self.bufs[idx].position;
                let last_used = self.bufs[idx].last_used;
                wire::turbodisk_byte(port, last_used.wrapping_sub(position).wrapping_add(2));
                for i in position..=last_used {
                    wire::turbodisk_byte(port, self.bufs[idx].data[usize::from(i)]);
                }
                break;
            }

            // Blocks are always 254 bytes on the wire; the first one
            // starts past the load address and gets padded out
            let pos = usize::from(self.bufs[idx].position);
            let mut chunk: Vec<u8> = self.bufs[idx].data[pos..].to_vec();
            chunk.resize(254, 0);
            wire::turbodisk_buffer(port, &chunk);
            if self.refill(idx).is_err() {
                wire::turbodisk_byte(port, 0xff);
                break;
            }
        }

        let _ = self.cleanup(idx);
        self.free_buffer(idx);
        port.set_clock(true);
    }

    // --- Final Cartridge 3 ---

    fn load_fc3(&mut self, port: &mut impl TimedIecPort, freezed: bool) {
        let Some(idx) = self.find_buffer(0) else {
            // Inform the host by pulling both lines down
            port.set_clock(false);
            port.set_data(false);
            return;
        };

        // Make sure the host VIC DMA is off
        port.delay_us(20_000);

        let mut sector_counter = 0u8;
        'transfer: loop {
            if !wire::clk_data_handshake(port) {
                break;
            }

            // First block: status, sector counter, length, first byte
            let mut pos: u8 = 2;
            let mut block = [0u8; 4];
            block[1] = sector_counter;
            sector_counter = sector_counter.wrapping_add(1);
            block[2] = if self.bufs[idx].send_eoi {
                self.bufs[idx].last_used
            } else {
                0
            };
            block[3] = self.bufs[idx].data[usize::from(pos)];
            pos = pos.wrapping_add(1);

            if !freezed {
                port.delay_us(190);
            }
            wire::fc3_send_block(port, &block);

            // 64 more 4-byte blocks; the tail wraps around the window
            for _ in 0..64 {
                if !port.atn() {
                    break 'transfer;
                }
                if freezed {
                    if !wire::clk_data_handshake(port) {
                        break 'transfer;
                    }
                } else {
                    port.delay_us(190);
                }
                let mut block = [0u8; 4];
                for b in &mut block {
                    *b = self.bufs[idx].data[usize::from(pos)];
                    pos = pos.wrapping_add(1);
                }
                wire::fc3_send_block(port, &block);
            }

            if self.bufs[idx].send_eoi {
                // Last sector: data low tells the host we're done
                port.set_data(false);
                break;
            }
            if self.refill(idx).is_err() {
                port.set_clock(false);
                port.set_data(false);
                break;
            }
        }

        let _ = self.cleanup(idx);
        self.free_buffer(idx);
    }

    fn save_fc3(&mut self, port: &mut impl TimedIecPort) {
        let Some(idx) = self.find_buffer(1) else {
            return;
        };
        if !self.bufs[idx].write {
            return;
        }

        // Give the host time to pull DATA low
        port.delay_us(5000);

        loop {
            port.set_data(false);

            let size = wire::fc3_get_byte(port);
            let (size, eof) = if size == 0 {
                // A full block is coming
                (254u16, false)
            } else {
                (u16::from(size) - 1, true)
            };

            for _ in 0..size {
                if self.bufs[idx].must_flush {
                    // The FC3 ignores things like "disk full", so do we
                    let _ = self.refill(idx);
                }

                let byte = wire::fc3_get_byte(port);
                let buf = &mut self.bufs[idx];
                buf.data[usize::from(buf.position)] = byte;
                if buf.last_used < buf.position {
                    buf.last_used = buf.position;
                }
                buf.position = buf.position.wrapping_add(1);
                if buf.position == 0 {
                    buf.must_flush = true;
                }
            }

            if eof {
                break;
            }
        }

        let _ = self.cleanup(idx);
        self.free_buffer(idx);
    }

    // --- Dreamload ---

    fn dreamload_send_block(&mut self, port: &mut impl TimedIecPort, idx: usize) {
        // Checksum is the EOR of all bytes
        let mut checksum = 0u8;
        for i in 0..256 {
            checksum ^= self.bufs[idx].data[i];
        }

        wire::dreamload_send_byte(port, 0);
        for i in 0..256 {
            let byte = self.bufs[idx].data[i];
            wire::dreamload_send_byte(port, byte);
        }
        wire::dreamload_send_byte(port, checksum);

        port.set_clock(true);
        port.set_data(true);
        port.set_srq(true);
    }

    /// Poll the next jobcode.
    ///
    /// The original takes these from edge interrupts; polled here, with
    /// the user keys as the way out.
    fn dreamload_get_jobcode(&mut self, port: &mut impl TimedIecPort, old: bool) -> (u8, u8) {
        if self.check_keys() {
            return (0, 0);
        }
        if old {
            let track = wire::dreamload_get_byte_old(port);
            let sector = wire::dreamload_get_byte_old(port);
            (track, sector)
        } else {
            let track = wire::dreamload_get_byte(port);
            let sector = wire::dreamload_get_byte(port);
            (track, sector)
        }
    }

    fn load_dreamload(&mut self, port: &mut impl TimedIecPort) {
        port.set_clock(true);
        port.set_data(true);
        port.set_srq(true);

        // Swallow the final drive code; its checksum selects the
        // protocol revision
        let mut kind = 0u8;
        for _ in 0..4 * 256 {
            kind ^= wire::dreamload_get_byte(port);
        }
        let old_protocol = kind == 0xac || kind == 0xdc;
        if old_protocol {
            self.detected_loader = Loader::DreamloadOld;
        }

        self.fl_track = 0xff;

        let Some(idx) = self.alloc_buffer() else {
            return;
        };

        loop {
            let (track, sector) = self.dreamload_get_jobcode(port, old_protocol);
            self.fl_track = track;
            self.fl_sector = sector;

            log::trace!(target: "fastloader", "dreamload job {track}/{sector}");
            self.ui.busy_led(true);

            if track == 0 {
                match sector {
                    0 => {
                        // End of loader
                        self.ui.busy_led(false);
                        break;
                    }
                    1 => {
                        // Send the first directory sector; a short stall
                        // gives disk swaps a chance
                        port.delay_us(100_000);
                        let part = self.current_part;
                        let dir = self.d64_opendir(part);
                        if let crate::dirent::DirCursor::D64 { track, sector, .. } = dir {
                            self.fops_read_sector(idx, part, track, sector);
                            self.dreamload_send_block(port, idx);
                        }
                    }
                    _ => self.ui.busy_led(false),
                }
            } else {
                let part = self.current_part;
                self.fops_read_sector(idx, part, track, sector);
                self.dreamload_send_block(port, idx);
            }
            self.fl_track = 0xff;
        }

        self.free_buffer(idx);
    }

    // --- ULoad Model 3 ---

    /// Transfer a sector chain, reading or saving.
    fn uload3_transferchain(
        &mut self,
        port: &mut impl TimedIecPort,
        mut track: u8,
        mut sector: u8,
        saving: bool,
    ) -> Result<(), ()> {
        let Some(idx) = self.alloc_buffer() else {
            wire::uload3_send_byte(port, 0xff);
            return Ok(());
        };

        let mut first = true;
        loop {
            let part = self.current_part;
            self.fops_read_sector(idx, part, track, sector);
            if self.current_error != 0 {
                wire::uload3_send_byte(port, 0xff);
                self.free_buffer(idx);
                return Ok(());
            }

            let bytecount = if self.bufs[idx].data[0] == 0 {
                self.bufs[idx].data[1] - 1
            } else {
                254
            };
            wire::uload3_send_byte(port, bytecount);

            if saving {
                let mut i = 0;
                if first {
                    // Send the load address
                    first = false;
                    wire::uload3_send_byte(port, self.bufs[idx].data[2]);
                    wire::uload3_send_byte(port, self.bufs[idx].data[3]);
                    i = 2;
                }
                while i < bytecount {
                    let Some(byte) = wire::uload3_get_byte(port) else {
                        self.free_buffer(idx);
                        return Err(());
                    };
                    self.bufs[idx].data[usize::from(i) + 2] = byte;
                    i += 1;
                }
                let part = self.current_part;
                self.fops_write_sector(idx, part, track, sector);
                if self.current_error != 0 {
                    wire::uload3_send_byte(port, 0xff);
                    self.free_buffer(idx);
                    return Ok(());
                }
            } else {
                for i in 0..bytecount {
                    let byte = self.bufs[idx].data[usize::from(i) + 2];
                    wire::uload3_send_byte(port, byte);
                }
            }

            track = self.bufs[idx].data[0];
            sector = self.bufs[idx].data[1];
            if track == 0 {
                break;
            }
        }

        // End marker
        wire::uload3_send_byte(port, 0);
        self.free_buffer(idx);
        Ok(())
    }

    fn load_uload3(&mut self, port: &mut impl TimedIecPort) {
        loop {
            let Some(cmd) = wire::uload3_get_byte(port) else {
                // ATN received
                return;
            };

            match cmd {
                1 | 2 => {
                    // Load a file / save and replace a file
                    let Some(track) = wire::uload3_get_byte(port) else {
                        return;
                    };
                    let Some(sector) = wire::uload3_get_byte(port) else {
                        return;
                    };
                    if self
                        .uload3_transferchain(port, track, sector, cmd == 2)
                        .is_err()
                    {
                        return;
                    }
                }
                b'$' => {
                    let part = self.current_part;
                    let dir = self.d64_opendir(part);
                    if let crate::dirent::DirCursor::D64 { track, sector, .. } = dir {
                        let _ = self.uload3_transferchain(port, track, sector, false);
                    }
                }
                _ => {
                    // Unknown command
                    wire::uload3_send_byte(port, 0xff);
                }
            }
        }
    }

    // --- GI Joe / Epyx shared receive ---

    /// Four clock-edge-paired DATA samples per byte. Aborts on the user
    /// keys; ATN is not reliable for at least one loader version.
    fn gijoe_read_byte(&mut self, port: &mut impl TimedIecPort) -> Option<u8> {
        let mut value = 0u8;
        for _ in 0..4 {
            while port.clock() {
                if self.check_keys() {
                    return None;
                }
            }
            value >>= 1;
            if !port.data() {
                value |= 0x80;
            }

            while !port.clock() {
                if self.check_keys() {
                    return None;
                }
            }
            value >>= 1;
            if !port.data() {
                value |= 0x80;
            }
        }
        Some(value)
    }

    fn gijoe_send_byte(port: &mut impl TimedIecPort, value: u8) {
        let mut value = value;
        for _ in 0..4 {
            while !port.clock() {}
            port.set_data(value & 1 != 0);
            value >>= 1;

            while port.clock() {}
            port.set_data(value & 1 != 0);
            value >>= 1;
        }
    }

    fn load_gijoe(&mut self, port: &mut impl TimedIecPort) {
        port.set_data(true);
        port.set_clock(true);
        port.set_atn_ack(false);

        // Wait until the bus has settled
        port.delay_us(10_000);
        while !port.data() || !port.clock() {}

        loop {
            // Handshake
            port.set_clock(false);
            while port.data() {
                if self.check_keys() {
                    return;
                }
            }
            port.set_clock(true);

            // First byte is ignored
            if self.gijoe_read_byte(port).is_none() {
                return;
            }

            // Two file name characters, completed with a wildcard
            let Some(c1) = self.gijoe_read_byte(port) else {
                return;
            };
            let Some(c2) = self.gijoe_read_byte(port) else {
                return;
            };
            port.set_clock(false);

            self.set_command(&[c1, c2, b'*']);
            self.file_open(0);

            let Some(idx) = self.find_buffer(0) else {
                port.set_clock(true);
                Self::gijoe_send_byte(port, 0xfe);
                Self::gijoe_send_byte(port, 0xfe);
                Self::gijoe_send_byte(port, 0xac);
                Self::gijoe_send_byte(port, 0xf7);
                continue;
            };

            // File is open, transfer it
            loop {
                let mut i = self.bufs[idx].position;
                port.set_clock(true);
                port.delay_us(2);

                loop {
                    let byte = self.bufs[idx].data[usize::from(i)];
                    if byte == 0xac {
                        // Escape the end-marker byte
                        Self::gijoe_send_byte(port, 0xac);
                    }
                    Self::gijoe_send_byte(port, byte);
                    if i >= self.bufs[idx].last_used {
                        break;
                    }
                    i += 1;
                }

                if self.bufs[idx].send_eoi {
                    Self::gijoe_send_byte(port, 0xac);
                    Self::gijoe_send_byte(port, 0xff);
                    let _ = self.cleanup(idx);
                    self.free_buffer(idx);
                    break;
                }

                // "Another sector follows" marker
                Self::gijoe_send_byte(port, 0xac);
                Self::gijoe_send_byte(port, 0xc3);
                port.delay_us(50);
                port.set_clock(false);

                if self.refill(idx).is_err() {
                    Self::gijoe_send_byte(port, 0xfe);
                    Self::gijoe_send_byte(port, 0xfe);
                    Self::gijoe_send_byte(port, 0xac);
                    Self::gijoe_send_byte(port, 0xf7);
                    let _ = self.cleanup(idx);
                    self.free_buffer(idx);
                    break;
                }
            }
        }
    }

    // --- Epyx FastLoad cartridge ---

    fn load_epyxcart(&mut self, port: &mut impl TimedIecPort) {
        // Initial handshake
        port.set_data(true);
        port.set_clock(false);
        port.set_atn_ack(false);

        while port.data() {
            if !port.atn() {
                return;
            }
        }
        port.set_clock(true);

        // Receive and checksum stage 2
        let mut checksum = 0u8;
        for i in 0..256 {
            let Some(byte) = self.gijoe_read_byte(port) else {
                return;
            };
            if i < 238 {
                // Stage 2 carries junk bytes at the end
                checksum ^= byte;
            }
        }
        if checksum != 0x50 {
            return;
        }

        // Receive the file name, last character first
        let Some(len) = self.gijoe_read_byte(port) else {
            return;
        };
        let mut name = vec![0u8; usize::from(len)];
        for i in (0..usize::from(len)).rev() {
            let Some(byte) = self.gijoe_read_byte(port) else {
                return;
            };
            name[i] = byte;
        }
        port.set_clock(false);

        self.set_command(&name);
        self.file_open(0);

        let Some(idx) = self.find_buffer(0) else {
            port.set_clock(true);
            return;
        };

        loop {
            port.set_clock(true);
            port.set_data(true);

            // Number of bytes in this sector
            let count = self.bufs[idx].last_used - 1;
            if wire::epyxcart_send_byte(port, count) {
                break;
            }

            let mut aborted = false;
            for i in 2..=self.bufs[idx].last_used {
                let byte = self.bufs[idx].data[usize::from(i)];
                if wire::epyxcart_send_byte(port, byte) {
                    aborted = true;
                    break;
                }
            }
            if aborted || !port.atn() {
                break;
            }

            if self.bufs[idx].send_eoi {
                break;
            }

            port.set_clock(false);
            if self.refill(idx).is_err() {
                break;
            }
        }

        port.set_clock(true);
        port.set_data(true);
        let _ = self.cleanup(idx);
        self.free_buffer(idx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc_ccitt_reference_value() {
        let mut crc = 0xffffu16;
        for byte in b"123456789" {
            crc = crc16_update(crc, *byte);
        }
        assert_eq!(crc, 0x29b1);
    }

    #[test]
    fn execute_table_is_selective() {
        assert_eq!(
            Loader::for_execute(Loader::Turbodisk, 0x0303),
            Some(Loader::Turbodisk)
        );
        assert_eq!(Loader::for_execute(Loader::Turbodisk, 0x0400), None);
        assert_eq!(Loader::for_execute(Loader::None, 0x0303), None);
        assert_eq!(
            Loader::for_execute(Loader::Fc3Load, 0x0400),
            Some(Loader::Fc3Load)
        );
        assert_eq!(
            Loader::for_execute(Loader::EpyxCart, 0x01a9),
            Some(Loader::EpyxCart)
        );
    }
}
