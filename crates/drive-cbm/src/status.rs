//! DOS status channel and error message generation.
//!
//! Errors are values, not exceptions: every operation that fails leaves a
//! `NN,MESSAGE,TT,SS` line in the status buffer read through secondary 15.
//! The message table is compressed the way drive firmware likes it: bytes
//! with the top bit set mark the error numbers a string belongs to, bytes
//! below 32 are tokens referencing the abbreviation table, everything else
//! is literal text.

use drive_core::FileStore;

use crate::buffer::ERROR_CHANNEL;
use crate::drive::Drive;

/// DOS error numbers.
pub mod errors {
    pub const OK: u8 = 0;
    pub const SCRATCHED: u8 = 1;
    pub const PARTITION_SELECTED: u8 = 2;
    pub const READ_NOHEADER: u8 = 20;
    pub const READ_NOSYNC: u8 = 21;
    pub const READ_NODATA: u8 = 22;
    pub const READ_CHECKSUM: u8 = 23;
    pub const WRITE_VERIFY: u8 = 25;
    pub const WRITE_PROTECT: u8 = 26;
    pub const READ_HDRCHECKSUM: u8 = 27;
    pub const DISK_ID_MISMATCH: u8 = 29;
    pub const SYNTAX_UNKNOWN: u8 = 30;
    pub const SYNTAX_UNABLE: u8 = 31;
    pub const SYNTAX_TOOLONG: u8 = 32;
    pub const SYNTAX_JOKER: u8 = 33;
    pub const SYNTAX_NONAME: u8 = 34;
    pub const FILE_NOT_FOUND_39: u8 = 39;
    pub const RECORD_MISSING: u8 = 50;
    pub const RECORD_OVERFLOW: u8 = 51;
    pub const FILE_TOO_LARGE: u8 = 52;
    pub const WRITE_FILE_OPEN: u8 = 60;
    pub const FILE_NOT_OPEN: u8 = 61;
    pub const FILE_NOT_FOUND: u8 = 62;
    pub const FILE_EXISTS: u8 = 63;
    pub const FILE_TYPE_MISMATCH: u8 = 64;
    pub const NO_BLOCK: u8 = 65;
    pub const ILLEGAL_TS_COMMAND: u8 = 66;
    pub const ILLEGAL_TS_LINK: u8 = 67;
    pub const NO_CHANNEL: u8 = 70;
    pub const DIR_ERROR: u8 = 71;
    pub const DISK_FULL: u8 = 72;
    pub const DOSVERSION: u8 = 73;
    pub const DRIVE_NOT_READY: u8 = 74;
    /// Extension-command status reply (shows protocol flags).
    pub const STATUS: u8 = 75;
    pub const PARTITION_ILLEGAL: u8 = 77;
    pub const BUFFER_TOO_SMALL: u8 = 78;
    pub const IMAGE_INVALID: u8 = 79;
    pub const CLOCK_UNSTABLE: u8 = 99;
}

/// Marks the error numbers a message applies to.
const fn ec(code: u8) -> u8 {
    code | 0x80
}

/// End-of-table marker.
const END: u8 = ec(127);

/// Abbreviations referenced from the message table by token bytes 0..=7.
const ABBREVS: &[u8] = &[
    ec(0), b'F', b'I', b'L', b'E',
    ec(1), b'R', b'E', b'A', b'D',
    ec(2), b'W', b'R', b'I', b'T', b'E',
    ec(3), b' ', b'E', b'R', b'R', b'O', b'R',
    ec(4), b' ', b'N', b'O', b'T', b' ',
    ec(5), b'D', b'I', b'S', b'K', b' ',
    ec(6), b'O', b'P', b'E', b'N',
    ec(7), b'R', b'E', b'C', b'O', b'R', b'D',
    END,
];

/// The error message table.
const MESSAGES: &[u8] = &[
    ec(0),
        b' ', b'O', b'K',
    ec(1),
        0, b'S', b' ', b'S', b'C', b'R', b'A', b'T', b'C', b'H', b'E', b'D',
    ec(2),
        b'P', b'A', b'R', b'T', b'I', b'T', b'I', b'O', b'N', b' ',
        b'S', b'E', b'L', b'E', b'C', b'T', b'E', b'D',
    ec(20), ec(21), ec(22), ec(23), ec(24), ec(27),
        1, 3,
    ec(25), ec(28),
        2, 3,
    ec(26),
        2, b' ', b'P', b'R', b'O', b'T', b'E', b'C', b'T', b' ', b'O', b'N',
    ec(29),
        5, b'I', b'D', b' ', b'M', b'I', b'S', b'M', b'A', b'T', b'C', b'H',
    ec(30), ec(31), ec(32), ec(33), ec(34),
        b'S', b'Y', b'N', b'T', b'A', b'X', 3,
    ec(39), ec(62),
        0, 4, b'F', b'O', b'U', b'N', b'D',
    ec(50),
        7, 4, b'P', b'R', b'E', b'S', b'E', b'N', b'T',
    ec(51),
        b'O', b'V', b'E', b'R', b'F', b'L', b'O', b'W', b' ', b'I', b'N', b' ', 7,
    ec(52),
        0, b' ', b'T', b'O', b'O', b' ', b'L', b'A', b'R', b'G', b'E',
    ec(60),
        2, b' ', 0, b' ', 6,
    ec(61),
        0, 4, 6,
    ec(63),
        0, b' ', b'E', b'X', b'I', b'S', b'T', b'S',
    ec(64),
        0, b' ', b'T', b'Y', b'P', b'E', b' ', b'M', b'I', b'S', b'M', b'A', b'T', b'C', b'H',
    ec(65),
        b'N', b'O', b' ', b'B', b'L', b'O', b'C', b'K',
    ec(66), ec(67),
        b'I', b'L', b'L', b'E', b'G', b'A', b'L', b' ', b'T', b'R', b'A', b'C', b'K',
        b' ', b'O', b'R', b' ', b'S', b'E', b'C', b'T', b'O', b'R',
    ec(70),
        b'N', b'O', b' ', b'C', b'H', b'A', b'N', b'N', b'E', b'L',
    ec(71),
        b'D', b'I', b'R', 3,
    ec(72),
        5, b'F', b'U', b'L', b'L',
    ec(73),
        b'C', b'B', b'M', b'D', b'R', b'I', b'V', b'E', b' ', b'V',
    ec(74),
        b'D', b'R', b'I', b'V', b'E', 4, 1, b'Y',
    ec(77),
        b'S', b'E', b'L', b'E', b'C', b'T', b'E', b'D', b' ',
        b'P', b'A', b'R', b'T', b'I', b'T', b'I', b'O', b'N', b' ',
        b'I', b'L', b'L', b'E', b'G', b'A', b'L',
    ec(78),
        b'B', b'U', b'F', b'F', b'E', b'R', b' ',
        b'T', b'O', b'O', b' ', b'S', b'M', b'A', b'L', b'L',
    ec(79),
        b'I', b'M', b'A', b'G', b'E', b' ', 0, b' ', b'I', b'N', b'V', b'A', b'L', b'I', b'D',
    ec(99),
        b'C', b'L', b'O', b'C', b'K', b' ', b'U', b'N', b'S', b'T', b'A', b'B', b'L', b'E',
    END,
];

/// Version reported by error 73.
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Expand the message for `entry` from `table` into `out` at `pos`.
///
/// Token bytes recurse into the abbreviation table.
fn append_msg(out: &mut [u8], mut pos: usize, table: &[u8], entry: u8) -> usize {
    let mark = ec(entry);
    let mut i = 0;
    loop {
        let b = table[i];
        i += 1;
        if b == mark || b == END {
            if b == END {
                out[pos] = b'?';
                return pos + 1;
            }
            break;
        }
    }

    // Skip remaining error-number marks of this entry
    while table[i] >= 0x80 {
        i += 1;
    }

    while table[i] < 0x80 {
        let b = table[i];
        i += 1;
        if b < 32 {
            pos = append_msg(out, pos, ABBREVS, b);
        } else {
            out[pos] = b;
            pos += 1;
        }
    }
    pos
}

/// Append a decimal number, two digits minimum.
fn append_number(out: &mut [u8], mut pos: usize, mut value: u8) -> usize {
    if value >= 100 {
        out[pos] = b'0' + value / 100;
        pos += 1;
        value %= 100;
    }
    out[pos] = b'0' + value / 10;
    out[pos + 1] = b'0' + value % 10;
    pos + 2
}

impl<F: FileStore> Drive<F> {
    /// Set the current error with zeroed track/sector context.
    pub fn set_error(&mut self, code: u8) {
        self.set_error_ts(code, 0, 0);
    }

    /// Set the current error and rebuild the status channel contents.
    pub fn set_error_ts(&mut self, code: u8, track: u8, sector: u8) {
        self.current_error = code;
        self.longversion = false;
        self.build_status(code, track, sector);
    }

    /// Like `set_error`, but reports the long version string for 73.
    pub fn set_error_longversion(&mut self) {
        self.current_error = errors::DOSVERSION;
        self.longversion = true;
        self.build_status(errors::DOSVERSION, 0, 0);
    }

    fn build_status(&mut self, code: u8, track: u8, sector: u8) {
        let longversion = self.longversion;
        let jiffy = self.flags.jiffy_enabled;
        let buf = &mut self.bufs[ERROR_CHANNEL];
        buf.position = 0;
        buf.last_used = 0;
        buf.data.fill(0);

        let mut pos = append_number(&mut buf.data, 0, code);
        buf.data[pos] = b',';
        pos += 1;

        if code == errors::STATUS {
            // Protocol flag report for the extension commands
            buf.data[pos] = b'J';
            buf.data[pos + 1] = if jiffy { b'+' } else { b'-' };
            pos += 2;
        } else {
            pos = append_msg(&mut buf.data, pos, MESSAGES, code);
            if code == errors::DOSVERSION {
                for b in VERSION.bytes() {
                    buf.data[pos] = b;
                    pos += 1;
                }
                if longversion {
                    for b in b"/RUST" {
                        buf.data[pos] = *b;
                        pos += 1;
                    }
                }
            }
        }

        buf.data[pos] = b',';
        pos += 1;
        pos = append_number(&mut buf.data, pos, track);
        buf.data[pos] = b',';
        pos += 1;
        pos = append_number(&mut buf.data, pos, sector);
        buf.data[pos] = 13;

        buf.last_used = pos as u8;

        // Errors 20+ light the blink attractor, except the version string
        if code >= 20 && code != errors::DOSVERSION {
            self.error_blink = true;
        } else {
            self.error_blink = false;
            let dirty = self.active_buffers & 0xf0 != 0;
            self.ui.dirty_led(dirty);
        }
    }

    /// Current contents of the status channel, without consuming it.
    #[must_use]
    pub fn status_line(&self) -> &[u8] {
        let buf = &self.bufs[ERROR_CHANNEL];
        &buf.data[..=usize::from(buf.last_used)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drive::tests::test_drive;

    #[test]
    fn ok_message() {
        let mut drive = test_drive();
        drive.set_error(errors::OK);
        assert_eq!(drive.status_line(), b"00, OK,00,00\r");
    }

    #[test]
    fn abbreviations_expand() {
        let mut drive = test_drive();
        drive.set_error(errors::FILE_NOT_FOUND);
        assert_eq!(drive.status_line(), b"62,FILE NOT FOUND,00,00\r");

        drive.set_error(errors::DRIVE_NOT_READY);
        assert_eq!(drive.status_line(), b"74,DRIVE NOT READY,00,00\r");

        drive.set_error(errors::RECORD_OVERFLOW);
        assert_eq!(drive.status_line(), b"51,OVERFLOW IN RECORD,00,00\r");
    }

    #[test]
    fn shared_messages() {
        let mut drive = test_drive();
        drive.set_error_ts(errors::READ_NOHEADER, 18, 4);
        assert_eq!(drive.status_line(), b"20,READ ERROR,18,04\r");
        drive.set_error(errors::SYNTAX_NONAME);
        assert_eq!(drive.status_line(), b"34,SYNTAX ERROR,00,00\r");
        drive.set_error(errors::ILLEGAL_TS_LINK);
        assert_eq!(drive.status_line(), b"67,ILLEGAL TRACK OR SECTOR,00,00\r");
    }

    #[test]
    fn scratched_count_in_track_field() {
        let mut drive = test_drive();
        drive.set_error_ts(errors::SCRATCHED, 2, 0);
        assert_eq!(drive.status_line(), b"01,FILES SCRATCHED,02,00\r");
    }

    #[test]
    fn version_string() {
        let mut drive = test_drive();
        drive.set_error(errors::DOSVERSION);
        let expected = format!("73,CBMDRIVE V{VERSION},00,00\r");
        assert_eq!(drive.status_line(), expected.as_bytes());
        assert!(!drive.error_blink);
    }

    #[test]
    fn unknown_code_shows_question_mark() {
        let mut drive = test_drive();
        drive.set_error(42);
        assert_eq!(drive.status_line(), b"42,?,00,00\r");
    }

    #[test]
    fn blink_attractor_for_real_errors() {
        let mut drive = test_drive();
        drive.set_error(errors::DISK_FULL);
        assert!(drive.error_blink);
        drive.set_error(errors::OK);
        assert!(!drive.error_blink);
    }

    #[test]
    fn three_digit_codes() {
        let mut drive = test_drive();
        drive.set_error(errors::CLOCK_UNSTABLE);
        assert_eq!(drive.status_line(), b"99,CLOCK UNSTABLE,00,00\r");
    }
}
