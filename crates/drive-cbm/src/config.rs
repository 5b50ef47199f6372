//! Persisted configuration in NVRAM.
//!
//! Layout, starting at offset 0: one unused byte, an additive checksum,
//! a clock-trim byte (kept for layout compatibility), the JiffyDOS
//! enable flag, the stored bus address and the hardware-selected
//! address it belongs to. The stored address only applies while the
//! hardware selection is unchanged.

use drive_core::FileStore;

use crate::drive::Drive;

const OFS_CHECKSUM: u16 = 1;
const OFS_OSCCAL: u16 = 2;
const OFS_JIFFY: u16 = 3;
const OFS_ADDRESS: u16 = 4;
const OFS_HARDADDRESS: u16 = 5;
const CONFIG_SIZE: u16 = 6;

impl<F: FileStore> Drive<F> {
    /// Load the stored configuration, if its checksum holds.
    pub(crate) fn read_configuration(&mut self) {
        if self.nvram.len() < CONFIG_SIZE {
            return;
        }

        let mut checksum = 0u8;
        for addr in OFS_OSCCAL..CONFIG_SIZE {
            checksum = checksum.wrapping_add(self.nvram.read(addr));
        }
        if checksum != self.nvram.read(OFS_CHECKSUM) {
            return;
        }

        self.flags.jiffy_enabled = self.nvram.read(OFS_JIFFY) != 0;
        if self.nvram.read(OFS_HARDADDRESS) == self.device_address {
            self.device_address = self.nvram.read(OFS_ADDRESS) & 0x1f;
        }
    }

    /// Store the current configuration (the `XW` command).
    pub(crate) fn write_configuration(&mut self) {
        if self.nvram.len() < CONFIG_SIZE {
            return;
        }

        self.nvram.write(OFS_OSCCAL, 0);
        self.nvram
            .write(OFS_JIFFY, u8::from(self.flags.jiffy_enabled));
        self.nvram.write(OFS_ADDRESS, self.device_address);
        self.nvram.write(OFS_HARDADDRESS, self.hard_address);

        let mut checksum = 0u8;
        for addr in OFS_OSCCAL..CONFIG_SIZE {
            checksum = checksum.wrapping_add(self.nvram.read(addr));
        }
        self.nvram.write(OFS_CHECKSUM, checksum);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drive::{Drive, DriveConfig};
    use drive_core::{MemStore, SharedNvram};

    fn config_with_nvram(nvram: SharedNvram) -> DriveConfig {
        DriveConfig {
            nvram: Box::new(nvram),
            ..DriveConfig::default()
        }
    }

    #[test]
    fn address_survives_restart() {
        let nvram = SharedNvram::new(16);
        let mut drive = Drive::new(
            vec![MemStore::new("T")],
            config_with_nvram(nvram.clone()),
        );
        drive.set_command(&[b'U', b'0', 0x3e, 11]);
        drive.execute_command();
        drive.set_command(b"XW");
        drive.execute_command();

        let drive = Drive::new(vec![MemStore::new("T")], config_with_nvram(nvram));
        assert_eq!(drive.address(), 11);
    }

    #[test]
    fn bad_checksum_is_ignored() {
        let nvram = SharedNvram::new(16);
        let mut drive = Drive::new(
            vec![MemStore::new("T")],
            config_with_nvram(nvram.clone()),
        );
        drive.set_command(&[b'U', b'0', 0x3e, 11]);
        drive.execute_command();
        drive.set_command(b"XW");
        drive.execute_command();

        // Corrupt one config byte
        let mut outside = nvram.clone();
        drive_core::Nvram::write(&mut outside, 4, 22);

        let drive = Drive::new(vec![MemStore::new("T")], config_with_nvram(nvram));
        assert_eq!(drive.address(), 8);
    }

    #[test]
    fn stored_address_tied_to_hardware_selection() {
        let nvram = SharedNvram::new(16);
        let mut drive = Drive::new(
            vec![MemStore::new("T")],
            config_with_nvram(nvram.clone()),
        );
        drive.set_command(&[b'U', b'0', 0x3e, 11]);
        drive.execute_command();
        drive.set_command(b"XW");
        drive.execute_command();

        // A different jumper setting wins over the stored address
        let config = DriveConfig {
            device_address: 9,
            nvram: Box::new(nvram),
            ..DriveConfig::default()
        };
        let drive = Drive::new(vec![MemStore::new("T")], config);
        assert_eq!(drive.address(), 9);
    }

    #[test]
    fn tiny_nvram_is_tolerated() {
        let nvram = SharedNvram::new(2);
        let mut drive = Drive::new(vec![MemStore::new("T")], config_with_nvram(nvram));
        drive.write_configuration();
        assert_eq!(drive.address(), 8);
    }
}
