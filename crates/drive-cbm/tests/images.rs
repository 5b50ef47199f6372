//! Image-level end-to-end tests: mounted D64 images driven through the
//! command channel and the channel APIs, byte-for-byte against the
//! on-disk format.

use drive_cbm::{Drive, DriveConfig, Mount, errors};
use drive_core::MemStore;
use format_d64::{D64_SIZE, ImageKind};

fn sector_offset(track: u8, sector: u8) -> usize {
    ImageKind::D41.sector_offset(track, sector) as usize
}

/// A drive with a D64 image: zeroed, or prepared by the caller.
fn drive_with_image(image: Vec<u8>) -> Drive<MemStore> {
    let mut fs = MemStore::new("SD");
    fs.add_file(0, "DISK.D64", &image);
    let mut drive = Drive::new(vec![fs], DriveConfig::default());
    drive.set_command(b"CD:DISK.D64");
    drive.execute_command();
    assert!(matches!(drive.parts()[0], Mount::D64 { .. }));
    drive
}

/// A formatted, empty D64.
fn formatted_drive() -> Drive<MemStore> {
    let mut drive = drive_with_image(vec![0u8; D64_SIZE]);
    drive.set_command(b"N:TESTDISK,ID");
    drive.execute_command();
    assert_eq!(drive.error_code(), 0);
    drive
}

#[test]
fn chain_read_delivers_link_and_payload() {
    // One file "A" at 17/0 linking to 17/5, per the classic layout
    let mut image = vec![0u8; D64_SIZE];

    // Directory sector 18/1: terminated chain, one PRG entry
    let dir = sector_offset(18, 1);
    image[dir] = 0;
    image[dir + 1] = 0xff;
    image[dir + 2] = 0x82; // closed PRG
    image[dir + 3] = 17;
    image[dir + 4] = 0;
    image[dir + 5] = b'A';
    for i in 6..21 {
        image[dir + i] = 0xa0;
    }
    image[dir + 0x1e] = 2;

    // First sector 17/0: link 17/5, BASIC-ish payload
    let first = sector_offset(17, 0);
    image[first] = 0x11;
    image[first + 1] = 0x05;
    image[first + 2] = 0x01;
    image[first + 3] = 0x08;
    image[first + 4] = 0x0b;
    image[first + 5] = 0x08;

    // Final sector 17/5: chain end, 4 used bytes
    let second = sector_offset(17, 5);
    image[second] = 0;
    image[second + 1] = 5;
    image[second + 2] = 0xaa;
    image[second + 3] = 0xbb;

    let mut drive = drive_with_image(image);
    drive.set_command(b"A");
    drive.file_open(0);
    assert_eq!(drive.error_code(), 0);

    // First window: the link pointer rides in front of the payload
    let idx = drive.find_buffer(0).expect("channel");
    let buf = drive.buffer(idx);
    assert_eq!(&buf.data[0..2], &[0x11, 0x05]);
    assert_eq!(&buf.data[2..6], &[0x01, 0x08, 0x0b, 0x08]);
    assert_eq!(buf.position, 2);
    assert_eq!(buf.last_used, 255);
    assert!(!buf.send_eoi);

    // Drain the first window, then the final sector follows
    let mut bytes = Vec::new();
    for _ in 0..254 {
        let (b, _) = drive.channel_read(0).expect("read");
        bytes.push(b);
    }
    let idx = drive.find_buffer(0).expect("channel");
    let buf = drive.buffer(idx);
    assert_eq!(&buf.data[0..2], &[0, 5]);
    assert!(buf.send_eoi);
    assert_eq!(buf.last_used, 5);
    assert_eq!(&buf.data[2..4], &[0xaa, 0xbb]);
}

#[test]
fn save_and_load_round_trip_through_commands() {
    let mut drive = formatted_drive();

    // SAVE"PROG",8
    drive.set_command(b"PROG");
    drive.file_open(1);
    assert_eq!(drive.error_code(), 0);
    let payload: Vec<u8> = (0..500u32).map(|i| (i % 7) as u8 + 1).collect();
    for b in &payload {
        drive.channel_write(1, *b).expect("write");
    }
    drive.close_channel(1).expect("close");

    // LOAD"PROG",8
    drive.set_command(b"PROG");
    drive.file_open(0);
    assert_eq!(drive.error_code(), 0);
    assert_eq!(drive.channel_read_all(0), payload);
}

#[test]
fn directory_listing_of_mounted_image() {
    let mut drive = formatted_drive();

    drive.set_command(b"SOMEFILE");
    drive.file_open(1);
    drive.channel_write(1, 0x42).expect("write");
    drive.close_channel(1).expect("close");

    drive.set_command(b"$");
    drive.file_open(0);
    let listing = drive.channel_read_all(0);

    // Header carries the image label and id
    assert_eq!(&listing[8..16], b"TESTDISK");
    assert_eq!(&listing[26..31], b"ID 2A");
    // One entry line plus footer
    assert_eq!(listing.len(), 96);
    let entry = &listing[32..64];
    assert_eq!(&entry[2..4], &[1, 0]);
    assert!(entry.windows(8).any(|w| w == b"SOMEFILE"));
    assert!(entry.windows(3).any(|w| w == b"PRG"));
    // 664 minus one data sector in the footer's free count
    assert_eq!(&listing[66..68], &[(663u16 & 0xff) as u8, (663u16 >> 8) as u8]);
}

#[test]
fn scratch_on_image_updates_bam_and_directory() {
    let mut drive = formatted_drive();

    for name in [&b"KEEP"[..], &b"KILL"[..]] {
        drive.set_command(name);
        drive.file_open(1);
        drive.channel_write(1, 1).expect("write");
        drive.close_channel(1).expect("close");
    }

    drive.set_command(b"S:KILL");
    drive.execute_command();
    assert_eq!(drive.status_line(), b"01,FILES SCRATCHED,01,00\r");

    drive.set_command(b"$");
    drive.file_open(0);
    let listing = drive.channel_read_all(0);
    assert!(listing.windows(4).any(|w| w == b"KEEP"));
    assert!(!listing.windows(4).any(|w| w == b"KILL"));
}

#[test]
fn rel_files_on_images_are_rejected() {
    let mut drive = formatted_drive();
    drive.set_command(b"RELFILE,L,\x20");
    drive.file_open(4);
    assert_eq!(drive.error_code(), errors::SYNTAX_UNABLE);
}

#[test]
fn format_of_non_d41_images_is_rejected() {
    let mut fs = MemStore::new("SD");
    fs.add_file(0, "BIG.D81", &vec![0u8; format_d64::D81_SIZE]);
    let mut drive = Drive::new(vec![fs], DriveConfig::default());
    drive.set_command(b"CD:BIG.D81");
    drive.execute_command();
    assert!(matches!(drive.parts()[0], Mount::D64 { .. }));

    drive.set_command(b"N:NEWNAME,XX");
    drive.execute_command();
    assert_eq!(drive.error_code(), errors::SYNTAX_UNABLE);
}

#[test]
fn unmount_returns_to_fat_and_flushes() {
    let mut drive = formatted_drive();

    drive.set_command(b"DATA");
    drive.file_open(1);
    drive.channel_write(1, 0x55).expect("write");
    drive.close_channel(1).expect("close");

    drive.set_command(b"CD:_");
    drive.execute_command();
    assert!(matches!(drive.parts()[0], Mount::Fat));

    // The image file on FAT carries the directory entry
    let image = drive
        .filesystem(0)
        .file_data(0, "DISK.D64")
        .expect("image file");
    let dir = sector_offset(18, 1);
    assert_eq!(image[dir + 2], 0x82);
    assert_eq!(&image[dir + 5..dir + 9], b"DATA");
}

#[test]
fn write_protected_image_reports_26() {
    let mut fs = MemStore::new("SD");
    fs.add_file(0, "RO.D64", &vec![0u8; D64_SIZE]);
    fs.set_read_only(0, "RO.D64", true);
    let mut drive = Drive::new(vec![fs], DriveConfig::default());
    drive.set_command(b"CD:RO.D64");
    drive.execute_command();
    assert!(matches!(drive.parts()[0], Mount::D64 { writable: false, .. }));

    drive.set_command(b"NEWFILE");
    drive.file_open(1);
    assert_eq!(drive.error_code(), errors::WRITE_PROTECT);
}

#[test]
fn raw_directory_channel_reads_chain() {
    let mut drive = formatted_drive();

    // `$` on a secondary other than 0 reads the raw directory chain,
    // starting at the header sector
    drive.set_command(b"$");
    drive.file_open(5);
    assert_eq!(drive.error_code(), 0);
    let idx = drive.find_buffer(5).expect("channel");
    let buf = drive.buffer(idx);
    assert_eq!(&buf.data[0..2], &[18, 1]);
    assert_eq!(buf.data[2], 0x41);
    assert!(!buf.send_eoi);

    // The chained directory sector terminates the file
    for _ in 0..254 {
        drive.channel_read(5).expect("read");
    }
    let idx = drive.find_buffer(5).expect("channel");
    let buf = drive.buffer(idx);
    assert_eq!(buf.data[0], 0);
    assert_eq!(buf.data[1], 0xff);
    assert!(buf.send_eoi);
}
