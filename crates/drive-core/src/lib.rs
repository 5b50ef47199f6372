//! Core traits for the serial-bus drive engine.
//!
//! The drive engine is hardware-agnostic: everything that touches real pins,
//! storage media, clock chips or LEDs goes through the traits defined here.
//! A firmware port implements them against registers; the test suites and
//! host-side embeddings use the in-memory implementations in [`memfs`] and
//! friends.

pub mod bus;
pub mod memfs;
pub mod nvram;
pub mod rtc;
pub mod simbus;
pub mod storage;
pub mod ui;

pub use bus::{IecPort, Lines, TimedIecPort};
pub use simbus::{HostOp, SimBus};
pub use memfs::MemStore;
pub use nvram::{Nvram, SharedNvram};
pub use rtc::{Rtc, RtcState, RtcTime, SimRtc};
pub use storage::{
    BlockDevice, DevError, DirHandle, DirId, FatEntry, FileId, FileStore, FsError, MediaState,
    OpenMode,
};
pub use ui::{KEY_HOME, KEY_NEXT, KEY_PREV, KEY_SLEEP, NullUi, SimUi, Ui};
