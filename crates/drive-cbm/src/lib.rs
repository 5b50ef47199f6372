//! Commodore serial-bus drive engine.
//!
//! Emulates a 1541-family disk drive on the Commodore serial bus ("IEC
//! bus"), serving files from a FAT-style file store and from D64/D71/D81
//! and M2I images stored on it. The host computer talks to it like any
//! other drive: LISTEN/TALK with secondary addresses, a command channel
//! on secondary 15, EOI-delimited byte transfers, and a handful of
//! fastloader protocols entered through `M-E`.
//!
//! The engine is built around [`Drive`], which owns the channel buffers,
//! the partition table and the DOS state. Bus traffic enters through the
//! state machine in [`iec`], which needs an
//! [`IecPort`](drive_core::IecPort) implementation for the actual wire.
//!
//! # Layers
//!
//! * [`iec`] — bus state machine and byte transceiver
//! * [`jiffy`] — JiffyDOS byte protocol
//! * [`fastloader`] — loader detection and custom wire protocols
//! * [`command`] — channel-15 DOS command parser
//! * [`fileops`] — OPEN handling, directory listings, dispatch over
//!   partition types
//! * [`fat`], [`d64`], [`m2i`] — the per-backend file operations
//! * [`buffer`], [`status`] — channel buffers and the DOS status channel

pub mod buffer;
pub mod command;
pub mod config;
pub mod d64;
pub mod dirent;
pub mod diskswap;
pub mod drive;
pub mod fastloader;
pub mod fat;
pub mod fileops;
pub mod iec;
pub mod jiffy;
pub mod m2i;
pub mod partition;
pub mod path;
pub mod petscii;
pub mod status;

pub use buffer::{BUFFER_COUNT, Buffer, BufferKind, ERROR_CHANNEL};
pub use dirent::CbmDirent;
pub use drive::{ChannelRead, Drive, DriveConfig};
pub use fastloader::Loader;
pub use iec::{BusState, DeviceState};
pub use partition::{Mount, Partition};
pub use status::errors;
