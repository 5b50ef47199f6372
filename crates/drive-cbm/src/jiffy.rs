//! JiffyDOS byte protocol.
//!
//! JiffyDOS moves two bits per edge pair on fixed time offsets from the
//! start handshake, roughly five times faster than the stock protocol.
//! Detection happens inside the ATN byte receive (see `iec`); once
//! active, the listen and talk loops switch to these codecs.

use drive_core::{Lines, TimedIecPort};

use crate::fastloader::wire::{JIFFY_RECEIVE, JIFFY_SEND, recv_2bit, send_2bit};

/// Receive one byte.
///
/// Returns the byte and the bus state sampled at the EOI mark: CLOCK
/// high there flags EOI, ATN low means the transfer was broken off.
pub fn jiffy_receive(port: &mut impl TimedIecPort) -> (u8, Lines) {
    port.set_clock(true);
    port.set_data(true);

    // Wait for the rising clock edge, emulating the ATN acknowledge
    loop {
        port.wait_clock(true, true);
        if !port.atn() {
            port.set_data(false);
        }
        if port.clock() {
            break;
        }
    }

    let byte = recv_2bit(port, &JIFFY_RECEIVE);

    // EOI info rides after the data pairs
    let state = port.read_bus_at(670);

    // Exit with data low
    port.set_data_at(730, false, true);
    port.delay_us(10);

    (byte, state)
}

/// Send one byte.
///
/// `load_mode` selects the block-transfer variant used during LOAD
/// (start marker on a falling DATA edge, no per-byte EOI mark).
/// Returns `true` if ATN interrupted the transfer.
pub fn jiffy_send(port: &mut impl TimedIecPort, value: u8, eoi: bool, load_mode: bool) -> bool {
    port.set_data(true);
    port.set_clock(true);
    port.delay_us(3);

    if load_mode {
        // LOAD mode: start marker is data low
        while !port.data() {}
        port.wait_data(false, true);
    } else {
        // Single byte mode: start marker is data high
        port.wait_data(true, true);
    }

    send_2bit(port, &JIFFY_SEND, value);

    if !load_mode {
        // EOI mark: the line pair picked tells the host
        if eoi {
            port.set_clock_at(520, true, false);
            port.set_data_at(520, false, true);
        } else {
            port.set_clock_at(520, false, false);
            port.set_data_at(520, true, true);
        }

        // Allow for slow rise times
        port.delay_us(3);
        while port.data() && port.atn() {}
    }

    // Hold time
    port.delay_us(10);

    !port.atn()
}
