//! Fastloader byte codecs.
//!
//! Most loaders move two bits per signalling edge pair, differing only
//! in when the pairs happen and which bits ride on which line. That
//! makes the codecs table-driven: a [`Generic2Bit`] descriptor holds
//! four pair times (in 100 ns units, measured from the start handshake)
//! plus the bit assignments, evaluated against the timed port
//! primitives. The constants are load-bearing; hosts sample on these
//! exact offsets.

use drive_core::TimedIecPort;

/// Timing/bit-assignment table of a 2-bit-pair codec.
pub struct Generic2Bit {
    /// Edge pair times in 100 ns after the reference point.
    pub pair_times: [u32; 4],
    /// Bit index carried on CLOCK per pair.
    pub clock_bits: [u8; 4],
    /// Bit index carried on DATA per pair.
    pub data_bits: [u8; 4],
    /// XOR applied to the byte before sending / after receiving.
    pub eor: u8,
}

/// Transmit one byte through a 2-bit codec table.
pub fn send_2bit(port: &mut impl TimedIecPort, def: &Generic2Bit, byte: u8) {
    let byte = byte ^ def.eor;
    for i in 0..4 {
        port.set_clock_at(def.pair_times[i], byte & (1 << def.clock_bits[i]) != 0, false);
        port.set_data_at(def.pair_times[i], byte & (1 << def.data_bits[i]) != 0, true);
    }
}

/// Receive one byte through a 2-bit codec table.
pub fn recv_2bit(port: &mut impl TimedIecPort, def: &Generic2Bit) -> u8 {
    let mut result = 0u8;
    for i in 0..4 {
        let bus = port.read_bus_at(def.pair_times[i]);
        result |= u8::from(bus.clock) << def.clock_bits[i];
        result |= u8::from(bus.data) << def.data_bits[i];
    }
    result ^ def.eor
}

// --- JiffyDOS ---

pub const JIFFY_RECEIVE: Generic2Bit = Generic2Bit {
    pair_times: [170, 300, 410, 540],
    clock_bits: [4, 6, 3, 2],
    data_bits: [5, 7, 1, 0],
    eor: 0xff,
};

pub const JIFFY_SEND: Generic2Bit = Generic2Bit {
    pair_times: [100, 200, 310, 410],
    clock_bits: [0, 2, 4, 6],
    data_bits: [1, 3, 5, 7],
    eor: 0,
};

// --- Turbodisk ---

const TURBODISK_BYTE: Generic2Bit = Generic2Bit {
    pair_times: [310, 600, 890, 1180],
    clock_bits: [7, 5, 3, 1],
    data_bits: [6, 4, 2, 0],
    eor: 0,
};

/// Send a single byte with the Turbodisk handshake.
pub fn turbodisk_byte(port: &mut impl TimedIecPort, value: u8) {
    // Wait for handshake
    while port.data() {}
    port.set_clock(true);
    port.wait_data(true, false);

    send_2bit(port, &TURBODISK_BYTE, value);

    // Exit with clock low, data high
    port.set_clock_at(1470, false, false);
    port.set_data_at(1470, true, true);
    port.delay_us(5);
}

/// Stream a full buffer with the Turbodisk block cadence.
pub fn turbodisk_buffer(port: &mut impl TimedIecPort, data: &[u8]) {
    while port.data() {}
    port.set_clock(true);
    port.wait_data(true, false);

    let mut ticks: u32 = 70;
    for &byte in data {
        let mut byte = byte;
        ticks += 120;
        for _ in 0..4 {
            ticks += 240;
            port.set_clock_at(ticks, byte & 0x80 != 0, false);
            port.set_data_at(ticks, byte & 0x40 != 0, true);
            ticks += 50;
            byte <<= 2;
        }
        ticks += 100;
    }

    ticks += 110;
    port.set_clock_at(ticks, false, false);
    port.set_data_at(ticks, true, true);
    port.delay_us(5);
}

// --- Final Cartridge 3 ---

const FC3_GET: Generic2Bit = Generic2Bit {
    pair_times: [170, 300, 420, 520],
    clock_bits: [7, 6, 3, 2],
    data_bits: [5, 4, 1, 0],
    eor: 0xff,
};

/// CLK/DATA handshake used between FC3 blocks.
///
/// Returns `false` if ATN went low.
pub fn clk_data_handshake(port: &mut impl TimedIecPort) -> bool {
    port.set_clock(false);
    while port.data() && port.atn() {}
    if !port.atn() {
        return false;
    }
    port.set_clock(true);
    while !port.data() && port.atn() {}
    port.atn()
}

/// Send one 4-byte block of the FC3 protocol.
pub fn fc3_send_block(port: &mut impl TimedIecPort, data: &[u8; 4]) {
    // Start in one microsecond
    port.set_reference(10);
    port.set_clock_at(0, false, true);

    let mut ticks: u32 = 120;
    for &value in data {
        let mut value = value;
        for _ in 0..4 {
            port.set_clock_at(ticks, value & 1 != 0, false);
            port.set_data_at(ticks, value & 2 != 0, true);
            value >>= 2;
            ticks += 120;
        }
        ticks += 20;
    }

    port.set_clock_at(ticks, true, false);
    port.set_data_at(ticks, true, true);
    // Hold time is up to the caller
}

/// Receive one byte of the FC3 save protocol.
pub fn fc3_get_byte(port: &mut impl TimedIecPort) -> u8 {
    // Settle delay, empirically derived
    port.delay_us(10);

    port.set_data(true);
    port.wait_clock(true, false);

    let result = recv_2bit(port, &FC3_GET);

    port.set_data(false);
    result
}

// --- Dreamload ---

/// Send one byte on ATN edges (host clocks with ATN).
pub fn dreamload_send_byte(port: &mut impl TimedIecPort, byte: u8) {
    let mut byte = byte;
    for _ in 0..2 {
        port.set_clock(byte & 1 != 0);
        port.set_data(byte & 2 != 0);
        while port.atn() {}

        port.set_clock(byte & 4 != 0);
        port.set_data(byte & 8 != 0);
        while !port.atn() {}

        byte >>= 4;
    }
}

/// Receive one byte on CLOCK edges.
pub fn dreamload_get_byte(port: &mut impl TimedIecPort) -> u8 {
    let mut result = 0u8;
    for _ in 0..4 {
        while port.clock() {}
        port.delay_us(3);
        result = (result << 1) | u8::from(!port.data());

        while !port.clock() {}
        port.delay_us(3);
        result = (result << 1) | u8::from(!port.data());
    }
    result
}

/// Receive one byte on ATN edges (the older protocol variant).
pub fn dreamload_get_byte_old(port: &mut impl TimedIecPort) -> u8 {
    let mut result = 0u8;
    for _ in 0..2 {
        result <<= 4;

        while port.atn() {}
        port.delay_us(3);
        let bus = port.lines();
        result |= u8::from(!bus.clock) << 3;
        result |= u8::from(!bus.data) << 1;

        while !port.atn() {}
        port.delay_us(3);
        let bus = port.lines();
        result |= u8::from(!bus.clock) << 2;
        result |= u8::from(!bus.data);
    }
    result
}

// --- ULoad Model 3 ---

const ULOAD3_GET: Generic2Bit = Generic2Bit {
    pair_times: [140, 240, 380, 480],
    clock_bits: [7, 6, 3, 2],
    data_bits: [5, 4, 1, 0],
    eor: 0xff,
};

const ULOAD3_SEND: Generic2Bit = Generic2Bit {
    pair_times: [140, 220, 300, 380],
    clock_bits: [0, 2, 4, 6],
    data_bits: [1, 3, 5, 7],
    eor: 0,
};

/// Receive one ULoad3 byte; `None` when ATN aborts the transfer.
pub fn uload3_get_byte(port: &mut impl TimedIecPort) -> Option<u8> {
    // Initial handshake
    port.set_clock(false);
    while port.data() && port.atn() {}
    if !port.atn() {
        return None;
    }

    // Wait for the start signal
    port.set_clock(true);
    port.wait_data(true, false);

    let result = recv_2bit(port, &ULOAD3_GET);

    // Wait until the host releases the bus
    port.delay_us(20);
    Some(result)
}

/// Send one ULoad3 byte.
pub fn uload3_send_byte(port: &mut impl TimedIecPort, byte: u8) {
    // Initial handshake
    port.set_data(false);
    while port.clock() && port.atn() {}
    if !port.atn() {
        return;
    }

    // Wait for the start signal
    port.set_data(true);
    if !port.wait_clock(true, true) {
        return;
    }

    send_2bit(port, &ULOAD3_SEND, byte);

    // Exit with clock and data released
    port.set_clock_at(480, true, false);
    port.set_data_at(480, true, true);
}

// --- Epyx FastLoad ---

const EPYXCART_SEND: Generic2Bit = Generic2Bit {
    pair_times: [100, 200, 300, 400],
    clock_bits: [7, 6, 3, 2],
    data_bits: [5, 4, 1, 0],
    eor: 0xff,
};

/// Send one Epyx byte; `true` when ATN aborted.
pub fn epyxcart_send_byte(port: &mut impl TimedIecPort, byte: u8) -> bool {
    // Clear bus
    port.set_data(true);
    port.set_clock(true);
    port.delay_us(3);

    // Wait for the start signal
    if !port.wait_data(true, true) {
        return true;
    }

    send_2bit(port, &EPYXCART_SEND, byte);

    // Data hold time
    port.delay_us(20);
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jiffy_tables_cover_all_bits() {
        for def in [&JIFFY_RECEIVE, &JIFFY_SEND, &TURBODISK_BYTE, &FC3_GET] {
            let mut seen = [false; 8];
            for i in 0..4 {
                seen[usize::from(def.clock_bits[i])] = true;
                seen[usize::from(def.data_bits[i])] = true;
            }
            assert!(seen.iter().all(|&b| b), "table misses a bit");
        }
    }

    #[test]
    fn pair_times_ascend() {
        for def in [
            &JIFFY_RECEIVE,
            &JIFFY_SEND,
            &TURBODISK_BYTE,
            &FC3_GET,
            &ULOAD3_GET,
            &ULOAD3_SEND,
            &EPYXCART_SEND,
        ] {
            for w in def.pair_times.windows(2) {
                assert!(w[0] < w[1]);
            }
        }
    }
}
