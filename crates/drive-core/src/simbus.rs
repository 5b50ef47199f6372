//! Simulated IEC bus with a scripted host.
//!
//! [`SimBus`] implements the port traits against a virtual clock: every
//! line read advances time, so the drive's polling loops make progress
//! without real hardware. On the other side of the wire sits a small
//! host automaton that executes a script of bus operations — asserting
//! ATN, sending command bytes with the real handshake, turning the bus
//! around and acknowledging data bytes — reacting to the drive's line
//! changes the way a host machine ROM would.
//!
//! Time is counted in 100 ns ticks to match the fastloader interface.

use std::collections::VecDeque;

use crate::bus::{IecPort, Lines, TimedIecPort};

/// Ticks per microsecond.
const US: u64 = 10;

/// Virtual-time safety cap: 60 seconds.
const TIME_CAP: u64 = 600_000_000;

/// One scripted host action.
#[derive(Debug, Clone)]
pub enum HostOp {
    /// Pull ATN (and CLOCK) low, as a host starting a command does.
    AtnAssert,
    /// Send one byte under ATN.
    AtnByte(u8),
    /// Send one byte under ATN, stretching the pause before the last
    /// bit past the JiffyDOS detection window.
    AtnByteJiffyProbe(u8),
    /// Release ATN, keeping the talker role.
    AtnRelease,
    /// Send one data byte as talker.
    SendByte(u8),
    /// Send one data byte as talker, signalling EOI.
    SendByteEoi(u8),
    /// Start sending a data byte, then drop ATN after bit 3.
    SendByteAbortAtn(u8),
    /// Release ATN and become listener (after TALK + secondary).
    Turnaround,
    /// Receive data bytes, acknowledging each, until one carries EOI.
    Receive,
    /// Do nothing for a while.
    WaitMicros(u32),
    /// Release every host line.
    ReleaseBus,
}

/// Substates of the host automaton.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Init,
    /// Sending: wait for the drive to release DATA.
    WaitListenerReady,
    /// Sending with EOI: wait for the ack pulse (low, then high).
    EoiAckLow,
    EoiAckHigh,
    /// Sending: short pause, then pull CLOCK to start the bits.
    StartBits,
    /// Sending: per-bit low/high/low phases.
    BitSetup,
    BitHigh,
    /// Sending: wait for the listener's ack.
    WaitAck,
    /// Receiving: wait for the drive to signal byte-ready.
    WaitTalkerReady,
    /// Receiving: watch for the first clock edge or the EOI timeout.
    WatchEoi,
    /// Receiving: EOI ack pulse in progress.
    EoiPulse,
    /// Receiving: wait for the bit phase to start.
    WaitBitsStart,
    /// Receiving: sample bits on clock edges.
    RecvBitHigh,
    RecvBitLow,
    /// Sending (JiffyDOS probe): put the real bit back before the edge.
    BitLate,
    /// Receiving: hold-off before pulling DATA as ack.
    AckDelay,
    /// Waiting for a deadline.
    Delay,
    /// Turnaround: wait for the drive to assert CLOCK.
    WaitDriveClock,
}

struct Host {
    /// Host-side pulls; `true` = pulling the line low.
    atn: bool,
    clock: bool,
    data: bool,

    script: VecDeque<HostOp>,
    phase: Phase,
    deadline: u64,
    t0: u64,
    bit: u8,
    shift: u8,
    pending_eoi: bool,
    prev_clock: bool,

    /// Bytes received from the drive with their EOI flags.
    received: Vec<(u8, bool)>,
    /// The drive answered the JiffyDOS probe with a DATA pulse.
    saw_jiffy_ack: bool,
}

impl Host {
    fn new() -> Self {
        Self {
            atn: false,
            clock: false,
            data: false,
            script: VecDeque::new(),
            phase: Phase::Init,
            deadline: 0,
            t0: 0,
            bit: 0,
            shift: 0,
            pending_eoi: false,
            prev_clock: true,
            received: Vec::new(),
            saw_jiffy_ack: false,
        }
    }

    fn current(&self) -> Option<&HostOp> {
        self.script.front()
    }

    fn finish_op(&mut self) {
        self.script.pop_front();
        self.phase = Phase::Init;
    }

    /// Advance the automaton by one time slice.
    ///
    /// `lines` is the resolved bus state including the drive's pulls.
    fn step(&mut self, now: u64, lines: Lines) {
        let rising_clock = lines.clock && !self.prev_clock;
        let falling_clock = !lines.clock && self.prev_clock;
        self.prev_clock = lines.clock;

        let Some(op) = self.current().cloned() else {
            return;
        };

        match op {
            HostOp::AtnAssert => match self.phase {
                Phase::Init => {
                    self.atn = true;
                    self.clock = true;
                    self.data = false;
                    self.deadline = now + 100 * US;
                    self.phase = Phase::Delay;
                }
                _ => {
                    if now >= self.deadline {
                        self.finish_op();
                    }
                }
            },

            HostOp::AtnRelease => match self.phase {
                Phase::Init => {
                    self.atn = false;
                    self.deadline = now + 30 * US;
                    self.phase = Phase::Delay;
                }
                _ => {
                    if now >= self.deadline {
                        self.finish_op();
                    }
                }
            },

            HostOp::AtnByte(byte) | HostOp::SendByte(byte) => {
                self.send_byte_step(now, lines, byte, false, false, false);
            }
            HostOp::SendByteEoi(byte) => {
                self.send_byte_step(now, lines, byte, true, false, false);
            }
            HostOp::AtnByteJiffyProbe(byte) => {
                self.send_byte_step(now, lines, byte, false, true, false);
            }
            HostOp::SendByteAbortAtn(byte) => {
                self.send_byte_step(now, lines, byte, false, false, true);
            }

            HostOp::Turnaround => match self.phase {
                Phase::Init => {
                    self.atn = false;
                    self.clock = false;
                    self.data = true;
                    self.phase = Phase::WaitDriveClock;
                }
                _ => {
                    if !lines.clock {
                        self.finish_op();
                    }
                }
            },

            HostOp::Receive => self.receive_step(now, lines, rising_clock, falling_clock),

            HostOp::WaitMicros(us) => match self.phase {
                Phase::Init => {
                    self.deadline = now + u64::from(us) * US;
                    self.phase = Phase::Delay;
                }
                _ => {
                    if now >= self.deadline {
                        self.finish_op();
                    }
                }
            },

            HostOp::ReleaseBus => match self.phase {
                Phase::Init => {
                    self.atn = false;
                    self.clock = false;
                    self.data = false;
                    self.deadline = now + 10 * US;
                    self.phase = Phase::Delay;
                }
                _ => {
                    if now >= self.deadline {
                        self.finish_op();
                    }
                }
            },
        }
    }

    /// Host-as-talker byte transfer.
    fn send_byte_step(
        &mut self,
        now: u64,
        lines: Lines,
        byte: u8,
        eoi: bool,
        jiffy: bool,
        abort: bool,
    ) {
        match self.phase {
            Phase::Init => {
                // Announce the byte by releasing CLOCK
                self.clock = false;
                self.phase = Phase::WaitListenerReady;
            }
            Phase::WaitListenerReady => {
                if lines.data {
                    if eoi {
                        self.phase = Phase::EoiAckLow;
                    } else {
                        self.deadline = now + 8 * US;
                        self.phase = Phase::StartBits;
                    }
                }
            }
            Phase::EoiAckLow => {
                // The listener times out and pulses DATA to confirm EOI
                if !lines.data {
                    self.phase = Phase::EoiAckHigh;
                }
            }
            Phase::EoiAckHigh => {
                if lines.data {
                    self.deadline = now + 8 * US;
                    self.phase = Phase::StartBits;
                }
            }
            Phase::StartBits => {
                if now >= self.deadline {
                    self.clock = true;
                    self.bit = 0;
                    self.deadline = now + 25 * US;
                    self.phase = Phase::BitSetup;
                }
            }
            Phase::BitSetup => {
                if now >= self.deadline {
                    if abort && self.bit == 3 {
                        // Mid-byte ATN drop; the host restarts with a
                        // command byte right after
                        self.atn = true;
                        self.clock = true;
                        self.data = false;
                        self.finish_op();
                        return;
                    }
                    let value = byte & (1 << self.bit) != 0;
                    if jiffy && self.bit == 7 {
                        // A JiffyDOS host releases DATA here and
                        // stretches the pause, watching for the
                        // drive's acknowledge pulse
                        self.data = false;
                        self.deadline = now + 260 * US;
                    } else {
                        // Put the bit on DATA while CLOCK is low
                        self.data = !value;
                        self.deadline = now + 20 * US;
                    }
                    self.phase = Phase::BitHigh;
                }
            }
            Phase::BitHigh => {
                if jiffy && self.bit == 7 && !lines.data && !self.data {
                    self.saw_jiffy_ack = true;
                }
                if now >= self.deadline {
                    if jiffy && self.bit == 7 {
                        self.shift = 0;
                        self.phase = Phase::BitLate;
                    } else {
                        self.clock = false;
                        self.deadline = now + 20 * US;
                        self.phase = Phase::AckDelay;
                    }
                }
            }
            Phase::BitLate => {
                if self.shift == 0 {
                    // The acknowledge pulse must be over before the
                    // last bit goes on the wire
                    if lines.data {
                        self.data = !(byte & 0x80 != 0);
                        self.deadline = now + 5 * US;
                        self.shift = 1;
                    }
                } else if now >= self.deadline {
                    self.clock = false;
                    self.deadline = now + 20 * US;
                    self.phase = Phase::AckDelay;
                    self.shift = 0;
                }
            }
            Phase::AckDelay => {
                if now >= self.deadline {
                    self.clock = true;
                    self.bit += 1;
                    if self.bit == 8 {
                        self.data = false;
                        self.phase = Phase::WaitAck;
                    } else {
                        self.deadline = now + 5 * US;
                        self.phase = Phase::BitSetup;
                    }
                }
            }
            Phase::WaitAck => {
                if !lines.data {
                    self.finish_op();
                }
            }
            _ => {}
        }
    }

    /// Host-as-listener byte transfers, until EOI.
    fn receive_step(&mut self, now: u64, lines: Lines, rising: bool, falling: bool) {
        match self.phase {
            Phase::Init | Phase::WaitTalkerReady => {
                self.phase = Phase::WaitTalkerReady;
                if lines.clock {
                    // Drive is ready: signal our readiness
                    self.data = false;
                    self.t0 = now;
                    self.phase = Phase::WatchEoi;
                }
            }
            Phase::WatchEoi => {
                if !lines.clock {
                    self.bit = 0;
                    self.shift = 0;
                    self.phase = Phase::RecvBitHigh;
                } else if now - self.t0 > 200 * US {
                    // No clock within 200 µs: EOI, acknowledge it
                    self.pending_eoi = true;
                    self.data = true;
                    self.deadline = now + 60 * US;
                    self.phase = Phase::EoiPulse;
                }
            }
            Phase::EoiPulse => {
                if now >= self.deadline {
                    self.data = false;
                    self.phase = Phase::WaitBitsStart;
                }
            }
            Phase::WaitBitsStart => {
                if !lines.clock {
                    self.bit = 0;
                    self.shift = 0;
                    self.phase = Phase::RecvBitHigh;
                }
            }
            Phase::RecvBitHigh => {
                if rising {
                    // Bit valid while CLOCK is high
                    self.shift |= u8::from(lines.data) << self.bit;
                    self.phase = Phase::RecvBitLow;
                }
            }
            Phase::RecvBitLow => {
                if falling {
                    self.bit += 1;
                    if self.bit == 8 {
                        self.deadline = now + 15 * US;
                        self.phase = Phase::AckDelay;
                    } else {
                        self.phase = Phase::RecvBitHigh;
                    }
                }
            }
            Phase::AckDelay => {
                if now >= self.deadline {
                    self.data = true;
                    let eoi = self.pending_eoi;
                    self.received.push((self.shift, eoi));
                    if eoi {
                        self.pending_eoi = false;
                        self.finish_op();
                    } else {
                        self.phase = Phase::WaitTalkerReady;
                    }
                }
            }
            _ => {}
        }
    }
}

/// Simulated bus port with virtual time.
pub struct SimBus {
    now: u64,
    reference: u64,
    timeout_at: Option<u64>,

    /// Drive-side pulls.
    drv_clock: bool,
    drv_data: bool,
    drv_srq: bool,
    atn_ack: bool,

    host: Host,
}

impl SimBus {
    #[must_use]
    pub fn new() -> Self {
        Self {
            now: 0,
            reference: 0,
            timeout_at: None,
            drv_clock: false,
            drv_data: false,
            drv_srq: false,
            atn_ack: false,
            host: Host::new(),
        }
    }

    /// Append one operation to the host script.
    pub fn push(&mut self, op: HostOp) {
        self.host.script.push_back(op);
    }

    /// Append several operations.
    pub fn script(&mut self, ops: impl IntoIterator<Item = HostOp>) {
        for op in ops {
            self.push(op);
        }
    }

    /// Whether the host has worked through its whole script.
    #[must_use]
    pub fn host_done(&self) -> bool {
        self.host.script.is_empty()
    }

    /// Bytes the host received from the drive, with their EOI flags.
    #[must_use]
    pub fn received(&self) -> &[(u8, bool)] {
        &self.host.received
    }

    /// Just the received bytes.
    #[must_use]
    pub fn received_bytes(&self) -> Vec<u8> {
        self.host.received.iter().map(|&(b, _)| b).collect()
    }

    /// The drive acknowledged the JiffyDOS probe in time.
    #[must_use]
    pub fn saw_jiffy_ack(&self) -> bool {
        self.host.saw_jiffy_ack
    }

    /// Current virtual time in 100 ns ticks.
    #[must_use]
    pub fn time(&self) -> u64 {
        self.now
    }

    fn resolve(&self) -> Lines {
        Lines {
            atn: !self.host.atn,
            clock: !(self.host.clock || self.drv_clock),
            data: !(self.host.data || self.drv_data),
            srq: !self.drv_srq,
        }
    }

    /// Advance virtual time, stepping the host automaton along.
    fn advance(&mut self, ticks: u64) {
        assert!(self.now < TIME_CAP, "virtual bus time exceeded, deadlock?");
        let target = self.now + ticks;
        while self.now < target {
            let step = (target - self.now).min(US);
            self.now += step;

            let lines = self.resolve();
            self.host.step(self.now, lines);

            // Hardware ATN acknowledge: a low ATN forces DATA low
            if self.atn_ack && self.host.atn {
                self.drv_data = true;
            }
        }
    }

    fn advance_until(&mut self, target: u64) {
        while self.now < target {
            self.advance(US.min(target - self.now));
        }
    }
}

impl Default for SimBus {
    fn default() -> Self {
        Self::new()
    }
}

impl IecPort for SimBus {
    fn lines(&mut self) -> Lines {
        self.advance(US);
        self.resolve()
    }

    fn set_clock(&mut self, high: bool) {
        self.drv_clock = !high;
        self.advance(1);
    }

    fn set_data(&mut self, high: bool) {
        self.drv_data = !high;
        self.advance(1);
    }

    fn set_srq(&mut self, high: bool) {
        self.drv_srq = !high;
        self.advance(1);
    }

    fn set_atn_ack(&mut self, on: bool) {
        self.atn_ack = on;
        self.advance(1);
    }

    fn delay_us(&mut self, us: u32) {
        self.advance(u64::from(us) * US);
    }

    fn start_timeout(&mut self, us: u32) {
        self.timeout_at = Some(self.now + u64::from(us) * US);
    }

    fn timed_out(&mut self) -> bool {
        self.advance(1);
        self.timeout_at.is_some_and(|at| self.now >= at)
    }
}

impl TimedIecPort for SimBus {
    fn now(&mut self) -> u32 {
        self.now as u32
    }

    fn set_reference(&mut self, ticks: u32) {
        self.reference = self.now + u64::from(ticks);
    }

    fn wait_atn(&mut self, high: bool) {
        loop {
            self.advance(5);
            if self.resolve().atn == high {
                self.reference = self.now;
                return;
            }
        }
    }

    fn wait_clock(&mut self, high: bool, atn_abort: bool) -> bool {
        loop {
            self.advance(5);
            let lines = self.resolve();
            if atn_abort && !lines.atn {
                self.reference = self.now;
                return false;
            }
            if lines.clock == high {
                self.reference = self.now;
                return true;
            }
        }
    }

    fn wait_data(&mut self, high: bool, atn_abort: bool) -> bool {
        loop {
            self.advance(5);
            let lines = self.resolve();
            if atn_abort && !lines.atn {
                self.reference = self.now;
                return false;
            }
            if lines.data == high {
                self.reference = self.now;
                return true;
            }
        }
    }

    fn set_clock_at(&mut self, ticks: u32, high: bool, _wait: bool) {
        self.advance_until(self.reference + u64::from(ticks));
        self.drv_clock = !high;
    }

    fn set_data_at(&mut self, ticks: u32, high: bool, _wait: bool) {
        self.advance_until(self.reference + u64::from(ticks));
        self.drv_data = !high;
    }

    fn read_bus_at(&mut self, ticks: u32) -> Lines {
        self.advance_until(self.reference + u64::from(ticks));
        self.resolve()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lines_start_released() {
        let mut bus = SimBus::new();
        let lines = bus.lines();
        assert!(lines.atn && lines.clock && lines.data && lines.srq);
    }

    #[test]
    fn open_collector_resolution() {
        let mut bus = SimBus::new();
        bus.set_data(false);
        assert!(!bus.lines().data);
        bus.push(HostOp::AtnAssert);
        bus.delay_us(200);
        // Host pulls ATN and CLOCK
        assert!(!bus.lines().atn);
        assert!(!bus.lines().clock);
        bus.set_data(true);
        assert!(bus.lines().data);
    }

    #[test]
    fn atn_ack_forces_data_low() {
        let mut bus = SimBus::new();
        bus.set_atn_ack(true);
        bus.push(HostOp::AtnAssert);
        bus.delay_us(50);
        assert!(!bus.lines().data);
        // The pull is latched on the drive side
        assert!(bus.drv_data);
    }

    #[test]
    fn timeout_expires_on_schedule() {
        let mut bus = SimBus::new();
        bus.start_timeout(100);
        assert!(!bus.timed_out());
        bus.delay_us(150);
        assert!(bus.timed_out());
    }

    #[test]
    fn virtual_time_advances_per_read() {
        let mut bus = SimBus::new();
        let before = bus.time();
        let _ = bus.lines();
        assert!(bus.time() > before);
    }
}
