//! IEC bus state machine and byte transceiver.
//!
//! A close rendition of the bus handling in a 1571, kept compatible
//! with unmodified host software: the same handshake steps, the same
//! EOI timing, the same ATN dispatch. Waits poll the ATN line on every
//! iteration so a falling edge aborts the byte in progress and drops
//! the machine back into command processing.
//!
//! The machine advances one state per [`Drive::bus_step`] call; byte
//! transfers themselves are bounded busy-waits against the port.

use drive_core::{FileStore, MediaState, TimedIecPort};

use crate::drive::{ChannelRead, Drive};
use crate::partition::Mount;
use crate::status::errors;

/// Bus-level protocol state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BusState {
    #[default]
    Idle,
    FoundAtn,
    AtnActive,
    ForMe,
    NotForMe,
    AtnFinish,
    AtnProcess,
    Cleanup,
}

/// Role assigned by the last ATN sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceState {
    #[default]
    Idle,
    Listen,
    Talk,
}

/// Protocol flag bits.
#[derive(Debug, Clone, Copy, Default)]
pub struct IecFlags {
    /// VIC-20 mode halves the send bit times.
    pub vc20mode: bool,
    /// The current byte arrived with EOI.
    pub eoi_recvd: bool,
    /// A complete command/filename is waiting in the command buffer.
    pub command_recvd: bool,
    /// JiffyDOS detection is permitted.
    pub jiffy_enabled: bool,
    /// The host spoke JiffyDOS during the last ATN byte.
    pub jiffy_active: bool,
}

impl<F: FileStore> Drive<F> {
    /// Check for ATN changes and switch state accordingly.
    ///
    /// Returns `true` if the bus state changed; the caller must unwind
    /// to the main loop then.
    fn check_atn(&mut self, port: &mut impl TimedIecPort) -> bool {
        if self.bus_state == BusState::AtnActive {
            if port.atn() {
                self.bus_state = BusState::AtnProcess;
                true
            } else {
                false
            }
        } else if !port.atn() {
            self.bus_state = BusState::FoundAtn;
            true
        } else {
            false
        }
    }

    /// Receive one byte with the slow protocol.
    ///
    /// `Err` means the device state changed (ATN edge); return to the
    /// main loop.
    pub(crate) fn iec_getc(&mut self, port: &mut impl TimedIecPort) -> Result<u8, ()> {
        let mut val: u8 = 0;

        // Wait until the talker releases CLOCK
        loop {
            if self.check_atn(port) {
                return Err(());
            }
            if port.lines_stable().clock {
                break;
            }
        }

        port.set_data(true);
        // Wait until all other listeners released the data line
        while !port.data() {}

        // Timer for EOI detection
        port.start_timeout(256);
        let mut timeout;
        loop {
            if self.check_atn(port) {
                return Err(());
            }
            timeout = port.timed_out();
            if !port.lines_stable().clock || timeout {
                break;
            }
        }

        if timeout {
            // Timeout means EOI: acknowledge with a DATA pulse
            port.set_data(false);
            port.delay_us(73);
            port.set_data(true);

            log::trace!(target: "iec", "EOI");

            loop {
                if self.check_atn(port) {
                    return Err(());
                }
                if !port.lines_stable().clock {
                    break;
                }
            }
            self.flags.eoi_recvd = true;
        }

        for i in 0..8 {
            let sample;
            if self.bus_state == BusState::AtnActive && self.flags.jiffy_enabled && i == 7 {
                // A JiffyDOS host delays before the last bit; answer
                // within the window if the byte addresses us
                port.start_timeout(218);
                loop {
                    let lines = port.lines();
                    if !self.flags.jiffy_active && port.timed_out() {
                        if val < 0x60 && (val >> 1) & 0x1f == self.device_address {
                            port.set_data(false);
                            port.delay_us(101);
                            port.set_data(true);
                            self.flags.jiffy_active = true;
                        }
                    }
                    if lines.clock {
                        sample = lines;
                        break;
                    }
                }
            } else {
                // Capture data on the rising clock edge
                loop {
                    let lines = port.lines();
                    if lines.clock {
                        sample = lines;
                        break;
                    }
                }
            }

            val = (val >> 1) | (u8::from(sample.data) << 7);

            loop {
                if self.check_atn(port) {
                    return Err(());
                }
                if !port.lines_stable().clock {
                    break;
                }
            }
        }

        port.delay_us(5);
        port.set_data(false);
        // Slow down a little, some hosts need the breather
        port.delay_us(50);
        Ok(val)
    }

    /// Send one byte with the slow protocol.
    pub(crate) fn iec_putc(
        &mut self,
        port: &mut impl TimedIecPort,
        data: u8,
        with_eoi: bool,
    ) -> Result<(), ()> {
        if self.check_atn(port) {
            return Err(());
        }
        let initial = port.lines_stable();

        port.delay_us(60);
        port.set_clock(true);

        loop {
            if self.check_atn(port) {
                return Err(());
            }
            if port.lines_stable().data {
                break;
            }
        }

        if with_eoi || initial.data {
            // EOI handshake: listener acknowledges with a DATA pulse
            loop {
                if self.check_atn(port) {
                    return Err(());
                }
                if port.lines_stable().data {
                    break;
                }
            }
            loop {
                if self.check_atn(port) {
                    return Err(());
                }
                if !port.lines_stable().data {
                    break;
                }
            }
        }

        port.set_clock(false);
        port.delay_us(60);
        loop {
            if self.check_atn(port) {
                return Err(());
            }
            if port.lines_stable().data {
                break;
            }
        }

        for i in 0..8 {
            if !port.lines_stable().data {
                // Listener withdrew mid-byte
                self.bus_state = BusState::Cleanup;
                return Err(());
            }

            port.set_data(data & (1 << i) != 0);
            port.delay_us(70);
            port.set_clock(true);
            if self.flags.vc20mode {
                port.delay_us(34);
            } else {
                port.delay_us(69);
            }

            port.set_clock(false);
            port.set_data(true);
            port.delay_us(5);
        }

        loop {
            if self.check_atn(port) {
                return Err(());
            }
            if !port.lines_stable().data {
                break;
            }
        }

        Ok(())
    }

    /// Receive data bytes as a listener until UNLISTEN/ATN.
    ///
    /// Returns `true` if the bus state changed.
    fn iec_listen_handler(&mut self, port: &mut impl TimedIecPort, cmd: u8) -> bool {
        log::trace!(target: "iec", "listen {cmd:#04x}");

        let secondary = cmd & 0x0f;
        let is_open = cmd & 0xf0 == 0xf0;

        // Without an open write channel only OPEN data is acceptable
        if !is_open && secondary != 0x0f {
            match self.find_buffer(secondary) {
                Some(idx) if self.bufs[idx].write => {}
                _ => {
                    self.bus_state = BusState::Cleanup;
                    return true;
                }
            }
        }

        let command_mode = secondary == 0x0f || is_open;

        loop {
            let byte = if self.flags.jiffy_active {
                port.set_atn_ack(true);
                // Slow down or we'd see garbage from the host
                port.delay_us(50);
                let (byte, state) = crate::jiffy::jiffy_receive(port);
                if state.atn {
                    self.flags.eoi_recvd = state.clock;
                    byte
                } else {
                    // ATN went active during the transfer
                    match self.iec_getc(port) {
                        Ok(b) => b,
                        Err(()) => return true,
                    }
                }
            } else {
                match self.iec_getc(port) {
                    Ok(b) => b,
                    Err(()) => return true,
                }
            };

            if command_mode {
                self.push_command_byte(byte);
                if self.flags.eoi_recvd {
                    // File names are just a special kind of command
                    self.flags.command_recvd = true;
                }
            } else if self.channel_write(secondary, byte).is_err() {
                return true;
            }
        }
    }

    /// Send one data byte, with the protocol the host negotiated.
    ///
    /// Returns `true` on abort (ATN).
    fn talk_byte(&mut self, port: &mut impl TimedIecPort, byte: u8, eoi: bool) -> bool {
        if self.flags.jiffy_active {
            if crate::jiffy::jiffy_send(port, byte, eoi, false) {
                self.check_atn(port);
                return true;
            }
            false
        } else {
            self.iec_putc(port, byte, eoi).is_err()
        }
    }

    /// Transmit channel data as a talker until UNTALK/ATN.
    fn iec_talk_handler(&mut self, port: &mut impl TimedIecPort, cmd: u8) -> bool {
        log::trace!(target: "iec", "talk {cmd:#04x}");

        let secondary = cmd & 0x0f;
        if self.find_buffer(secondary).is_none() {
            // Nothing to say; state unchanged
            return false;
        }

        loop {
            let Some((byte, status)) = self.channel_read(secondary) else {
                return false;
            };
            match status {
                ChannelRead::More => {
                    if self.talk_byte(port, byte, false) {
                        return true;
                    }
                }
                ChannelRead::LastWithEoi => {
                    if self.talk_byte(port, byte, true) {
                        return true;
                    }
                    return false;
                }
                ChannelRead::Aborted => {
                    let _ = self.talk_byte(port, byte, false);
                    self.bus_state = BusState::Cleanup;
                    return true;
                }
            }
        }
    }

    /// Advance the bus state machine by one state.
    ///
    /// Blocking waits happen inside byte transfers; the `Idle` state
    /// polls once per call so hosts that stay quiet don't wedge the
    /// caller.
    pub fn bus_step(&mut self, port: &mut impl TimedIecPort) {
        match self.bus_state {
            BusState::Idle => {
                port.set_atn_ack(true);
                if port.atn() {
                    self.handle_swap_keys();
                } else {
                    self.bus_state = BusState::FoundAtn;
                }
            }

            BusState::FoundAtn => {
                // Pull data low to say we're here
                port.set_clock(true);
                port.set_data(false);
                port.set_atn_ack(false);

                self.device_state = DeviceState::Idle;
                self.bus_state = BusState::AtnActive;
                self.flags.eoi_recvd = false;
                self.flags.jiffy_active = false;

                // The host doesn't always pull CLOCK down before ATN;
                // these two waits keep us in sync with it
                port.start_timeout(100);
                while port.clock() && !port.timed_out() {
                    if port.atn() {
                        self.bus_state = BusState::AtnProcess;
                        return;
                    }
                }
                while !port.clock() {
                    if port.atn() {
                        self.bus_state = BusState::AtnProcess;
                        return;
                    }
                }
            }

            BusState::AtnActive => {
                let Ok(cmd) = self.iec_getc(port) else {
                    // check_atn changed our state
                    return;
                };

                log::trace!(target: "iec", "atn byte {cmd:#04x}");
                self.atn_cmd = cmd;

                if cmd == 0x3f {
                    // Unlisten
                    if self.device_state == DeviceState::Listen {
                        self.device_state = DeviceState::Idle;
                    }
                    self.bus_state = BusState::AtnFinish;
                } else if cmd == 0x5f {
                    // Untalk
                    if self.device_state == DeviceState::Talk {
                        self.device_state = DeviceState::Idle;
                    }
                    self.bus_state = BusState::AtnFinish;
                } else if cmd == 0x40 + self.device_address {
                    self.device_state = DeviceState::Talk;
                    self.bus_state = BusState::ForMe;
                } else if cmd == 0x20 + self.device_address {
                    self.device_state = DeviceState::Listen;
                    self.bus_state = BusState::ForMe;
                } else if cmd & 0x60 == 0x60 {
                    self.secondary = cmd & 0x0f;
                    // The 1571 handles CLOSE here, so we do that too
                    if cmd & 0xf0 == 0xe0 {
                        if cmd == 0xef {
                            // Closing secondary 15 closes everything
                            if self.free_user_buffers(true) {
                                self.bus_state = BusState::Cleanup;
                                return;
                            }
                        } else if self.close_channel(self.secondary).is_err() {
                            self.bus_state = BusState::Cleanup;
                            return;
                        }
                        self.bus_state = BusState::ForMe;
                    } else {
                        self.bus_state = BusState::AtnFinish;
                    }
                } else {
                    // Someone else's address
                    self.bus_state = BusState::NotForMe;
                }
            }

            BusState::ForMe => {
                if port.atn() {
                    self.bus_state = BusState::AtnProcess;
                } else {
                    self.bus_state = BusState::AtnActive;
                }
            }

            BusState::NotForMe => {
                port.set_atn_ack(false);
                port.set_clock(true);
                port.set_data(true);
                self.bus_state = BusState::AtnFinish;
            }

            BusState::AtnFinish => {
                if port.atn() {
                    self.bus_state = BusState::AtnProcess;
                }
            }

            BusState::AtnProcess => {
                port.set_atn_ack(true);
                let cmd = self.atn_cmd;

                match self.device_state {
                    DeviceState::Listen => {
                        if self.iec_listen_handler(port, cmd) {
                            return;
                        }
                    }
                    DeviceState::Talk => {
                        port.set_data(true);
                        port.delay_us(50);
                        port.set_clock(false);
                        port.delay_us(70);
                        if self.iec_talk_handler(port, cmd) {
                            return;
                        }
                    }
                    DeviceState::Idle => {}
                }
                self.bus_state = BusState::Cleanup;
            }

            BusState::Cleanup => {
                port.set_atn_ack(true);
                port.set_clock(true);
                port.set_data(true);

                // A nice point to handle media changes
                if self.parts[self.current_part].fs.media_state() == MediaState::Changed {
                    self.ui.busy_led(true);
                    self.free_user_buffers(false);
                    if self.parts[self.current_part].has_image() {
                        self.parts[self.current_part].mount = Mount::Fat;
                        self.bam.invalidate();
                    }
                    self.parts[self.current_part].current_dir = 0;
                    if self.parts[self.current_part].fs.remount().is_err() {
                        self.set_error(errors::DRIVE_NOT_READY);
                    }
                    if self.active_buffers == 0 {
                        self.ui.busy_led(false);
                        self.ui.dirty_led(false);
                    }
                }

                // Handle commands and file names
                if self.flags.command_recvd {
                    if self.secondary == 0x0f {
                        if let Some(loader) = self.execute_command() {
                            self.run_loader(port, loader);
                        }
                    } else {
                        self.datacrc = 0xffff;
                        self.file_open(self.secondary);
                    }
                    self.command.clear();
                    self.flags.command_recvd = false;
                }

                self.bus_state = BusState::Idle;
            }
        }
    }

    /// Run the bus forever, like firmware would.
    pub fn run(&mut self, port: &mut impl TimedIecPort) -> ! {
        loop {
            self.bus_step(port);
        }
    }
}
