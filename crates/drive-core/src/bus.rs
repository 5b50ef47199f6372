//! IEC bus port abstraction.
//!
//! Four open-collector lines: ATN, CLOCK, DATA, SRQ. All are active-low on
//! the wire; a line reads high only while nobody pulls it low. The port
//! setters follow drive firmware convention: `true` releases the line
//! (high-impedance, reads high if no other participant pulls), `false`
//! drives it low.
//!
//! Timing facilities come in two tiers. [`IecPort`] covers the standard
//! protocol: microsecond busy-wait delays and a one-shot countdown timeout
//! that can be polled from inside tight loops. [`TimedIecPort`] adds the
//! edge-capture/match-output primitives the fastloader codecs are built on:
//! a 100 ns reference clock, "capture the time of the next edge" waits, and
//! "change this line at reference + N ticks" scheduling.

/// Snapshot of the four bus lines. `true` = line reads high (released).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lines {
    pub atn: bool,
    pub clock: bool,
    pub data: bool,
    pub srq: bool,
}

impl Lines {
    /// All lines released.
    #[must_use]
    pub fn released() -> Self {
        Self {
            atn: true,
            clock: true,
            data: true,
            srq: true,
        }
    }
}

/// Drive-side access to the serial bus.
///
/// One call to any line getter corresponds to one hardware pin read;
/// simulated ports advance their virtual clock per read so that the
/// engine's polling loops make progress against scripted hosts.
pub trait IecPort {
    /// Read all four lines at once.
    fn lines(&mut self) -> Lines;

    /// ATN line level.
    fn atn(&mut self) -> bool {
        self.lines().atn
    }

    /// CLOCK line level.
    fn clock(&mut self) -> bool {
        self.lines().clock
    }

    /// DATA line level.
    fn data(&mut self) -> bool {
        self.lines().data
    }

    /// Release (`true`) or pull down (`false`) the CLOCK line.
    fn set_clock(&mut self, high: bool);

    /// Release (`true`) or pull down (`false`) the DATA line.
    fn set_data(&mut self, high: bool);

    /// Release or pull the SRQ line. Unused by the stock protocol.
    fn set_srq(&mut self, _high: bool) {}

    /// Enable or disable the automatic ATN acknowledge.
    ///
    /// While enabled, a falling edge on ATN must pull DATA low from
    /// interrupt (or fast-poll) context, well before the engine's main
    /// loop notices the edge.
    fn set_atn_ack(&mut self, on: bool);

    /// Busy-wait for the given number of microseconds.
    fn delay_us(&mut self, us: u32);

    /// Arm the countdown timeout.
    fn start_timeout(&mut self, us: u32);

    /// Whether the armed timeout has expired.
    fn timed_out(&mut self) -> bool;

    /// Read the lines twice, 2 µs apart, until two reads agree.
    ///
    /// The 1571 ROM debounces its port input the same way.
    fn lines_stable(&mut self) -> Lines {
        loop {
            let first = self.lines();
            self.delay_us(2);
            if first == self.lines() {
                return first;
            }
        }
    }

    /// Whether the clock source is stable enough for cycle-exact loaders.
    ///
    /// Ports running from an uncalibrated RC oscillator return `false`
    /// and the Turbodisk entry point refuses to start.
    fn stable_clock(&mut self) -> bool {
        true
    }
}

/// Edge-capture and match-output extensions used by the fastloader codecs.
///
/// All tick values are in units of 100 ns. The `wait_*` functions capture
/// the time of the observed edge as the reference point; the `set_*_at`
/// and [`read_bus_at`](TimedIecPort::read_bus_at) functions act at
/// `reference + ticks`.
pub trait TimedIecPort: IecPort {
    /// Current free-running tick counter.
    fn now(&mut self) -> u32;

    /// Set the reference time to `now() + ticks`.
    fn set_reference(&mut self, ticks: u32);

    /// Wait until ATN has the given level; capture the edge time.
    fn wait_atn(&mut self, high: bool);

    /// Wait until CLOCK has the given level; capture the edge time.
    ///
    /// Returns `false` if `atn_abort` is set and ATN went low first
    /// (the current time is captured instead).
    fn wait_clock(&mut self, high: bool, atn_abort: bool) -> bool;

    /// Wait until DATA has the given level; capture the edge time.
    fn wait_data(&mut self, high: bool, atn_abort: bool) -> bool;

    /// Change CLOCK at `reference + ticks`, optionally waiting for it.
    fn set_clock_at(&mut self, ticks: u32, high: bool, wait: bool);

    /// Change DATA at `reference + ticks`, optionally waiting for it.
    fn set_data_at(&mut self, ticks: u32, high: bool, wait: bool);

    /// Sample the bus at `reference + ticks`.
    fn read_bus_at(&mut self, ticks: u32) -> Lines;
}
