//! Real-time clock boundary.

/// RTC availability, reported through the `T-R` command path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtcState {
    /// No clock chip present; time commands answer 30,SYNTAX ERROR.
    NotFound,
    /// Clock present but never set.
    Invalid,
    Ok,
}

/// Broken-down time, following the C `struct tm` conventions the
/// command-channel formats are defined against: `year` counts from 1900,
/// `month` is 0-based, `wday` 0 = Sunday.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtcTime {
    pub year: u16,
    pub month: u8,
    pub mday: u8,
    pub wday: u8,
    pub hour: u8,
    pub min: u8,
    pub sec: u8,
}

impl RtcTime {
    /// 1982-08-31, the timestamp faked for image files without dates.
    #[must_use]
    pub fn fallback() -> Self {
        Self {
            year: 82,
            month: 7,
            mday: 31,
            wday: 2,
            hour: 0,
            min: 0,
            sec: 0,
        }
    }
}

/// Clock chip access.
pub trait Rtc {
    fn state(&self) -> RtcState;
    fn read(&mut self) -> RtcTime;
    fn write(&mut self, time: &RtcTime);
}

/// In-memory clock for tests: holds whatever was last written.
pub struct SimRtc {
    state: RtcState,
    time: RtcTime,
}

impl SimRtc {
    /// A clock that reports [`RtcState::NotFound`].
    #[must_use]
    pub fn absent() -> Self {
        Self {
            state: RtcState::NotFound,
            time: RtcTime::fallback(),
        }
    }

    /// A running clock preset to the given time.
    #[must_use]
    pub fn running(time: RtcTime) -> Self {
        Self {
            state: RtcState::Ok,
            time,
        }
    }
}

impl Rtc for SimRtc {
    fn state(&self) -> RtcState {
        self.state
    }

    fn read(&mut self) -> RtcTime {
        self.time
    }

    fn write(&mut self, time: &RtcTime) {
        self.time = *time;
        self.state = RtcState::Ok;
    }
}
