//! Recovery of high-precision inter-packet timing from the narrow hardware
//! counter the sniffer firmware stamps into every capture header.

use std::fmt;
use std::time::SystemTime;

/// Elapsed host time within which two captures are close enough for an
/// overflow-safe counter delta. Kept below 16 s, the rollover period of the
/// 3-byte RZ timer.
pub const PRECISION_TIMEFRAME_S: u64 = 10;

/// Digits a delta can reach inside the timeframe, and the printed column width.
pub const PRECISION_BASE_US: usize = 7;

/// Deltas are reduced modulo this so they fit the fixed output column.
pub const PRECISION_FACTOR_US: u64 = 10u64.pow(PRECISION_BASE_US as u32 + 1);

/// Hardware families the firmware reports in its status reply. The family
/// decides how many capture-header bytes carry the microsecond timer and
/// where that counter wraps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceFamily {
    #[default]
    Unknown,
    /// dresden elektronik boards: 4 timer bytes, wraps at 2^32.
    De,
    /// Atmel RZ sticks: 3 timer bytes (header bytes 1..4), wraps at 2^24.
    Rz,
}

impl DeviceFamily {
    /// Status-reply byte identifying each family.
    pub fn from_status_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::De),
            0x02 => Some(Self::Rz),
            _ => None,
        }
    }

    /// Counter rollover modulus, if the family is known.
    pub fn timer_modulus(&self) -> Option<u64> {
        match self {
            Self::De => Some(1 << 32),
            Self::Rz => Some(1 << 24),
            Self::Unknown => None,
        }
    }

    /// Extracts the little-endian timer value from a capture header.
    pub fn timer_value(&self, header: &[u8; 8]) -> u64 {
        match self {
            Self::De => u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as u64,
            Self::Rz => u32::from_le_bytes([header[1], header[2], header[3], 0]) as u64,
            Self::Unknown => 0,
        }
    }
}

impl fmt::Display for DeviceFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::De => write!(f, "DE"),
            Self::Rz => write!(f, "RZ"),
            Self::Unknown => Ok(()),
        }
    }
}

/// Running counters carried between captures so each delta can account for
/// timer wraparound.
#[derive(Debug, Default, Clone, Copy)]
pub struct TimingState {
    last_timer: u64,
    last_stamp_ms: u64,
}

impl TimingState {
    /// Reconstructs the microsecond delta between the previous capture and
    /// one stamped `raw` by the device counter at host time `stamp_ms`.
    ///
    /// A delta only exists when the previous capture is fresh: within
    /// [`PRECISION_TIMEFRAME_S`] of host time. Outside that window the
    /// counter may have wrapped any number of times, so 0 is reported
    /// rather than a guess. The running counters update either way.
    pub fn recover(&mut self, family: DeviceFamily, raw: u64, stamp_ms: u64) -> u64 {
        let mut delta = 0;
        if let Some(modulus) = family.timer_modulus() {
            let fresh = self.last_stamp_ms > stamp_ms.saturating_sub(PRECISION_TIMEFRAME_S * 1000);
            if fresh {
                // A family re-identification can leave a counter wider than
                // the current modulus behind; fold it in range first.
                let last = self.last_timer % modulus;
                delta = if raw >= last {
                    raw - last
                } else {
                    modulus - last + raw
                } % PRECISION_FACTOR_US;
            }
        }
        self.last_timer = raw;
        self.last_stamp_ms = stamp_ms;
        delta
    }
}

/// Wall clock in milliseconds, the host-side timestamp of capture records.
pub fn host_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("Time went backwards")
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_state(last_timer: u64, last_stamp_ms: u64) -> TimingState {
        TimingState {
            last_timer,
            last_stamp_ms,
        }
    }

    #[test]
    fn forward_delta_within_window() {
        let mut state = fresh_state(2_000, 1_000_000);
        assert_eq!(state.recover(DeviceFamily::De, 5_000, 1_000_500), 3_000);
    }

    #[test]
    fn wraparound_de() {
        let mut state = fresh_state(0xFFFF_FFFE, 1_000_000);
        // Counter rolled over: 2 ticks to the top plus 1 past it.
        assert_eq!(state.recover(DeviceFamily::De, 0x1, 1_000_050), 3);
    }

    #[test]
    fn wraparound_rz() {
        let mut state = fresh_state(0xFF_FFFE, 1_000_000);
        assert_eq!(state.recover(DeviceFamily::Rz, 0x1, 1_000_050), 3);
    }

    #[test]
    fn equal_counters_give_zero() {
        let mut state = fresh_state(1_234, 1_000_000);
        assert_eq!(state.recover(DeviceFamily::De, 1_234, 1_000_001), 0);
    }

    #[test]
    fn stale_previous_stamp_gives_zero() {
        let mut state = fresh_state(2_000, 1_000_000);
        let delta = state.recover(DeviceFamily::De, 900_000, 1_000_000 + 11_000);
        assert_eq!(delta, 0);
        // Counters still advanced for the next capture.
        assert_eq!(state.recover(DeviceFamily::De, 901_000, 1_000_000 + 11_500), 1_000);
    }

    #[test]
    fn first_sample_gives_zero() {
        let mut state = TimingState::default();
        assert_eq!(state.recover(DeviceFamily::De, 42, 1_000_000), 0);
    }

    #[test]
    fn unknown_family_gives_zero() {
        let mut state = fresh_state(2_000, 1_000_000);
        assert_eq!(state.recover(DeviceFamily::Unknown, 5_000, 1_000_100), 0);
    }

    #[test]
    fn delta_reduced_to_column_width() {
        let mut state = fresh_state(0, 1_000_000);
        let delta = state.recover(DeviceFamily::De, 150_000_000, 1_000_900);
        assert_eq!(delta, 50_000_000);
    }

    #[test]
    fn timer_extraction_per_family() {
        let header = [0x01, 0x02, 0x03, 0x04, 0x00, 0x0F, 0x00, 0x00];
        assert_eq!(DeviceFamily::De.timer_value(&header), 0x0403_0201);
        assert_eq!(DeviceFamily::Rz.timer_value(&header), 0x04_0302);
        assert_eq!(DeviceFamily::Unknown.timer_value(&header), 0);
    }

    #[test]
    fn family_from_status_byte() {
        assert_eq!(DeviceFamily::from_status_byte(0x01), Some(DeviceFamily::De));
        assert_eq!(DeviceFamily::from_status_byte(0x02), Some(DeviceFamily::Rz));
        assert_eq!(DeviceFamily::from_status_byte(0x77), None);
    }
}
