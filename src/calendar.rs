
//! Calendar contract for archive entry timestamps.
//!
//! The host supplies wall-clock time; archives store it in the two 16-bit
//! MS-DOS fields of the local and central file headers. A host without a
//! clock yields the all-zero date, like the original device did.

use bit_field::BitField;


/// A broken-down local time, as far as DOS timestamps can express one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalendarTime {
    pub year: u16,

    /// January is 1.
    pub month: u8,

    pub day: u8,
    pub hour: u8,
    pub minute: u8,

    /// DOS timestamps only keep even seconds.
    pub second: u8,
}

/// Where the device obtains timestamps for newly created entries.
pub trait Calendar {

    /// The current local time, or `None` when the host has no clock.
    fn get_time(&self) -> Option<CalendarTime>;
}


/// A calendar that always reports no time. Entries get the zero DOS date.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCalendar;

impl Calendar for NoCalendar {
    fn get_time(&self) -> Option<CalendarTime> { None }
}


/// The host clock, read through `std::time` and converted to a civil date.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemCalendar;

impl Calendar for SystemCalendar {
    fn get_time(&self) -> Option<CalendarTime> {
        let since_epoch = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH).ok()?;

        let seconds = since_epoch.as_secs();
        let days = (seconds / 86_400) as i64;
        let second_of_day = (seconds % 86_400) as u32;

        let (year, month, day) = civil_from_days(days);

        Some(CalendarTime {
            year: year as u16,
            month,
            day,
            hour: (second_of_day / 3600) as u8,
            minute: (second_of_day / 60 % 60) as u8,
            second: (second_of_day % 60) as u8,
        })
    }
}

/// Gregorian date from days since 1970-01-01 (Howard Hinnant's algorithm).
fn civil_from_days(days: i64) -> (i64, u8, u8) {
    let days = days + 719_468;
    let era = days.div_euclid(146_097);
    let day_of_era = days.rem_euclid(146_097);
    let year_of_era = (day_of_era - day_of_era/1460 + day_of_era/36_524 - day_of_era/146_096) / 365;
    let year = year_of_era + era * 400;
    let day_of_year = day_of_era - (365*year_of_era + year_of_era/4 - year_of_era/100);
    let mp = (5*day_of_year + 2) / 153;
    let day = (day_of_year - (153*mp + 2)/5 + 1) as u8;
    let month = if mp < 10 { mp + 3 } else { mp - 9 } as u8;
    (if month <= 2 { year + 1 } else { year }, month, day)
}


/// Pack a time into the combined DOS date/time value,
/// date in the upper half and time in the lower half.
/// Times before the DOS epoch of 1980 pack as zero.
pub fn dos_date_time(time: Option<CalendarTime>) -> u32 {
    let time = match time {
        Some(time) if time.year >= 1980 => time,
        _ => return 0,
    };

    let mut dos_time = 0_u16;
    dos_time.set_bits(0..5, u16::from(time.second) / 2);
    dos_time.set_bits(5..11, u16::from(time.minute));
    dos_time.set_bits(11..16, u16::from(time.hour));

    let mut dos_date = 0_u16;
    dos_date.set_bits(0..5, u16::from(time.day));
    dos_date.set_bits(5..9, u16::from(time.month));
    dos_date.set_bits(9..16, time.year - 1980);

    (u32::from(dos_date) << 16) | u32::from(dos_time)
}


#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn dos_packing(){
        let time = CalendarTime { year: 2008, month: 6, day: 13, hour: 14, minute: 30, second: 22 };
        let packed = dos_date_time(Some(time));

        assert_eq!(packed >> 16, (28 << 9) | (6 << 5) | 13);
        assert_eq!(packed & 0xffff, (14 << 11) | (30 << 5) | 11);
    }

    #[test]
    fn missing_clock_is_zero(){
        assert_eq!(dos_date_time(None), 0);
        assert_eq!(dos_date_time(Some(CalendarTime {
            year: 1969, month: 12, day: 31, hour: 23, minute: 59, second: 58
        })), 0);
    }

    #[test]
    fn civil_dates(){
        assert_eq!(civil_from_days(0), (1970, 1, 1));
        assert_eq!(civil_from_days(11_016), (2000, 2, 29));
        assert_eq!(civil_from_days(19_723), (2024, 1, 1));
    }
}
