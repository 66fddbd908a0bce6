use hifitime::prelude::{Duration, Epoch, TimeScale};

use gnss::prelude::Constellation;

use crate::constants::SECONDS_PER_WEEK;

/// SBAS PRN are streamed with a +100 offset by most receivers
pub const SBAS_PRN_OFFSET: u8 = 100;

/// Converts U-Blox GNSS id to [Constellation]
pub fn to_constellation(id: u8) -> Option<Constellation> {
    match id {
        0 => Some(Constellation::GPS),
        1 => Some(Constellation::SBAS),
        2 => Some(Constellation::Galileo),
        3 => Some(Constellation::BeiDou),
        5 => Some(Constellation::QZSS),
        6 => Some(Constellation::Glonass),
        _ => None,
    }
}

/// Builds a [TimeScale::GPST] [Epoch] from week counter and time of week in seconds.
pub fn gpst_epoch(week: u32, tow_s: f64) -> Epoch {
    let nanos = (tow_s * 1.0E9).round().max(0.0) as u64;
    Epoch::from_time_of_week(week, nanos, TimeScale::GPST)
}

/// Returns (week, time of week in seconds) of this [Epoch], in [TimeScale::GPST].
pub fn gpst_week_tow(t: Epoch) -> (u32, f64) {
    let (week, nanos) = t.to_time_scale(TimeScale::GPST).to_time_of_week();
    (week, nanos as f64 / 1.0E9)
}

/// Resolves a truncated (modulo 1024) GPS week counter,
/// picking the rollover closest to the reference week.
pub fn resolve_week(truncated: u32, reference_week: u32) -> u32 {
    let truncated = truncated % 1024;
    let mut week = reference_week - reference_week % 1024 + truncated;

    if week + 512 < reference_week {
        week += 1024;
    } else if week > reference_week + 512 && week >= 1024 {
        week -= 1024;
    }

    week
}

/// Resolves a time of week (seconds) against a reference [Epoch],
/// picking the week that brings it closest to the reference.
pub fn resolve_tow(tow_s: f64, reference: Epoch) -> Epoch {
    let (week, ref_tow) = gpst_week_tow(reference);
    let half_week = SECONDS_PER_WEEK / 2.0;

    let week = if tow_s - ref_tow > half_week && week > 0 {
        week - 1
    } else if ref_tow - tow_s > half_week {
        week + 1
    } else {
        week
    };

    gpst_epoch(week, tow_s)
}

/// Difference between two [Epoch]s, in seconds
pub fn seconds_between(t: Epoch, reference: Epoch) -> f64 {
    let dt: Duration = t - reference;
    dt.to_seconds()
}

#[cfg(test)]
mod test {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(252, 2300, 2300)]
    #[case(252, 2440, 2300)]
    #[case(1000, 2049, 2024)]
    #[case(5, 2047, 2053)]
    #[case(100, 100, 100)]
    fn week_rollover(#[case] truncated: u32, #[case] reference: u32, #[case] expected: u32) {
        assert_eq!(resolve_week(truncated, reference), expected);
    }

    #[test]
    fn tow_resolution() {
        let reference = gpst_epoch(2300, 604_000.0);

        // early next week
        let t = resolve_tow(10.0, reference);
        assert_eq!(gpst_week_tow(t), (2301, 10.0));

        // same week
        let t = resolve_tow(603_990.0, reference);
        assert_eq!(gpst_week_tow(t), (2300, 603_990.0));

        // late previous week
        let reference = gpst_epoch(2300, 5.0);
        let t = resolve_tow(604_790.0, reference);
        assert_eq!(gpst_week_tow(t), (2299, 604_790.0));
    }
}
