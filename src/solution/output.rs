use hifitime::TimeScale;
use log::error;

use crate::{
    nmea,
    settings::{SolutionFormat, SolutionOutputOptions, TimeFormat},
    solution::{Quality, Solution},
    utils::gpst_week_tow,
};

/// Formats [Solution]s for one solution output stream
#[derive(Debug, Clone)]
pub struct SolutionWriter {
    options: SolutionOutputOptions,
}

impl SolutionWriter {
    pub fn new(options: SolutionOutputOptions) -> Self {
        Self { options }
    }

    fn time_header(&self) -> &'static str {
        match self.options.time {
            TimeFormat::GpsWeekTow => "GPST week   tow(s)",
            TimeFormat::Calendar => "GPST",
        }
    }

    /// Header line, emitted once when the stream opens
    pub fn header(&self) -> Option<String> {
        if !self.options.header {
            return None;
        }

        match self.options.format {
            SolutionFormat::Llh => Some(format!(
                "% {} latitude(deg) longitude(deg) height(m) Q ns sde(m) sdn(m) sdu(m) age(s)\n",
                self.time_header()
            )),
            SolutionFormat::Xyz => Some(format!(
                "% {} x-ecef(m) y-ecef(m) z-ecef(m) Q ns sdx(m) sdy(m) sdz(m) age(s)\n",
                self.time_header()
            )),
            SolutionFormat::Nmea | SolutionFormat::Json => None,
        }
    }

    fn time(&self, solution: &Solution) -> String {
        match self.options.time {
            TimeFormat::GpsWeekTow => {
                let (week, tow) = gpst_week_tow(solution.epoch);
                format!("{:4} {:10.3}", week, tow)
            },
            TimeFormat::Calendar => format!("{}", solution.epoch.to_time_scale(TimeScale::GPST)),
        }
    }

    /// Formats this [Solution], as one (or more) complete line(s).
    /// Positional formats have nothing to report without a fix:
    /// only the Json format describes [Quality::NoFix] solutions.
    pub fn format(&self, solution: &Solution) -> Option<String> {
        if !solution.is_fix() && self.options.format != SolutionFormat::Json {
            return None;
        }

        let formatted = match self.options.format {
            SolutionFormat::Llh => {
                let (lat, lon, h) = solution.geodetic();
                let std = solution.enu_std_m();
                format!(
                    "{} {:14.9} {:14.9} {:10.4} {:3} {:3} {:8.4} {:8.4} {:8.4} {:6.2}\n",
                    self.time(solution),
                    lat,
                    lon,
                    h,
                    solution.quality.flag(),
                    solution.satellites,
                    std[0],
                    std[1],
                    std[2],
                    solution.age_s,
                )
            },
            SolutionFormat::Xyz => {
                let [x, y, z] = solution.position_ecef_m;
                let [vx, vy, vz] = solution.variance_m2;
                format!(
                    "{} {:14.4} {:14.4} {:14.4} {:3} {:3} {:8.4} {:8.4} {:8.4} {:6.2}\n",
                    self.time(solution),
                    x,
                    y,
                    z,
                    solution.quality.flag(),
                    solution.satellites,
                    vx.sqrt(),
                    vy.sqrt(),
                    vz.sqrt(),
                    solution.age_s,
                )
            },
            SolutionFormat::Nmea => {
                let age = if solution.quality == Quality::Dgps {
                    Some(solution.age_s)
                } else {
                    None
                };
                let hdop = solution.enu_std_m().xy().norm();
                nmea::gga(
                    solution.epoch,
                    &solution.position(),
                    solution.quality.gga_indicator(),
                    solution.satellites,
                    hdop,
                    age,
                )
            },
            SolutionFormat::Json => match serde_json::to_string(solution) {
                Ok(mut line) => {
                    line.push('\n');
                    line
                },
                Err(e) => {
                    error!("{} - solution serialization: {}", solution.epoch, e);
                    return None;
                },
            },
        };

        Some(formatted)
    }
}
