use clap::{Arg, ArgAction, ArgMatches, ColorChoice, Command};

use std::time::Duration;

use rtksvr::prelude::Settings;

/// Default status report period
const DEFAULT_STATUS_PERIOD_S: u64 = 10;

pub struct Cli {
    /// Arguments passed by user
    matches: ArgMatches,
}

impl Cli {
    /// Build new command line interface
    pub fn new() -> Self {
        Self {
            matches: {
                Command::new("rtksvr")
                    .author("Guillaume W. Bres, <guillaume.bressaix@gmail.com>")
                    .version(env!("CARGO_PKG_VERSION"))
                    .about("Real-time multi-stream GNSS processing server")
                    .color(ColorChoice::Always)
                    .arg_required_else_help(true)
                    .next_help_heading("Configuration")
                    .arg(
                        Arg::new("config")
                            .short('c')
                            .long("config")
                            .value_name("FILE")
                            .action(ArgAction::Set)
                            .required_unless_present("dump-default")
                            .help("Load server settings (JSON). Missing fields take default values."),
                    )
                    .arg(
                        Arg::new("dump-default")
                            .long("dump-default")
                            .action(ArgAction::SetTrue)
                            .help("Print the default settings (JSON) and exit.
Use this as a starting point for your own configuration."),
                    )
                    .arg(
                        Arg::new("cycle")
                            .long("cycle")
                            .value_name("MS")
                            .value_parser(clap::value_parser!(u64))
                            .help("Overrides the processing cycle period (ms)"),
                    )
                    .next_help_heading("Monitoring")
                    .arg(
                        Arg::new("status-period")
                            .long("status-period")
                            .value_name("S")
                            .value_parser(clap::value_parser!(u64))
                            .help("Status report period (s). Default is 10s. 0 disables the report."),
                    )
                    .get_matches()
            },
        }
    }

    /// True when default settings should be printed
    pub fn dump_default(&self) -> bool {
        self.matches.get_flag("dump-default")
    }

    /// Settings file path
    pub fn config_file(&self) -> Option<&String> {
        self.matches.get_one::<String>("config")
    }

    /// Status report period, None when disabled
    pub fn status_period(&self) -> Option<Duration> {
        let period_s = self
            .matches
            .get_one::<u64>("status-period")
            .copied()
            .unwrap_or(DEFAULT_STATUS_PERIOD_S);

        if period_s == 0 {
            None
        } else {
            Some(Duration::from_secs(period_s))
        }
    }

    /// Applies command line overrides to these [Settings]
    pub fn apply_overrides(&self, settings: &mut Settings) {
        if let Some(cycle_ms) = self.matches.get_one::<u64>("cycle") {
            settings.cycle_ms = *cycle_ms;
        }
    }
}
