#![doc(
    html_logo_url = "https://raw.githubusercontent.com/nav-solutions/.github/master/logos/logo2.jpg"
)]
#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_cfg))]

/*
 * RTKSVR is part of the nav-solutions framework.
 * Authors: Guillaume W. Bres <guillaume.bressaix@gmail.com> et al,
 * (cf. https://github.com/nav-solutions/rtksvr/graphs/contributors)
 * This framework is shipped under Mozilla Public V2 license.
 *
 * Documentation: https://github.com/nav-solutions/rtksvr
 */

use env_logger::{Builder, Target};

use log::{error, info, warn};

use tokio::{
    signal,
    sync::watch,
    time::{Interval, MissedTickBehavior},
};

use itertools::Itertools;

use rtksvr::prelude::{ReceiverRole, RtkServer, ServerState, Settings};

mod cli;

use cli::Cli;

/// Waits for the next status report, forever when reports are disabled
async fn next_report(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        },
        None => std::future::pending::<()>().await,
    }
}

/// Logs a status report
fn report(server: &RtkServer) {
    let streams = server.stream_status();
    let control = server.control_result();

    info!(
        "{} - streams [{}] - epochs: {} - frames: {} ({} corrupt) - failures: {}",
        server.status(),
        streams.summary(),
        control.processed_epochs,
        control.decoded_frames,
        control.corrupt_frames,
        control.cycle_failures,
    );

    if let Some(solution) = control.solution {
        let (lat, lon, h) = solution.geodetic();
        info!(
            "{} - {} ({} SV{}) lat={:.8}° lon={:.8}° h={:.3}m age={:.1}s",
            solution.epoch,
            solution.quality,
            solution.satellites,
            if solution.degraded { ", degraded" } else { "" },
            lat,
            lon,
            h,
            solution.age_s,
        );
    }

    let rover = server.observation_status(ReceiverRole::Rover);
    if !rover.satellites.is_empty() {
        info!(
            "rover - {}",
            rover
                .satellites
                .iter()
                .map(|sat| format!("{}{}", sat.sv, if sat.valid { "" } else { "*" }))
                .join(" ")
        );
    }

    if !streams.message.is_empty() {
        warn!("{}", streams.message);
    }
}

#[tokio::main]
pub async fn main() {
    let mut builder = Builder::from_default_env();

    builder
        .target(Target::Stdout)
        .format_timestamp_secs()
        .format_module_path(false)
        .init();

    // cli
    let cli = Cli::new();

    if cli.dump_default() {
        match Settings::default().to_json() {
            Ok(json) => println!("{}", json),
            Err(e) => error!("failed to serialize default settings: {}", e),
        }
        return;
    }

    let Some(config) = cli.config_file() else {
        error!("invalid command line: settings file required");
        std::process::exit(1);
    };

    let mut settings = match Settings::from_file(config) {
        Ok(settings) => settings,
        Err(e) => {
            error!("failed to load {}: {}", config, e);
            std::process::exit(1);
        },
    };

    cli.apply_overrides(&mut settings);

    let mut server = match RtkServer::new(settings) {
        Ok(server) => server,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        },
    };

    if let Err(e) = server.start() {
        error!("{}", e);
        std::process::exit(1);
    }

    // shutdown channel
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        if let Err(e) = signal::ctrl_c().await {
            error!("signal handling error: {}", e);
        }

        if shutdown_tx.send(true).is_err() {
            error!("shutdown signaling error");
        }
    });

    let mut interval = cli.status_period().map(|period| {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        interval
    });

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                info!("shutting down..");
                break;
            },
            _ = next_report(&mut interval) => {
                report(&server);

                if server.status() == ServerState::Error {
                    break;
                }
            },
        }
    }

    server.stop();
    info!("{}", server.status());
}
