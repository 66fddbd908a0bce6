#![doc(
    html_logo_url = "https://raw.githubusercontent.com/nav-solutions/.github/master/logos/logo2.jpg"
)]
#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(clippy::type_complexity)]

/*
 * RTKSVR is part of the nav-solutions framework.
 * Authors: Guillaume W. Bres <guillaume.bressaix@gmail.com> et al,
 * (cf. https://github.com/nav-solutions/rtksvr/graphs/contributors)
 * This framework is shipped under Mozilla Public V2 license.
 *
 * Documentation: https://github.com/nav-solutions/rtksvr
 */

extern crate gnss_rs as gnss;

pub mod command;
pub mod constants;
pub mod coords;
pub mod decoder;
pub mod ephemeris;
pub mod nmea;
pub mod observation;
pub mod server;
pub mod settings;
pub mod solution;
pub mod solver;
pub mod status;
pub mod stream;
pub mod utils;

pub mod prelude {
    pub use crate::{
        decoder::{Decoder, DecoderStats, FrameState, Message},
        ephemeris::{Ephemeris, EphemerisStore},
        observation::{Carrier, Measurement, ObservationEpoch, ReceiverRole},
        server::{Error as ServerError, RtkServer},
        settings::{
            BasePosition, NavSelect, NmeaRequest, NmeaRequestKind, PositioningMode,
            ProcessingOptions, Settings, SolutionFormat, SolutionOutputOptions, StreamFormat,
            StreamSettings, StreamType, TimeFormat,
        },
        solution::{Quality, Solution, SolutionBuffer},
        status::{
            ControlResult, ObservationStatus, SatelliteStatus, ServerState, StreamState,
            StreamStatus, StreamsStatus,
        },
        stream::StreamRole,
    };

    // pub re-export
    pub use gnss::prelude::{Constellation, SV};
    pub use hifitime::prelude::{Duration, Epoch, TimeScale};
}
