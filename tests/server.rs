mod common;

use std::time::Duration;

use rtksvr::{
    prelude::*,
    utils::{gpst_epoch, gpst_week_tow},
};

use common::{WEEK, TOE_S, rover_position, rover_stream, temp_path, wait_for};

const TIMEOUT: Duration = Duration::from_secs(10);

/// Settings with a rover file input and a solution file output
fn file_settings(rover: &str, output: &str, mode: PositioningMode) -> Settings {
    let mut settings = Settings::default();

    let input = settings.stream_mut(StreamRole::RoverIn);
    input.stream_type = StreamType::File;
    input.format = StreamFormat::Ubx;
    input.path = rover.to_string();

    let out = settings.stream_mut(StreamRole::SolutionOut1);
    out.stream_type = StreamType::File;
    out.path = output.to_string();

    settings.solution_outputs[0] = SolutionOutputOptions {
        format: SolutionFormat::Llh,
        time: TimeFormat::GpsWeekTow,
        header: true,
    };

    settings.processing.mode = mode;
    settings.processing.troposphere = false;
    settings.cycle_ms = 10;
    settings
}

#[test]
fn single_point_positioning() {
    let rover = temp_path("spp-rover.ubx");
    let output = temp_path("spp-solutions.txt");
    std::fs::write(&rover, rover_stream(5)).unwrap();

    let mut server =
        RtkServer::new(file_settings(&rover, &output, PositioningMode::Single)).unwrap();

    server.start().unwrap();
    assert_eq!(server.status(), ServerState::Waiting);

    assert!(wait_for(TIMEOUT, || server.control_result().processed_epochs == 5));

    // lazy promotion
    let streams = server.stream_status();
    assert_eq!(server.status(), ServerState::Active);
    assert_eq!(
        streams.get(StreamRole::RoverIn).map(|s| s.state),
        Some(StreamState::Active)
    );
    assert_eq!(
        streams.get(StreamRole::SolutionOut1).map(|s| s.state),
        Some(StreamState::Active)
    );

    let last = server.last_solution().unwrap();
    assert_eq!(last.quality, Quality::Single);
    assert!(!last.degraded);
    assert!((last.position() - rover_position()).norm() < 1.0);
    let (week, tow_s) = gpst_week_tow(last.epoch);
    assert_eq!(week, WEEK);
    assert!((tow_s - TOE_S - 64.0).abs() < 1.0E-6);

    let since = server
        .solutions_since(gpst_epoch(WEEK, TOE_S + 61.0))
        .collect::<Vec<_>>();
    assert_eq!(since.len(), 3);

    let rover_status = server.observation_status(ReceiverRole::Rover);
    assert_eq!(rover_status.epoch, Some(last.epoch));
    assert_eq!(rover_status.satellites.len(), last.satellites);
    assert!(rover_status.satellites.iter().all(|sat| sat.valid));

    let control = server.control_result();
    assert_eq!(control.corrupt_frames, 0);
    assert_eq!(control.decoded_frames, 32 * 3 + 5);
    assert_eq!(control.solution, Some(last));

    server.stop();
    assert_eq!(server.status(), ServerState::Closed);

    // idempotent
    server.stop();
    assert_eq!(server.status(), ServerState::Closed);

    let content = std::fs::read_to_string(&output).unwrap();
    let lines = content.lines().collect::<Vec<_>>();
    assert_eq!(lines.len(), 6);
    assert!(lines[0].starts_with('%'));

    let fields = lines[5].split_whitespace().collect::<Vec<_>>();
    let latitude = fields[2].parse::<f64>().unwrap();
    let longitude = fields[3].parse::<f64>().unwrap();
    assert!((latitude - 45.0).abs() < 1.0E-4);
    assert!((longitude - 5.0).abs() < 1.0E-4);

    let _ = std::fs::remove_file(&rover);
    let _ = std::fs::remove_file(&output);
}

#[test]
fn snapshots_reset_on_stop() {
    let rover = temp_path("reset-rover.ubx");
    let output = temp_path("reset-solutions.txt");
    std::fs::write(&rover, rover_stream(3)).unwrap();

    let mut server =
        RtkServer::new(file_settings(&rover, &output, PositioningMode::Single)).unwrap();

    server.start().unwrap();
    assert!(wait_for(TIMEOUT, || server.control_result().processed_epochs == 3));
    assert!(!server.observation_status(ReceiverRole::Rover).satellites.is_empty());

    server.stop();

    assert_eq!(server.control_result(), ControlResult::default());

    let rover_status = server.observation_status(ReceiverRole::Rover);
    assert!(rover_status.epoch.is_none());
    assert!(rover_status.satellites.is_empty());

    let streams = server.stream_status();
    assert!(streams.streams.iter().all(|s| s.state == StreamState::Closed));
    assert_eq!(server.status(), ServerState::Closed);

    // solutions of the last run remain available
    assert!(server.last_solution().is_some_and(|s| s.is_fix()));

    let _ = std::fs::remove_file(&rover);
    let _ = std::fs::remove_file(&output);
}

#[test]
fn unreachable_base_degrades() {
    let rover = temp_path("dgps-rover.ubx");
    let output = temp_path("dgps-solutions.txt");
    std::fs::write(&rover, rover_stream(3)).unwrap();

    let mut settings = file_settings(&rover, &output, PositioningMode::Dgps);

    let base = settings.stream_mut(StreamRole::BaseIn);
    base.stream_type = StreamType::TcpClient;
    base.path = "127.0.0.1:1".to_string();

    let mut server = RtkServer::new(settings).unwrap();

    // base failure does not prevent start
    server.start().unwrap();

    assert!(wait_for(TIMEOUT, || server.control_result().processed_epochs == 3));

    let streams = server.stream_status();
    assert_eq!(
        streams.get(StreamRole::BaseIn).map(|s| s.state),
        Some(StreamState::Error)
    );

    let solutions = server
        .solutions_since(gpst_epoch(WEEK, 0.0))
        .collect::<Vec<_>>();

    assert_eq!(solutions.len(), 3);
    for solution in solutions {
        assert_eq!(solution.quality, Quality::Single);
        assert!(solution.degraded);
    }

    server.stop();
    let _ = std::fs::remove_file(&rover);
    let _ = std::fs::remove_file(&output);
}

#[test]
fn malformed_bytes_are_skipped() {
    let rover = temp_path("garbage-rover.ubx");
    let output = temp_path("garbage-solutions.txt");

    let mut content = vec![0xb5, 0x62, 0x02, 0x15, 0x08, 0x00, 1, 2, 3, 4, 5, 6, 7, 8, 0, 0];
    content.extend_from_slice(&[0x42; 100]);
    content.extend_from_slice(&rover_stream(2));
    content.extend_from_slice(&[0xb5, 0x62, 0xff]);
    std::fs::write(&rover, content).unwrap();

    let mut server =
        RtkServer::new(file_settings(&rover, &output, PositioningMode::Single)).unwrap();
    server.start().unwrap();

    assert!(wait_for(TIMEOUT, || server.control_result().processed_epochs == 2));

    let control = server.control_result();
    assert!(control.corrupt_frames >= 1);
    assert_eq!(control.cycle_failures, 0);
    assert!(server.last_solution().is_some_and(|s| s.is_fix()));

    server.stop();
    let _ = std::fs::remove_file(&rover);
    let _ = std::fs::remove_file(&output);
}

#[test]
fn unreachable_rover() {
    let output = temp_path("missing-solutions.txt");
    let settings = file_settings(
        &temp_path("does-not-exist.ubx"),
        &output,
        PositioningMode::Single,
    );

    let mut server = RtkServer::new(settings).unwrap();

    assert!(matches!(server.start(), Err(ServerError::StartFailure(_))));
    assert_eq!(server.status(), ServerState::Error);
    assert!(server.last_solution().is_none());

    assert!(matches!(
        server.set_settings(Settings::default()),
        Err(ServerError::InvalidState(ServerState::Error))
    ));

    server.stop();
    assert_eq!(server.status(), ServerState::Closed);
}

#[test]
fn settings_round_trip() {
    let path = temp_path("settings.json");

    let mut settings = file_settings("rover.ubx", "solutions.txt", PositioningMode::Dgps);
    settings.stream_mut(StreamRole::RoverIn).commands =
        "!UBX CFG-RATE 1000;!UBX MON-VER".to_string();
    settings.processing.base_position =
        BasePosition::Fixed([4_000_000.0, 400_000.0, 4_900_000.0]);

    std::fs::write(&path, settings.to_json().unwrap()).unwrap();
    let parsed = Settings::from_file(&path).unwrap();
    assert_eq!(parsed, settings);

    let mut server = RtkServer::new(Settings {
        cycle_ms: 100,
        ..parsed.clone()
    })
    .unwrap();

    server.set_settings(parsed.clone()).unwrap();
    assert_eq!(server.settings(), parsed);

    let _ = std::fs::remove_file(&path);
}
