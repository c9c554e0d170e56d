use anyhow::Result;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use picam_relay::capture::synthetic::h264_chunk;
use picam_relay::rtsp::{
    PublisherConfig, PublisherState, RtspPublisher, Sink, SinkCommand, SinkLauncher,
};
use picam_relay::{Camera, ProcessLauncher, ShutdownReason, SinkError, StreamConfig, Supervisor, SyntheticFaults};

fn test_config() -> PublisherConfig {
    PublisherConfig {
        stream: StreamConfig {
            width: 320,
            height: 240,
            frame_rate: 50.0,
            quality: 0,
            bitrate: 800_000,
        },
        url: "rtsp://media.local:8554/cam".to_string(),
        muxer: "ffmpeg".to_string(),
        terminate_timeout: Duration::from_secs(5),
    }
}

fn expected_stream(chunks: u64, stream: &StreamConfig) -> Vec<u8> {
    (0..chunks)
        .flat_map(|seq| h264_chunk(seq, stream.width, stream.height))
        .collect()
}

struct MockSink {
    camera: Camera,
    received: Mutex<Vec<u8>>,
    closed: AtomicBool,
    events: Mutex<Vec<String>>,
}

impl MockSink {
    fn new(camera: Camera) -> Self {
        Self {
            camera,
            received: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            events: Mutex::new(Vec::new()),
        }
    }

    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl Sink for MockSink {
    fn write(&self, bytes: &[u8]) -> Result<(), SinkError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SinkError::InputClosed);
        }
        self.received.lock().unwrap().extend_from_slice(bytes);
        Ok(())
    }

    fn close_input(&self) -> bool {
        let first = !self.closed.swap(true, Ordering::SeqCst);
        if first {
            self.events.lock().unwrap().push("close_input".to_string());
        }
        first
    }

    fn terminate(&self, _timeout: Duration) -> Result<bool> {
        self.events.lock().unwrap().push(format!(
            "terminate camera_stopped={}",
            self.camera.is_stopped()
        ));
        Ok(false)
    }

    fn try_exit(&self) -> Option<String> {
        None
    }
}

struct MockLauncher {
    sink: Arc<MockSink>,
    commands: Arc<Mutex<Vec<SinkCommand>>>,
}

impl SinkLauncher for MockLauncher {
    fn launch(&self, command: &SinkCommand) -> Result<Arc<dyn Sink>> {
        self.commands.lock().unwrap().push(command.clone());
        Ok(self.sink.clone())
    }
}

fn mock_publisher(name: &str) -> (RtspPublisher, Camera, Arc<MockSink>, Arc<Mutex<Vec<SinkCommand>>>) {
    let camera = Camera::synthetic(name, SyntheticFaults::default());
    let sink = Arc::new(MockSink::new(camera.clone()));
    let commands = Arc::new(Mutex::new(Vec::new()));
    let launcher = MockLauncher {
        sink: sink.clone(),
        commands: commands.clone(),
    };
    let publisher = RtspPublisher::new(test_config(), camera.clone(), Box::new(launcher));
    (publisher, camera, sink, commands)
}

/// Value following `flag` in `args`.
fn flag_value<'a>(args: &'a [String], flag: &str) -> Vec<&'a str> {
    args.windows(2)
        .filter(|pair| pair[0] == flag)
        .map(|pair| pair[1].as_str())
        .collect()
}

fn assert_muxer_args(args: &[String], url: &str) {
    assert_eq!(flag_value(args, "-f"), vec!["h264", "rtsp"]);
    assert_eq!(flag_value(args, "-framerate"), vec!["50"]);
    assert_eq!(flag_value(args, "-i"), vec!["-"]);
    assert_eq!(flag_value(args, "-c:v"), vec!["copy"]);
    assert_eq!(flag_value(args, "-rtsp_transport"), vec!["tcp"]);
    assert_eq!(args.last().map(String::as_str), Some(url));
    // Input options must precede `-i`, output options follow it.
    let input = args.iter().position(|a| a == "-i").unwrap();
    let output_format = args.iter().rposition(|a| a == "-f").unwrap();
    assert!(args.iter().position(|a| a == "-framerate").unwrap() < input);
    assert!(output_format > input);
}

#[cfg(unix)]
fn write_script(dir: &Path, name: &str, body: &str) -> Result<PathBuf> {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body))?;
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
    Ok(path)
}

#[test]
fn muxer_is_launched_with_h264_to_rtsp_arguments() -> Result<()> {
    let (publisher, _camera, _sink, commands) = mock_publisher("stub://argv");
    publisher.publish()?;

    let commands = commands.lock().unwrap().clone();
    assert_eq!(commands.len(), 1);
    assert_eq!(commands[0].program, "ffmpeg");
    assert_muxer_args(&commands[0].args, "rtsp://media.local:8554/cam");

    publisher.shutdown();
    Ok(())
}

#[test]
fn sink_receives_exactly_the_encoded_stream() -> Result<()> {
    let (publisher, camera, sink, _) = mock_publisher("stub://roundtrip");
    publisher.publish()?;
    assert_eq!(publisher.state(), PublisherState::Publishing);
    std::thread::sleep(Duration::from_millis(300));

    let report = publisher.shutdown();
    let encoder = report.encoder.expect("encoder report");
    assert!(encoder.chunks_written > 0);

    let received = sink.received.lock().unwrap().clone();
    assert_eq!(received.len() as u64, encoder.bytes_written);
    assert_eq!(
        received,
        expected_stream(encoder.chunks_written, &test_config().stream)
    );
    assert_eq!(&received[..5], &[0x00, 0x00, 0x00, 0x01, 0x67]);
    assert!(camera.is_stopped());
    Ok(())
}

#[test]
fn shutdown_runs_once_in_order() -> Result<()> {
    let (publisher, camera, sink, _) = mock_publisher("stub://once");
    publisher.publish()?;
    std::thread::sleep(Duration::from_millis(50));

    let publisher = Arc::new(publisher);
    let threads: Vec<_> = (0..2)
        .map(|_| {
            let publisher = publisher.clone();
            std::thread::spawn(move || publisher.shutdown())
        })
        .collect();
    let reports: Vec<_> = threads
        .into_iter()
        .map(|thread| thread.join().unwrap())
        .collect();

    assert_eq!(reports[0], reports[1]);
    let report = &reports[0];
    assert!(report.input_closed);
    assert!(!report.forced_kill);
    assert!(report.encoder.is_some());
    assert!(report.camera_stopped);
    assert!(camera.is_stopped());
    assert_eq!(publisher.state(), PublisherState::Stopped);

    // Input closed, then terminate while the camera was still running.
    assert_eq!(
        sink.events(),
        vec![
            "close_input".to_string(),
            "terminate camera_stopped=false".to_string()
        ]
    );

    assert_eq!(publisher.shutdown(), *report);
    assert_eq!(sink.events().len(), 2);
    Ok(())
}

#[test]
fn missing_muxer_fails_startup_and_releases_camera() {
    let camera = Camera::synthetic("stub://nomuxer", SyntheticFaults::default());
    let mut config = test_config();
    config.muxer = "/nonexistent/picam-relay/ffmpeg".to_string();
    let publisher = RtspPublisher::new(config, camera.clone(), Box::new(ProcessLauncher));

    assert!(publisher.publish().is_err());
    assert_eq!(publisher.state(), PublisherState::Stopped);
    assert!(camera.is_stopped());
}

#[cfg(unix)]
#[test]
fn shell_muxer_parses_arguments_and_receives_stream() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let args_path = dir.path().join("args.txt");
    let out_path = dir.path().join("stream.h264");
    let script = write_script(
        dir.path(),
        "mock_ffmpeg",
        &format!(
            "printf '%s\\n' \"$@\" > '{}'\ncat > '{}'",
            args_path.display(),
            out_path.display()
        ),
    )?;

    let camera = Camera::synthetic("stub://shell", SyntheticFaults::default());
    let mut config = test_config();
    config.muxer = script.display().to_string();
    let stream = config.stream;
    let publisher = RtspPublisher::new(config, camera, Box::new(ProcessLauncher));
    publisher.publish()?;
    std::thread::sleep(Duration::from_millis(300));
    let report = publisher.shutdown();

    assert!(report.input_closed);
    assert!(!report.forced_kill, "cat exits on EOF");
    assert!(report.sink_exit.is_some());

    let args: Vec<String> = std::fs::read_to_string(&args_path)?
        .lines()
        .map(str::to_string)
        .collect();
    assert_muxer_args(&args, "rtsp://media.local:8554/cam");

    let encoder = report.encoder.expect("encoder report");
    let received = std::fs::read(&out_path)?;
    assert_eq!(received.len() as u64, encoder.bytes_written);
    assert_eq!(received, expected_stream(encoder.chunks_written, &stream));
    Ok(())
}

#[cfg(unix)]
#[test]
fn muxer_ignoring_sigterm_is_killed() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let script = write_script(
        dir.path(),
        "stubborn_ffmpeg",
        "trap '' TERM\ncat > /dev/null\nexec sleep 30",
    )?;

    let camera = Camera::synthetic("stub://stubborn", SyntheticFaults::default());
    let mut config = test_config();
    config.muxer = script.display().to_string();
    config.terminate_timeout = Duration::from_millis(300);
    let publisher = RtspPublisher::new(config, camera.clone(), Box::new(ProcessLauncher));
    publisher.publish()?;
    std::thread::sleep(Duration::from_millis(100));

    let started = std::time::Instant::now();
    let report = publisher.shutdown();
    assert!(report.forced_kill);
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(camera.is_stopped());
    Ok(())
}

#[cfg(unix)]
#[test]
fn muxer_death_triggers_shutdown() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let script = write_script(dir.path(), "short_ffmpeg", "head -c 2000 > /dev/null")?;

    let camera = Camera::synthetic("stub://dies", SyntheticFaults::default());
    let mut config = test_config();
    config.muxer = script.display().to_string();
    let publisher = RtspPublisher::new(config, camera.clone(), Box::new(ProcessLauncher));
    publisher.publish()?;

    let supervisor = Supervisor::new();
    let sink = publisher.sink().expect("sink running");
    supervisor.watch_sink_every(sink, Duration::from_millis(50))?;
    let reason = supervisor
        .wait_timeout(Duration::from_secs(5))
        .expect("watchdog fired");
    assert!(matches!(reason, ShutdownReason::SinkExited(_)));
    assert_eq!(reason.exit_code(), 1);

    let report = publisher.shutdown();
    assert!(!report.forced_kill);
    assert!(report.sink_exit.is_some());
    assert!(report.encoder.is_some());
    assert!(camera.is_stopped());
    Ok(())
}
