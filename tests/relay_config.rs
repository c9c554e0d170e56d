use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use picam_relay::config::RelayConfig;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "PICAM_CONFIG",
        "PICAM_DEVICE",
        "PICAM_BIND",
        "PICAM_RTSP_URL",
        "PICAM_FFMPEG",
        "PICAM_WARMUP_MS",
    ] {
        std::env::remove_var(key);
    }
}

fn write_config(toml: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("temp config");
    std::io::Write::write_all(&mut file, toml.as_bytes()).expect("write config");
    file
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(
        r#"
        device = "/dev/video0"

        [mjpeg]
        bind = "0.0.0.0:9000"
        width = 1280
        height = 720
        fps = 30.0
        quality = 85
        warmup_ms = 500

        [rtsp]
        url = "rtsp://media:8554/front"
        width = 1920
        height = 1080
        fps = 30.0
        bitrate = 6000000
        terminate_timeout_ms = 2000
        "#,
    );

    std::env::set_var("PICAM_CONFIG", file.path());
    std::env::set_var("PICAM_BIND", "127.0.0.1:8080");
    std::env::set_var("PICAM_FFMPEG", "/usr/local/bin/ffmpeg");

    let cfg = RelayConfig::load(None).expect("load config");
    assert_eq!(cfg.device, "/dev/video0");
    assert_eq!(cfg.mjpeg.bind, "127.0.0.1:8080");
    assert_eq!(cfg.mjpeg.stream.width, 1280);
    assert_eq!(cfg.mjpeg.stream.quality, 85);
    assert_eq!(cfg.mjpeg.warmup, Duration::from_millis(500));
    assert_eq!(cfg.rtsp.url, "rtsp://media:8554/front");
    assert_eq!(cfg.rtsp.muxer, "/usr/local/bin/ffmpeg");
    assert_eq!(cfg.rtsp.stream.bitrate, 6_000_000);
    assert_eq!(cfg.rtsp.terminate_timeout, Duration::from_secs(2));

    let publisher = cfg.publisher_config();
    assert_eq!(publisher.sink_command().program, "/usr/local/bin/ffmpeg");
    assert_eq!(cfg.mjpeg_config().addr, "127.0.0.1:8080");

    clear_env();
}

#[test]
fn explicit_path_wins_over_env() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let from_env = write_config("device = \"stub://from-env\"\n");
    let explicit = write_config("device = \"stub://explicit\"\n");
    std::env::set_var("PICAM_CONFIG", from_env.path());

    let cfg = RelayConfig::load(Some(explicit.path())).expect("load config");
    assert_eq!(cfg.device, "stub://explicit");

    clear_env();
}

#[test]
fn defaults_without_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = RelayConfig::load(None).expect("load defaults");
    assert_eq!(cfg.device, "stub://camera");
    assert_eq!(cfg.mjpeg.bind, "0.0.0.0:8000");
    assert_eq!(cfg.rtsp.url, "rtsp://localhost:8554/cam");
    assert_eq!(cfg.mjpeg.warmup, Duration::from_secs(2));
}

#[test]
fn rejects_out_of_envelope_streams() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config("[rtsp]\nwidth = 3840\nheight = 2160\n");
    let cfg = RelayConfig::load(Some(file.path())).expect("parse config");
    let err = cfg.validate_rtsp().unwrap_err();
    assert!(format!("{:#}", err).contains("rtsp"));
    cfg.validate_mjpeg().expect("mjpeg section untouched");

    let file = write_config("[mjpeg]\nquality = 0\n");
    let cfg = RelayConfig::load(Some(file.path())).expect("parse config");
    assert!(cfg.validate_mjpeg().is_err());

    let file = write_config("[mjpeg]\nwidth = 641\n");
    let cfg = RelayConfig::load(Some(file.path())).expect("parse config");
    assert!(cfg.validate().is_err());
}

#[test]
fn bad_file_value_can_be_overridden_before_validation() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config("[mjpeg]\nquality = 0\n");
    std::env::set_var("PICAM_RTSP_URL", "http://not-rtsp/cam");
    let mut cfg = RelayConfig::load(Some(file.path())).expect("parse config");
    assert!(cfg.validate_rtsp().is_err());

    // What a --quality flag does in mjpeg_server.
    cfg.mjpeg.stream.quality = 80;
    cfg.validate_mjpeg().expect("mjpeg ignores the rtsp section");

    clear_env();
}

#[test]
fn rejects_bad_env_and_unknown_keys() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("PICAM_WARMUP_MS", "soon");
    assert!(RelayConfig::load(None).is_err());
    clear_env();

    let file = write_config("[mjpeg]\nresolution = \"hd\"\n");
    assert!(RelayConfig::load(Some(file.path())).is_err());
}
