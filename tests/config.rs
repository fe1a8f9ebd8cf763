use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::Builder;

use multicam_ingest::config::ManagerConfig;
use multicam_ingest::{BufferCapacity, CaptureMethod, CropRect};

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "MULTICAM_CONFIG",
        "MULTICAM_SOURCES",
        "MULTICAM_METHOD",
        "MULTICAM_QUEUE_SIZE",
        "MULTICAM_RECORDING_DIR",
        "MULTICAM_RECONNECT_SECS",
        "MULTICAM_DO_RECONNECT",
        "MULTICAM_MAX_HEIGHT",
        "MULTICAM_RTSP_TCP",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn defaults_without_config_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = ManagerConfig::load().expect("load config");
    assert_eq!(cfg.sources, PathBuf::from("sources.txt"));
    assert_eq!(cfg.method, CaptureMethod::Continuous);
    assert_eq!(cfg.queue_size, None);
    assert!(cfg.reconnect.enabled);
    assert_eq!(cfg.reconnect.threshold, Duration::from_secs(20));
    assert!(cfg.rtsp_tcp);

    let options = cfg.to_options();
    assert_eq!(options.buffer_capacity, None);
    assert_eq!(options.producer_pause_threshold, 10);
}

#[test]
fn loads_toml_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = Builder::new().suffix(".toml").tempfile().expect("temp config");
    let toml = r#"
        sources = "/etc/multicam/sources.txt"
        method = "snapshot"
        queue_size = 5
        recording_dir = "/var/lib/multicam"
        crop = [10, 20, 110, 220]

        [reconnect]
        enabled = true
        threshold_secs = 30

        [rtsp]
        tcp = false
    "#;
    std::io::Write::write_all(&mut file, toml.as_bytes()).expect("write config");

    std::env::set_var("MULTICAM_CONFIG", file.path());
    std::env::set_var("MULTICAM_QUEUE_SIZE", "unbounded");
    std::env::set_var("MULTICAM_DO_RECONNECT", "0");
    std::env::set_var("MULTICAM_MAX_HEIGHT", "480");

    let cfg = ManagerConfig::load().expect("load config");
    assert_eq!(cfg.sources, PathBuf::from("/etc/multicam/sources.txt"));
    assert_eq!(cfg.method, CaptureMethod::Snapshot);
    assert_eq!(cfg.queue_size, Some(BufferCapacity::Unbounded));
    assert_eq!(cfg.recording_dir, Some(PathBuf::from("/var/lib/multicam")));
    assert_eq!(cfg.frame_crop, Some(CropRect::new(10, 20, 110, 220).unwrap()));
    assert!(!cfg.reconnect.enabled);
    assert_eq!(cfg.reconnect.threshold, Duration::from_secs(30));
    assert!(!cfg.rtsp_tcp);
    assert_eq!(cfg.max_height, Some(480));

    let options = cfg.to_options();
    assert_eq!(options.method, CaptureMethod::Snapshot);
    assert!(!options.do_reconnect);
    assert_eq!(options.max_height, Some(480));

    clear_env();
}

#[test]
fn loads_json_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = Builder::new().suffix(".json").tempfile().expect("temp config");
    let json = r#"{ "method": "continuous", "queue_size": "unbounded", "reconnect": { "threshold_secs": 5 } }"#;
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");

    let cfg = ManagerConfig::from_path(file.path()).expect("load config");
    assert_eq!(cfg.queue_size, Some(BufferCapacity::Unbounded));
    assert_eq!(cfg.reconnect.threshold, Duration::from_secs(5));
}

#[test]
fn rejects_invalid_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();

    for (key, value) in [
        ("MULTICAM_RECONNECT_SECS", "0"),
        ("MULTICAM_RECONNECT_SECS", "soon"),
        ("MULTICAM_QUEUE_SIZE", "0"),
        ("MULTICAM_QUEUE_SIZE", "lots"),
        ("MULTICAM_METHOD", "vlc"),
        ("MULTICAM_DO_RECONNECT", "maybe"),
    ] {
        clear_env();
        std::env::set_var(key, value);
        assert!(
            ManagerConfig::load().is_err(),
            "{}={} should be rejected",
            key,
            value
        );
    }
    clear_env();
}
