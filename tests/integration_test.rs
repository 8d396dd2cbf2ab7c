use cadence::config::ProberConfig;
use cadence::error::{CadenceError, Code};
use cadence::probes::ProbeType;
use std::io::Write;

const CONFIG: &str = r#"
probe:
  - name: redis
    type: tcp
    port: 6379
    interval_msec: 5000
    timeout_msec: 500
    targets:
      shared_targets: redis
    labels:
      team: storage
  - name: canary
    type: user_defined
    run_on: "^canary-"
shared_targets:
  - name: redis
    targets:
      host_names: redis-1,redis-2
surfacer:
  - type: file
    file_path: /tmp/cadence-events.log
    queue_size: 100
server:
  - type: udp
    port: 31337
control_plane:
  address: 127.0.0.1:9313
"#;

#[test]
fn test_error_types() {
    let err = CadenceError::init("udp server", "address in use");
    assert!(err.to_string().contains("udp server"));
    assert!(err.to_string().contains("address in use"));
    assert_eq!(err.code(), Code::Internal);

    let err = CadenceError::NotFound("probe redis".to_string());
    assert_eq!(err.to_string(), "probe redis not found");
    assert_eq!(err.code().as_str(), "NOT_FOUND");
}

#[test]
fn test_version_const() {
    assert!(!cadence::VERSION.is_empty());
}

#[test]
fn test_load_config_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(CONFIG.as_bytes()).unwrap();

    let config = ProberConfig::load(file.path()).unwrap();
    assert_eq!(config.probe.len(), 2);
    assert_eq!(config.probe[0].probe_type, ProbeType::Tcp);
    assert_eq!(config.probe[0].labels["team"], "storage");
    assert_eq!(config.server[0].port, 31337);
    assert_eq!(config.control_plane.as_ref().unwrap().address, "127.0.0.1:9313");
    assert!(!config.disable_jitter);

    let reparsed = ProberConfig::from_yaml_str(&config.to_text().unwrap()).unwrap();
    assert_eq!(reparsed, config);
}

#[test]
fn test_load_missing_file() {
    let err = ProberConfig::load("/nonexistent/cadence.yaml").unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
}

#[test]
fn test_timeout_longer_than_interval_rejected() {
    let text = r#"
probe:
  - name: slow
    type: tcp
    interval_msec: 1000
    timeout_msec: 2000
"#;
    let err = ProberConfig::from_yaml_str(text).unwrap_err();
    assert!(err.to_string().contains("timeout_msec"));
}
