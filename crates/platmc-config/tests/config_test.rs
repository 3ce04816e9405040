#![allow(clippy::unwrap_used)]

use std::time::Duration;

use pretty_assertions::assert_eq;

use platmc_config::{Config, ConfigError, DemoEndpoint, DemoNumeric, load_config_from, save_config_to};

#[test]
fn missing_file_yields_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = load_config_from(&dir.path().join("nope.toml")).unwrap();
    assert_eq!(cfg, Config::default());
}

#[test]
fn file_values_override_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(
        &path,
        r#"
[manager]
poll_interval = "2s 500ms"
failure_threshold = 5
fault_cooldown = "1m"

[manager.retry]
first = "50ms"

[oem]
profile = "ibm"

[[demo.endpoints]]
address = "0:8"
tid = 3
numeric_sensors = [{ id = 1, entity_type = 64, raw = 41 }]
"#,
    )
    .unwrap();

    let cfg = load_config_from(&path).unwrap();
    assert_eq!(cfg.manager.poll_interval, Duration::from_millis(2500));
    assert_eq!(cfg.manager.failure_threshold, 5);
    assert_eq!(cfg.manager.fault_cooldown, Some(Duration::from_secs(60)));
    assert_eq!(cfg.manager.retry.first, Duration::from_millis(50));
    assert_eq!(cfg.manager.retry.max, Duration::from_secs(2));
    assert_eq!(cfg.oem.profile, "ibm");
    assert_eq!(cfg.demo.endpoints.len(), 1);
    assert_eq!(
        cfg.demo.endpoints[0].numeric_sensors,
        vec![DemoNumeric {
            id: 1,
            entity_type: 64,
            entity_instance: 0,
            raw: 41
        }]
    );

    let manager = cfg.to_manager_config().unwrap();
    assert_eq!(manager.failure_threshold, 5);
    assert_eq!(manager.fault_cooldown, Some(Duration::from_secs(60)));
}

#[test]
fn malformed_duration_is_a_load_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "[manager]\npoll_interval = \"soon\"\n").unwrap();

    let err = load_config_from(&path).unwrap_err();
    assert!(matches!(err, ConfigError::Figment(_)), "{err}");
}

#[test]
fn saved_config_loads_back() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("config.toml");

    let mut cfg = Config::default();
    cfg.manager.request_timeout = Duration::from_millis(750);
    cfg.demo.endpoints.push(DemoEndpoint {
        address: "1:12".into(),
        tid: 0,
        latency: Some(Duration::from_millis(20)),
        numeric_sensors: Vec::new(),
        state_sensors: Vec::new(),
    });
    save_config_to(&cfg, &path).unwrap();

    assert_eq!(load_config_from(&path).unwrap(), cfg);
}

#[test]
fn bad_demo_address_is_a_validation_error() {
    let ep = DemoEndpoint {
        address: "bus-one".into(),
        tid: 0,
        latency: None,
        numeric_sensors: Vec::new(),
        state_sensors: Vec::new(),
    };
    let err = ep.endpoint().unwrap_err();
    assert!(matches!(err, ConfigError::Validation { .. }));
}
