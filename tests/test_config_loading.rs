//! Configuration loading and validation tests
//!
//! Tests focus on BEHAVIOR of configuration loading, validation, and building
//! a device from it. Secrets come from the environment, never the file.


use astarte_device::config::{ConfigError, DeviceConfig};
use astarte_device::device::DeviceBuilder;
use astarte_device::error::DeviceError;
use astarte_device::testing::mocks::{MockConnector, MockPairing};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use test_helpers::DEVICE_ID;

const SENSORS_JSON: &str = r#"{
    "interface_name": "org.example.Sensors",
    "version_major": 1,
    "version_minor": 2,
    "type": "datastream",
    "ownership": "device",
    "mappings": [{"endpoint": "/%{sensor_id}/temperature", "type": "double"}]
}"#;

const COMMANDS_JSON: &str = r#"{
    "interface_name": "org.example.Commands",
    "version_major": 0,
    "version_minor": 3,
    "type": "datastream",
    "ownership": "server",
    "mappings": [{"endpoint": "/%{target}/command", "type": "string"}]
}"#;

fn write_config(dir: &Path, secret_env: &str, extra: &str) -> std::path::PathBuf {
    let path = dir.join("device.toml");
    fs::write(
        &path,
        format!(
            r#"
[device]
id = "{DEVICE_ID}"
realm = "test"
credentials_secret_env = "{secret_env}"
pairing_url = "https://api.example.com/pairing"
persistency_dir = "state"

{extra}
"#
        ),
    )
    .unwrap();
    path
}

#[test]
fn test_config_resolves_relative_paths() {
    let temp = TempDir::new().unwrap();
    let path = write_config(
        temp.path(),
        "ASTARTE_TEST_SECRET_UNUSED",
        "[connection]\ntrust_anchors = \"ca.pem\"\n\n[interfaces]\ndirectory = \"interfaces\"\n",
    );

    let config = DeviceConfig::load_from_file(&path).unwrap();

    assert_eq!(config.device.persistency_dir, Some(temp.path().join("state")));
    assert_eq!(config.connection.trust_anchors, Some(temp.path().join("ca.pem")));
    assert_eq!(config.interfaces.directory, Some(temp.path().join("interfaces")));
}

#[test]
fn test_config_loads_interfaces_in_name_order() {
    let temp = TempDir::new().unwrap();
    let interfaces = temp.path().join("interfaces");
    fs::create_dir(&interfaces).unwrap();
    fs::write(interfaces.join("b_sensors.json"), SENSORS_JSON).unwrap();
    fs::write(interfaces.join("a_commands.json"), COMMANDS_JSON).unwrap();
    fs::write(interfaces.join("README.md"), "not an interface").unwrap();

    let path = write_config(
        temp.path(),
        "ASTARTE_TEST_SECRET_UNUSED",
        "[interfaces]\ndirectory = \"interfaces\"\n",
    );
    let config = DeviceConfig::load_from_file(&path).unwrap();

    let loaded = config.load_interfaces().unwrap();
    let names: Vec<&str> = loaded.iter().map(|i| i.name.as_str()).collect();
    assert_eq!(names, vec!["org.example.Commands", "org.example.Sensors"]);
}

#[test]
fn test_config_reports_broken_interface_file() {
    let temp = TempDir::new().unwrap();
    let interfaces = temp.path().join("interfaces");
    fs::create_dir(&interfaces).unwrap();
    fs::write(interfaces.join("broken.json"), "{ not json").unwrap();

    let path = write_config(
        temp.path(),
        "ASTARTE_TEST_SECRET_UNUSED",
        "[interfaces]\ndirectory = \"interfaces\"\n",
    );
    let config = DeviceConfig::load_from_file(&path).unwrap();

    match config.load_interfaces() {
        Err(ConfigError::Interface { path, .. }) => {
            assert_eq!(path, interfaces.join("broken.json"));
        }
        other => panic!("Expected interface error, got {other:?}"),
    }
}

#[test]
fn test_missing_config_file() {
    let result = DeviceConfig::load_from_file(Path::new("/nonexistent/device.toml"));
    assert!(matches!(result, Err(ConfigError::FileRead(_))));
}

#[test]
fn test_malformed_toml() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("device.toml");
    fs::write(&path, "[device\nid = ").unwrap();

    let result = DeviceConfig::load_from_file(&path);
    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_builder_from_config() {
    let temp = TempDir::new().unwrap();
    let interfaces = temp.path().join("interfaces");
    fs::create_dir(&interfaces).unwrap();
    fs::write(interfaces.join("sensors.json"), SENSORS_JSON).unwrap();
    fs::write(interfaces.join("commands.json"), COMMANDS_JSON).unwrap();

    let secret_env = "ASTARTE_TEST_SECRET_BUILDER";
    std::env::set_var(secret_env, "pairing-token");
    let path = write_config(
        temp.path(),
        secret_env,
        "[connection]\nauto_reconnect = true\ndisconnect_grace_ms = 250\n\n[interfaces]\ndirectory = \"interfaces\"\n",
    );
    let config = DeviceConfig::load_from_file(&path).unwrap();

    let device = DeviceBuilder::from_config(&config)
        .unwrap()
        .pairing(Arc::new(MockPairing::new()))
        .connector(Arc::new(MockConnector::new()))
        .build()
        .unwrap();

    assert_eq!(device.device_id(), DEVICE_ID);
    assert_eq!(device.realm(), "test");
    assert_eq!(device.persistency_dir(), temp.path().join("state"));
    assert!(temp.path().join("state").is_dir());
    assert!(device.auto_reconnect());
    assert_eq!(device.interfaces().len(), 2);
    assert_eq!(config.connection.disconnect_grace(), Duration::from_millis(250));
}

#[test]
fn test_builder_from_config_requires_secret() {
    let temp = TempDir::new().unwrap();
    let path = write_config(temp.path(), "ASTARTE_TEST_SECRET_NEVER_SET", "");
    let config = DeviceConfig::load_from_file(&path).unwrap();

    let result = DeviceBuilder::from_config(&config);
    assert!(matches!(
        result,
        Err(DeviceError::Config(ConfigError::EnvVarNotFound(name))) if name == "ASTARTE_TEST_SECRET_NEVER_SET"
    ));
}

#[test]
fn test_builder_from_config_reads_trust_anchors() {
    let temp = TempDir::new().unwrap();
    fs::write(
        temp.path().join("ca.pem"),
        "-----BEGIN CERTIFICATE-----\nCA\n-----END CERTIFICATE-----\n",
    )
    .unwrap();

    let secret_env = "ASTARTE_TEST_SECRET_ANCHORS";
    std::env::set_var(secret_env, "pairing-token");
    let path = write_config(temp.path(), secret_env, "[connection]\ntrust_anchors = \"ca.pem\"\n");
    let config = DeviceConfig::load_from_file(&path).unwrap();
    assert!(DeviceBuilder::from_config(&config).is_ok());

    let missing = write_config(temp.path(), secret_env, "[connection]\ntrust_anchors = \"missing.pem\"\n");
    let config = DeviceConfig::load_from_file(&missing).unwrap();
    assert!(matches!(
        DeviceBuilder::from_config(&config),
        Err(DeviceError::Config(ConfigError::FileRead(_)))
    ));
}
