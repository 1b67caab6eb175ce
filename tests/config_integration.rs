use agent_relay::config::AppConfig;
use serial_test::serial;
use std::env;
use std::fs;

// Helper to clear environment variables that might interfere with tests
fn clear_env_vars() {
    unsafe {
        env::remove_var("RELAY_SERVER__PORT");
        env::remove_var("RELAY_PERSISTENCE__PROVIDER");
        env::remove_var("CONFIG_FILE");
    }
}

#[test]
#[serial]
fn test_default_config() {
    clear_env_vars();

    let config = AppConfig::load_from_args(["agent-relay"]).expect("Failed to load config");
    assert_eq!(config.server.port, 3000);
    assert_eq!(config.server.host, "0.0.0.0");
    assert_eq!(config.persistence.provider, "memory");
    assert_eq!(config.streaming.event_ttl_secs, 3600);
    assert_eq!(config.streaming.join_timeout_secs, 30);
}

#[test]
#[serial]
fn test_env_override() {
    clear_env_vars();
    unsafe {
        env::set_var("RELAY_SERVER__PORT", "9090");
        env::set_var("RELAY_PERSISTENCE__PROVIDER", "postgres");
    }

    let config = AppConfig::load_from_args(["agent-relay"]).expect("Failed to load config");
    assert_eq!(config.server.port, 9090);
    assert_eq!(config.persistence.provider, "postgres");

    clear_env_vars();
}

#[test]
#[serial]
fn test_cli_overrides_env() {
    clear_env_vars();
    unsafe {
        env::set_var("RELAY_SERVER__PORT", "9090");
    }

    let config = AppConfig::load_from_args(["agent-relay", "--port", "8123"])
        .expect("Failed to load config");
    assert_eq!(config.server.port, 8123);

    clear_env_vars();
}

#[test]
#[serial]
fn test_file_load() {
    clear_env_vars();

    let config_content = r#"
server:
  port: 7070
streaming:
  sweep_interval_secs: 60
    "#;

    let file_path = "test_config.yaml";
    fs::write(file_path, config_content).expect("Failed to write temp config");

    let config = AppConfig::load_from_args(["agent-relay", "--config", file_path])
        .expect("Failed to load config from file");
    assert_eq!(config.server.port, 7070);
    assert_eq!(config.streaming.sweep_interval_secs, 60);

    fs::remove_file(file_path).unwrap();
    clear_env_vars();
}
