use relaybox::config::{Config, SandboxKind};
use relaybox::{EXAMPLE_CONFIG, Language};

use super::fixture_config;

#[test]
fn test_example_config_covers_every_language() {
    let config = Config::parse_toml(EXAMPLE_CONFIG).expect("Failed to parse example config");
    for language in Language::ALL {
        assert!(
            config.toolchain(language).is_ok(),
            "{language} missing from example config"
        );
    }
    assert_eq!(config.backend, SandboxKind::Isolate);
}

#[test]
fn test_load_minimal_process_config() {
    let config =
        Config::from_file(fixture_config("process_minimal.toml")).expect("Failed to load config");

    assert_eq!(config.backend, SandboxKind::Process);
    assert!(config.languages.contains_key("python"));
    assert!(config.toolchain(Language::C).is_err());
    assert_eq!(config.default_limits.wall_time_limit, Some(10.0));
}

#[test]
fn test_load_session_overrides() {
    let config =
        Config::from_file(fixture_config("session_overrides.toml")).expect("Failed to load config");

    assert_eq!(config.session.kill_grace_ms, 250);
    assert_eq!(config.session.drain_timeout_ms, 500);
    assert_eq!(config.session.outbound_buffer, 256);
    assert_eq!(config.default_limits.time_limit, Some(2.0));
    // unspecified limits keep their defaults
    assert_eq!(config.default_limits.memory_limit, Some(262144));
}

#[test]
fn test_load_unknown_language() {
    let result = Config::from_file(fixture_config("invalid_language.toml"));
    assert!(result.is_err());
}

#[test]
fn test_load_empty_run_command() {
    let result = Config::from_file(fixture_config("invalid_empty_run_command.toml"));
    assert!(result.is_err());
}

#[test]
fn test_load_missing_file() {
    let result = Config::from_file(fixture_config("does_not_exist.toml"));
    assert!(result.is_err());
}
