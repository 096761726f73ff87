use std::io::Write;

use dmflow_core::config::AppConfig;

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[storage]
path = "/var/lib/dmflow/dmflow.db"

[gateway]
base_url = "https://graph.example.test/v24.0"
timeout_secs = 10

[server]
bind = "0.0.0.0:9999"
internal_api_key = "internal-test-key"
verify_token = "verify-me"

[workers]
queue_interval_secs = 120
enforcer_interval_secs = 3600
run_budget_secs = 60

[rate_limit]
default_per_hour = 500
safety_buffer = 25
per_trigger_cost = 5
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.storage.path, "/var/lib/dmflow/dmflow.db");
    assert_eq!(config.gateway.base_url, "https://graph.example.test/v24.0");
    assert_eq!(config.gateway.timeout_secs, 10);
    assert_eq!(config.server.bind, "0.0.0.0:9999");
    assert_eq!(config.server.internal_api_key, "internal-test-key");
    assert_eq!(config.server.verify_token, "verify-me");
    assert_eq!(config.workers.queue_interval_secs, 120);
    assert_eq!(config.workers.enforcer_interval_secs, 3600);
    assert_eq!(config.rate_limit.default_per_hour, 500);
    assert_eq!(config.rate_limit.safety_buffer, 25);
    assert_eq!(config.rate_limit.per_trigger_cost, 5);
}

#[test]
fn test_missing_sections_fall_back_to_defaults() {
    let toml_content = r#"
[server]
verify_token = "just-this"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.server.verify_token, "just-this");
    assert_eq!(config.rate_limit.default_per_hour, 200);
    assert_eq!(config.rate_limit.safety_buffer, 50);
    assert_eq!(config.rate_limit.per_trigger_cost, 10);
    assert_eq!(config.workers.enforcer_interval_secs, 86_400);
}

#[test]
fn test_env_var_expansion_in_config() {
    std::env::set_var("DMFLOW_TEST_VERIFY_TOKEN", "expanded-token-value");

    let toml_content = r#"
[server]
verify_token = "${DMFLOW_TEST_VERIFY_TOKEN}"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");
    assert_eq!(config.server.verify_token, "expanded-token-value");
}

#[test]
fn test_unset_env_var_is_left_verbatim() {
    let toml_content = r#"
[server]
internal_api_key = "${DMFLOW_DEFINITELY_UNSET_VAR}"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");
    assert_eq!(
        config.server.internal_api_key,
        "${DMFLOW_DEFINITELY_UNSET_VAR}"
    );
}

#[test]
fn test_missing_file_is_a_distinct_error() {
    let err = AppConfig::load(std::path::Path::new("/nonexistent/dmflow.toml"))
        .expect_err("should fail");
    assert!(err.to_string().contains("/nonexistent/dmflow.toml"));
}
