//! Tests for configuration parsing and validation.

use super::*;

#[test]
fn parse_basic_config_file() {
    let mut config = Config::default();
    apply_config_file(
        &mut config,
        r#"
port = 7777
upstream_host = db.example.com
upstream_port = 5433
"#,
    );
    assert_eq!(config.listen_port, 7777);
    assert_eq!(config.upstream_host, "db.example.com");
    assert_eq!(config.upstream_port, 5433);
}

#[test]
fn parse_quoted_values() {
    let mut config = Config::default();
    apply_config_file(
        &mut config,
        r#"
upstream_host = "db.example.com"
pool_password = 'my secret'
"#,
    );
    assert_eq!(config.upstream_host, "db.example.com");
    assert_eq!(config.pool_password, Some("my secret".into()));
}

#[test]
fn comments_and_blank_lines_ignored() {
    let mut config = Config::default();
    apply_config_file(
        &mut config,
        "# comment\nport = 9999\n\n  # indented comment\nupstream_port = 5433\n",
    );
    assert_eq!(config.listen_port, 9999);
    assert_eq!(config.upstream_port, 5433);
}

#[test]
fn unknown_keys_and_junk_lines_ignored() {
    let mut config = Config::default();
    apply_config_file(&mut config, "unknown_key = x\nno equals sign\nport = 8888\n");
    assert_eq!(config.listen_port, 8888);
}

#[test]
fn invalid_numeric_values_keep_defaults() {
    let mut config = Config::default();
    apply_config_file(&mut config, "port = not_a_number\n");
    assert_eq!(config.listen_port, 6432);
}

#[test]
fn csv_context_variables() {
    let mut config = Config::default();
    apply_config_file(
        &mut config,
        "context_variables = app.tenant_id, app.user_id, app.role\n",
    );
    assert_eq!(
        config.context_variables,
        vec!["app.tenant_id", "app.user_id", "app.role"]
    );
}

#[test]
fn key_aliases() {
    let mut config = Config::default();
    apply_config_file(&mut config, "listen_port = 7777\n");
    assert_eq!(config.listen_port, 7777);

    let mut config = Config::default();
    apply_config_file(&mut config, "host = 0.0.0.0\n");
    assert_eq!(config.listen_host, "0.0.0.0");

    let mut config = Config::default();
    apply_config_file(&mut config, "separator = +\n");
    assert_eq!(config.tenant_separator, "+");

    let mut config = Config::default();
    apply_config_file(&mut config, "superuser = admin, root\n");
    assert_eq!(config.superuser_bypass, vec!["admin", "root"]);
}

#[test]
fn pool_mode_parsing() {
    assert_eq!(parse_pool_mode("session"), PoolMode::Session);
    assert_eq!(parse_pool_mode("Session"), PoolMode::Session);
    assert_eq!(parse_pool_mode("  SESSION  "), PoolMode::Session);
    assert_eq!(parse_pool_mode("none"), PoolMode::None);
    assert_eq!(parse_pool_mode("garbage"), PoolMode::None);
}

#[test]
fn upstream_tls_booleans() {
    for value in ["true", "yes", "1"] {
        let mut config = Config::default();
        apply_config_file(&mut config, &format!("upstream_tls = {value}\n"));
        assert!(config.upstream_tls, "{value} should enable upstream_tls");
    }

    let mut config = Config::default();
    apply_config_file(&mut config, "upstream_tls = false\n");
    assert!(!config.upstream_tls);

    let mut config = Config::default();
    apply_config_file(&mut config, "upstream_tls_verify = no\n");
    assert!(!config.upstream_tls_verify);
}

#[test]
fn tenant_lists_from_file() {
    let mut config = Config::default();
    apply_config_file(&mut config, "tenant_allow = alpha, beta, gamma\n");
    assert_eq!(
        config.tenant_allow,
        Some(vec!["alpha".into(), "beta".into(), "gamma".into()])
    );

    let mut config = Config::default();
    apply_config_file(&mut config, "tenant_deny = bad_tenant\n");
    assert_eq!(config.tenant_deny, Some(vec!["bad_tenant".into()]));
}

#[test]
fn all_numeric_fields_parse() {
    let mut config = Config::default();
    apply_config_file(
        &mut config,
        r#"
pool_size = 50
pool_idle_timeout = 600
pool_checkout_timeout = 10
handshake_timeout = 60
tenant_max_connections = 100
tenant_rate_limit = 50
tenant_query_timeout = 30
worker_threads = 8
"#,
    );
    assert_eq!(config.pool_size, 50);
    assert_eq!(config.pool_idle_timeout, 600);
    assert_eq!(config.pool_checkout_timeout, 10);
    assert_eq!(config.handshake_timeout_secs, 60);
    assert_eq!(config.tenant_max_connections, Some(100));
    assert_eq!(config.tenant_rate_limit, Some(50));
    assert_eq!(config.tenant_query_timeout, Some(30));
    assert_eq!(config.worker_threads, 8);
}

#[test]
fn validate_default_config_passes() {
    assert!(Config::default().validate().is_ok());
}

#[test]
fn validate_tls_port_requires_cert_and_key() {
    let mut config = Config::default();
    config.tls_port = Some(6433);
    assert!(config.validate().is_err());

    config.tls_cert = Some("/tmp/cert.pem".into());
    config.tls_key = Some("/tmp/key.pem".into());
    assert!(config.validate().is_ok());
}

#[test]
fn validate_zero_handshake_timeout_fails() {
    let mut config = Config::default();
    config.handshake_timeout_secs = 0;
    assert!(config.validate().is_err());
}

#[test]
fn validate_session_pool_requirements() {
    let mut config = Config::default();
    config.pool_mode = PoolMode::Session;
    config.upstream_password = Some("pass".into());
    assert!(config.validate().is_err()); // missing pool_password

    config.pool_password = Some("pass".into());
    assert!(config.validate().is_ok());

    config.upstream_password = None;
    assert!(config.validate().is_err()); // missing upstream_password

    config.upstream_password = Some("pass".into());
    config.pool_size = 0;
    assert!(config.validate().is_err());
}

#[test]
fn validate_resolvers_file_must_exist() {
    let mut config = Config::default();
    config.resolvers = Some("/nonexistent/resolvers.toml".into());
    assert!(config.validate().is_err());
}

#[test]
fn validate_allow_and_deny_are_exclusive() {
    let mut config = Config::default();
    config.tenant_allow = Some(vec!["a".into()]);
    config.tenant_deny = Some(vec!["b".into()]);
    assert!(config.validate().is_err());
}

#[test]
fn validate_rejects_bad_session_variable_names() {
    let mut config = Config::default();
    config.context_variables = vec!["app.tenant; DROP TABLE".into()];
    assert!(config.validate().is_err());

    let mut config = Config::default();
    config.context_variables = vec![];
    assert!(config.validate().is_err());
}

#[test]
fn has_tenant_limits_detection() {
    assert!(!Config::default().has_tenant_limits());

    let mut config = Config::default();
    config.tenant_deny = Some(vec!["b".into()]);
    assert!(config.has_tenant_limits());

    let mut config = Config::default();
    config.tenant_max_connections = Some(10);
    assert!(config.has_tenant_limits());

    let mut config = Config::default();
    config.tenant_rate_limit = Some(5);
    assert!(config.has_tenant_limits());
}

#[test]
fn pool_mode_display() {
    assert_eq!(PoolMode::None.to_string(), "none");
    assert_eq!(PoolMode::Session.to_string(), "session");
}
