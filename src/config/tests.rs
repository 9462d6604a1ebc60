use clap::Parser;

use super::*;
use crate::cache::InvalidationStrategy;

#[test]
fn defaults_are_valid() {
    let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");

    assert_eq!(settings.logging.level, LevelFilter::INFO);
    assert!(matches!(settings.logging.format, LogFormat::Compact));
    assert_eq!(settings.cache.default_ttl_secs, 300);
    assert_eq!(settings.cache.key_prefix, "query_cache:");
    assert!(settings.remote.url.is_none());
}

#[test]
fn cli_overrides_take_highest_precedence() {
    let mut raw = RawSettings::default();
    raw.logging.level = Some("info".to_string());
    raw.remote.url = Some("redis://file-host:6379".to_string());

    let overrides = GlobalOverrides {
        log_level: Some("debug".to_string()),
        redis_url: Some("redis://cli-host:6379".to_string()),
        key_prefix: Some("reports:".to_string()),
        ..Default::default()
    };

    raw.apply_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(settings.logging.level, LevelFilter::DEBUG);
    assert_eq!(settings.remote.url.as_deref(), Some("redis://cli-host:6379"));
    assert_eq!(settings.cache.key_prefix, "reports:");
}

#[test]
fn cli_json_logging_enforces_format() {
    let mut raw = RawSettings::default();
    let overrides = GlobalOverrides {
        log_json: Some(true),
        ..Default::default()
    };

    raw.apply_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert!(matches!(settings.logging.format, LogFormat::Json));
}

#[test]
fn invalid_log_level_is_rejected() {
    let mut raw = RawSettings::default();
    raw.logging.level = Some("loud".to_string());

    let err = Settings::from_raw(raw).expect_err("invalid level");
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "logging.level",
            ..
        }
    ));
}

#[test]
fn zero_limits_are_rejected() {
    let mut raw = RawSettings::default();
    raw.cache.max_entries = 0;

    let err = Settings::from_raw(raw).expect_err("zero max_entries");
    assert_eq!(
        err.to_string(),
        "invalid configuration for `cache.max_entries`: must be greater than zero"
    );
}

#[test]
fn out_of_range_default_ttl_is_rejected() {
    for ttl in [0, -60, 10_000_000_000_000] {
        let mut raw = RawSettings::default();
        raw.cache.default_ttl_secs = ttl;

        let err = Settings::from_raw(raw).expect_err("ttl out of range");
        assert!(matches!(
            err,
            LoadError::Invalid {
                key: "cache.default_ttl_secs",
                ..
            }
        ));
    }
}

#[test]
fn blank_remote_url_means_no_remote() {
    let mut raw = RawSettings::default();
    raw.remote.url = Some("   ".to_string());

    let settings = Settings::from_raw(raw).expect("valid settings");
    assert!(settings.remote.url.is_none());
}

#[test]
fn cache_section_deserializes_from_toml() {
    let raw: RawSettings = Config::builder()
        .add_source(config::File::from_str(
            r#"
            [cache]
            default_ttl_secs = 60
            invalidation_strategy = "batched"
            invalidation_batch_timeout_ms = 250

            [remote]
            url = "redis://127.0.0.1:6379/2"
            "#,
            config::FileFormat::Toml,
        ))
        .build()
        .expect("config builds")
        .try_deserialize()
        .expect("settings deserialize");

    let settings = Settings::from_raw(raw).expect("valid settings");
    assert_eq!(settings.cache.default_ttl_secs, 60);
    assert_eq!(
        settings.cache.invalidation_strategy,
        InvalidationStrategy::Batched
    );
    assert_eq!(settings.cache.invalidation_batch_timeout_ms, 250);
    assert_eq!(settings.cache.max_entries, 10_000);
    assert_eq!(
        settings.remote.url.as_deref(),
        Some("redis://127.0.0.1:6379/2")
    );
}

#[test]
fn parse_fingerprint_arguments() {
    let args = CliArgs::parse_from([
        "querycache",
        "fingerprint",
        "SELECT * FROM users WHERE id = $1",
        "--param",
        "42",
        "-p",
        "ada",
    ]);

    match args.command {
        Command::Fingerprint(query) => {
            assert_eq!(query.query, "SELECT * FROM users WHERE id = $1");
            assert_eq!(
                query.param_values(),
                vec![serde_json::json!(42), serde_json::json!("ada")]
            );
        }
        _ => panic!("wrong command parsed"),
    }
}

#[test]
fn global_overrides_follow_subcommand() {
    let args = CliArgs::parse_from([
        "querycache",
        "clear",
        "--redis-url",
        "redis://example:6379",
        "--log-json",
        "true",
    ]);

    assert!(matches!(args.command, Command::Clear));
    assert_eq!(
        args.overrides.redis_url.as_deref(),
        Some("redis://example:6379")
    );
    assert_eq!(args.overrides.log_json, Some(true));
}
