use super::*;

#[test]
fn defaults_resolve_without_any_source() {
    let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");

    assert_eq!(settings.logging.level, LevelFilter::INFO);
    assert!(matches!(settings.logging.format, LogFormat::Compact));
    assert_eq!(settings.export.directory, PathBuf::from(DEFAULT_EXPORT_DIR));
    assert_eq!(
        settings.render.cache_dir,
        PathBuf::from(DEFAULT_RENDER_CACHE_DIR)
    );
    assert_eq!(settings.render.concurrency.get(), 4);
    assert_eq!(settings.render.batch_timeout, Duration::from_secs(10));
    assert_eq!(settings.cache.max_entries, 5_000);
    assert_eq!(settings.cache.max_total_bytes, 256 * 1024 * 1024);
    assert_eq!(settings.cache.max_age_days, 30);
    assert_eq!(settings.cache.sweep_interval, None);
    assert_eq!(settings.jobs.backend, BackendPreference::Auto);
}

#[test]
fn cli_overrides_take_highest_precedence() {
    let mut raw = RawSettings::default();
    raw.render.concurrency = Some(2);
    raw.logging.level = Some("info".to_string());

    let overrides = ExportOverrides {
        logging: LoggingOverrides {
            log_level: Some("debug".to_string()),
            log_json: Some(true),
        },
        render: RenderOverrides {
            concurrency: Some(8),
            ..Default::default()
        },
        jobs_backend: Some("thread".to_string()),
        cache_sweep_interval_seconds: Some(60),
        ..Default::default()
    };

    raw.apply_export_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(settings.logging.level, LevelFilter::DEBUG);
    assert!(matches!(settings.logging.format, LogFormat::Json));
    assert_eq!(settings.render.concurrency.get(), 8);
    assert_eq!(settings.jobs.backend, BackendPreference::Thread);
    assert_eq!(settings.cache.sweep_interval, Some(Duration::from_secs(60)));
}

#[test]
fn evict_flags_feed_the_policy() {
    let mut raw = RawSettings::default();
    let args = EvictArgs {
        max_entries: Some(10),
        max_bytes: Some(4096),
        max_age_days: Some(2),
        ..Default::default()
    };

    raw.apply_evict_overrides(&args);
    let policy = Settings::from_raw(raw).expect("valid settings").cache.policy();

    assert_eq!(policy, EvictionPolicy::new(10, 4096, 2));
    assert_eq!(policy.max_age, Duration::from_secs(2 * 24 * 60 * 60));
}

#[test]
fn zero_concurrency_is_rejected() {
    let mut raw = RawSettings::default();
    raw.render.concurrency = Some(0);

    let err = Settings::from_raw(raw).expect_err("zero concurrency");
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "render.concurrency",
            ..
        }
    ));
}

#[test]
fn zero_batch_timeout_is_rejected() {
    let mut raw = RawSettings::default();
    raw.render.batch_timeout_ms = Some(0);

    let err = Settings::from_raw(raw).expect_err("zero timeout");
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "render.batch_timeout_ms",
            ..
        }
    ));
}

#[test]
fn unknown_backend_is_rejected() {
    let mut raw = RawSettings::default();
    raw.jobs.backend = Some("fork".to_string());

    let err = Settings::from_raw(raw).expect_err("bad backend");
    assert!(matches!(err, LoadError::Invalid { key: "jobs.backend", .. }));
}

#[test]
fn invalid_log_level_is_rejected() {
    let mut raw = RawSettings::default();
    raw.logging.level = Some("loud".to_string());

    assert!(Settings::from_raw(raw).is_err());
}

#[test]
fn worker_environment_round_trips_render_settings() {
    let mut raw = RawSettings::default();
    raw.render.cache_dir = Some(PathBuf::from("/var/cache/formulas"));
    raw.render.concurrency = Some(3);
    raw.render.batch_timeout_ms = Some(2_500);
    raw.logging.level = Some("warn".to_string());
    let settings = Settings::from_raw(raw).expect("valid settings");

    let env = worker_environment(&settings);
    let lookup = |key: &str| {
        env.iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.as_str())
    };

    assert_eq!(
        lookup("MATHEXPORT__RENDER__CACHE_DIR"),
        Some("/var/cache/formulas")
    );
    assert_eq!(lookup("MATHEXPORT__RENDER__CONCURRENCY"), Some("3"));
    assert_eq!(lookup("MATHEXPORT__RENDER__BATCH_TIMEOUT_MS"), Some("2500"));
    assert_eq!(lookup("MATHEXPORT__LOGGING__LEVEL"), Some("warn"));
    assert_eq!(lookup("MATHEXPORT__LOGGING__JSON"), Some("false"));
}

#[test]
fn parse_export_arguments() {
    let cli = CliArgs::try_parse_from([
        "mathexport",
        "export",
        "--questions",
        "sheet.json",
        "--wait",
        "false",
        "--jobs-backend",
        "process",
        "--render-batch-timeout-ms",
        "500",
    ])
    .expect("parse export");

    match cli.command {
        Command::Export(args) => {
            assert_eq!(args.questions, PathBuf::from("sheet.json"));
            assert!(!args.wait);
            assert_eq!(args.poll_ms, 200);
            assert_eq!(args.overrides.jobs_backend.as_deref(), Some("process"));
            assert_eq!(args.overrides.render.batch_timeout_ms, Some(500));
        }
        other => panic!("unexpected command: {other:?}"),
    }
}

#[test]
fn export_waits_by_default() {
    let cli = CliArgs::try_parse_from(["mathexport", "export", "--questions", "q.json"])
        .expect("parse export");
    assert!(matches!(cli.command, Command::Export(args) if args.wait));
}

#[test]
fn parse_render_arguments() {
    let cli = CliArgs::try_parse_from(["mathexport", "render", "--display", "x^2"])
        .expect("parse render");

    match cli.command {
        Command::Render(args) => {
            assert_eq!(args.formula, "x^2");
            assert!(args.display);
        }
        other => panic!("unexpected command: {other:?}"),
    }
}

#[test]
fn parse_cache_evict_arguments() {
    let cli = CliArgs::try_parse_from([
        "mathexport",
        "cache",
        "evict",
        "--max-entries",
        "100",
        "--max-age-days",
        "7",
    ])
    .expect("parse evict");

    match cli.command {
        Command::Cache(CacheArgs {
            command: CacheCommand::Evict(args),
        }) => {
            assert_eq!(args.max_entries, Some(100));
            assert_eq!(args.max_bytes, None);
            assert_eq!(args.max_age_days, Some(7));
        }
        other => panic!("unexpected command: {other:?}"),
    }
}

#[test]
fn parse_hidden_worker_arguments() {
    let cli = CliArgs::try_parse_from([
        "mathexport",
        "worker",
        "--export",
        "question_sheet",
        "--args",
        "{\"title\":\"t\"}",
        "--output",
        "/tmp/out.html",
    ])
    .expect("parse worker");

    match cli.command {
        Command::Worker(args) => {
            assert_eq!(args.export, "question_sheet");
            assert_eq!(args.args, "{\"title\":\"t\"}");
            assert_eq!(args.output, PathBuf::from("/tmp/out.html"));
        }
        other => panic!("unexpected command: {other:?}"),
    }
}

#[test]
fn subcommand_is_required() {
    assert!(CliArgs::try_parse_from(["mathexport"]).is_err());
}
