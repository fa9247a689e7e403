//! Golem CLI.
//!
//! One binary, two modes selected by argv[0]: invoked as `golem` it is
//! the host orchestrator; invoked as `golem_runner` (the name it is
//! installed under inside instance images) it is the in-container suite
//! runner.
//!
//! ## Host usage
//!
//! ```sh
//! golem [flags] [suite-path]
//! ```
//!
//! The positional argument is a suite configuration file or a directory
//! containing `golem.conf`; it defaults to the current directory.

use golem::cache::ImageCache;
use golem::constants::{
    COMPOSE_FILE, DAEMON_STATE_PATH, DEFAULT_BASE_IMAGE, IMAGES_PATH, IMAGE_CACHE_DIR,
    INSTANCE_PLAN_PATH, LOG_ROOT,
};
use golem::engine::cli::{CliEngine, CliEngineConnector, CliImageBuilder};
use golem::error::{Error, Result};
use golem::host::{HostConfig, HostRunner};
use golem::logs::{serve_forwards, ConsoleLogCapturer, LogCapturer, LogRouter, RemoteLogForwarder};
use golem::options::{EngineFlags, EngineOptions};
use golem::reference::TaggedRef;
use golem::resolver::{plan_suite, DefaultResolver, FlagResolver, RunConfiguration};
use golem::suite::{SuiteRunner, SuiteRunnerConfig};
use golem::suite_file::{load_suites, resolve_config_path};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Address `-rundaemon` listens on for forwarded log streams.
const FORWARD_LISTEN_ADDR: &str = "0.0.0.0:9631";

fn main() -> ExitCode {
    let invoked_as = std::env::args()
        .next()
        .map(|arg0| {
            Path::new(&arg0)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        })
        .unwrap_or_default();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if invoked_as == "golem_runner" {
        runtime.block_on(runner_main())
    } else {
        runtime.block_on(host_main())
    }
}

fn init_tracing(debug: bool) {
    let filter = if debug { "debug" } else { "info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();
}

// =============================================================================
// Host Mode
// =============================================================================

#[derive(Default)]
struct HostFlags {
    cache_dir: Option<PathBuf>,
    run_daemon: bool,
    debug: bool,
    no_cache: bool,
    clean: bool,
    namespace: Option<String>,
    custom_images: Vec<String>,
    engine: EngineFlags,
    suite_path: Option<PathBuf>,
}

fn parse_host_flags() -> std::result::Result<HostFlags, String> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut flags = HostFlags::default();

    let mut i = 0;
    while i < args.len() {
        let take_value = |i: &mut usize| -> std::result::Result<String, String> {
            if *i + 1 < args.len() {
                *i += 2;
                Ok(args[*i - 1].clone())
            } else {
                Err(format!("{} requires a value", args[*i]))
            }
        };

        match args[i].as_str() {
            "-cache" => flags.cache_dir = Some(PathBuf::from(take_value(&mut i)?)),
            "-rundaemon" => {
                flags.run_daemon = true;
                i += 1;
            }
            "-debug" => {
                flags.debug = true;
                i += 1;
            }
            "-nocache" => {
                flags.no_cache = true;
                i += 1;
            }
            "-clean" => {
                flags.clean = true;
                i += 1;
            }
            "-namespace" => flags.namespace = Some(take_value(&mut i)?),
            "-i" => flags.custom_images.push(take_value(&mut i)?),
            "-H" => flags.engine.host = Some(take_value(&mut i)?),
            "--tls" => {
                flags.engine.use_tls = true;
                i += 1;
            }
            "--tlsverify" => {
                flags.engine.verify_tls = true;
                i += 1;
            }
            "--cacert" => flags.engine.ca_cert = Some(take_value(&mut i)?),
            "--cert" => flags.engine.client_cert = Some(take_value(&mut i)?),
            "--key" => flags.engine.client_key = Some(take_value(&mut i)?),
            arg if arg.starts_with('-') => return Err(format!("unknown flag: {}", arg)),
            arg => {
                if flags.suite_path.is_some() {
                    return Err("only one suite path may be given".to_string());
                }
                flags.suite_path = Some(PathBuf::from(arg));
                i += 1;
            }
        }
    }

    Ok(flags)
}

async fn host_main() -> ExitCode {
    let flags = match parse_host_flags() {
        Ok(flags) => flags,
        Err(message) => {
            eprintln!("golem: {}", message);
            return ExitCode::FAILURE;
        }
    };
    init_tracing(flags.debug);

    let token = CancellationToken::new();

    if flags.run_daemon {
        return match serve_forwards(FORWARD_LISTEN_ADDR, token).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!("{}", e);
                ExitCode::FAILURE
            }
        };
    }

    match orchestrate(flags, token).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn orchestrate(flags: HostFlags, token: CancellationToken) -> Result<()> {
    // A temporary cache still deduplicates within this run; it is removed
    // when the guard drops.
    let mut _cache_guard = None;
    let cache_dir = match &flags.cache_dir {
        Some(dir) => dir.clone(),
        None => {
            let temp = tempfile::Builder::new()
                .prefix("golem-cache-")
                .tempdir()
                .map_err(Error::Io)?;
            let dir = temp.path().to_path_buf();
            _cache_guard = Some(temp);
            dir
        }
    };
    let cache = ImageCache::new(cache_dir.join(IMAGE_CACHE_DIR));

    let cwd = std::env::current_dir().map_err(Error::Io)?;
    let config_path = resolve_config_path(&flags.suite_path.clone().unwrap_or_else(|| cwd.clone()))?;
    debug!("using configuration {}", config_path.display());

    let mut custom_images = Vec::with_capacity(flags.custom_images.len());
    for value in &flags.custom_images {
        custom_images.push(FlagResolver::parse_custom_image(value)?);
    }
    let flag_resolver = FlagResolver::new(custom_images);
    let defaults = DefaultResolver::new(TaggedRef::parse(DEFAULT_BASE_IMAGE)?, cwd);

    let suites = load_suites(&config_path)?
        .into_iter()
        .map(|suite| plan_suite(&flag_resolver, suite, &defaults))
        .collect();

    let engine = Arc::new(CliEngine::new(
        "docker",
        EngineOptions::resolve(&flags.engine),
    ));
    let builder = CliImageBuilder::new(engine.clone());

    let executable = std::env::current_exe().map_err(Error::Io)?;
    let runner = HostRunner::new(HostConfig {
        suites,
        image_namespace: flags.namespace,
        executable,
        no_cache: flags.no_cache,
        clean: flags.clean,
        debug: flags.debug,
    });

    runner
        .build(engine.as_ref(), &builder, &cache, &token)
        .await?;
    runner.run(engine.as_ref(), &token).await?;
    Ok(())
}

// =============================================================================
// Runner Mode
// =============================================================================

#[derive(Default)]
struct RunnerFlags {
    command: String,
    dind: bool,
    clean: bool,
    debug: bool,
    forward: Option<String>,
}

fn parse_runner_flags() -> std::result::Result<RunnerFlags, String> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut flags = RunnerFlags {
        command: "bats".to_string(),
        ..Default::default()
    };

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "-command" => {
                if i + 1 < args.len() {
                    flags.command = args[i + 1].clone();
                    i += 2;
                } else {
                    return Err("-command requires a value".to_string());
                }
            }
            "-docker" => {
                flags.dind = true;
                i += 1;
            }
            "-clean" => {
                flags.clean = true;
                i += 1;
            }
            "-debug" => {
                flags.debug = true;
                i += 1;
            }
            "-forward" => {
                if i + 1 < args.len() {
                    flags.forward = Some(args[i + 1].clone());
                    i += 2;
                } else {
                    return Err("-forward requires a value".to_string());
                }
            }
            arg => return Err(format!("unknown flag: {}", arg)),
        }
    }

    Ok(flags)
}

async fn runner_main() -> ExitCode {
    let flags = match parse_runner_flags() {
        Ok(flags) => flags,
        Err(message) => {
            eprintln!("golem_runner: {}", message);
            return ExitCode::FAILURE;
        }
    };
    init_tracing(flags.debug);
    debug!("suite runner starting");

    let token = CancellationToken::new();
    match run_suite(flags, token).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("test errored: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_suite(flags: RunnerFlags, token: CancellationToken) -> Result<()> {
    let router = LogRouter::new(Some(PathBuf::from(LOG_ROOT)));

    let script_capturer = router.capturer("scripts").await?;
    let load_capturer = router.capturer("load").await?;
    let daemon_capturer = router.capturer("daemon").await?;
    let test_capturer = router.capturer("test").await?;

    let compose_file = Path::new(COMPOSE_FILE);
    let compose_capturer = if compose_file.exists() {
        Some(router.capturer("compose").await?)
    } else {
        debug!("no compose file found at {}", COMPOSE_FILE);
        None
    };

    match &flags.forward {
        Some(addr) => {
            router.add_forwarder(RemoteLogForwarder::new(addr.clone())).await?;
        }
        None => {
            // Without a forwarder the test stream also mirrors to the
            // console so the host's attach sees it.
            router
                .add_capturer("test", Arc::new(ConsoleLogCapturer::new()))
                .await?;
        }
    }

    let plan = std::fs::read(INSTANCE_PLAN_PATH).map_err(|e| Error::ConfigLoadFailed {
        path: PathBuf::from(INSTANCE_PLAN_PATH),
        reason: e.to_string(),
    })?;
    let run: RunConfiguration =
        serde_json::from_slice(&plan).map_err(|e| Error::Serialization(e.to_string()))?;

    let as_capturer = |tapper: &golem::logs::LogTapper| -> Arc<dyn LogCapturer> {
        Arc::new(tapper.clone())
    };

    let mut runner = SuiteRunner::new(SuiteRunnerConfig {
        dind: flags.dind,
        clean_state: flags.clean,
        clean_images: flags.clean,
        daemon_binary: "docker".to_string(),
        compose_binary: "docker-compose".to_string(),
        compose_file: compose_capturer
            .is_some()
            .then(|| compose_file.to_path_buf()),
        image_root: PathBuf::from(IMAGES_PATH),
        state_dir: PathBuf::from(DAEMON_STATE_PATH),
        run,
        default_command: Some(flags.command.clone()),
        script_capturer: as_capturer(&script_capturer),
        load_capturer: as_capturer(&load_capturer),
        daemon_capturer: as_capturer(&daemon_capturer),
        test_capturer: as_capturer(&test_capturer),
        compose_capturer: compose_capturer.as_ref().map(|c| as_capturer(c)),
    });

    let connector = CliEngineConnector::new("docker", EngineOptions::local());

    let setup_result = runner.setup(&connector, &token).await;
    let test_result = match &setup_result {
        Ok(()) => runner.run_tests(&token).await,
        Err(_) => Ok(()),
    };

    runner.teardown(&token).await;
    router.shutdown().await;

    setup_result?;
    test_result
}
