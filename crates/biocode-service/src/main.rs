//! biocode command line
//!
//! `run` serves a local directory through the ingestion loop; `hash` prints
//! the identifier of a single file; `status`, `reset` and `keygen` manage the
//! durable state and signing key.

use anyhow::{anyhow, Context};
use biocode_core::identify_reader;
use biocode_declare::{Keypair, SECRET_KEY_ENV};
use biocode_ingest::{
    declarer_from_config, stop_channel, Cursor, CursorError, DeadLetterLog, DirectoryStore,
    HashMode, IngestSession, LogFormat, ServiceConfig,
};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use serde_json::json;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

fn cli() -> Command {
    Command::new("biocode")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Content identifiers for bioimage repositories")
        .subcommand_required(true)
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .global(true)
                .value_parser(value_parser!(PathBuf))
                .help("TOML configuration file; environment variables override it"),
        )
        .arg(
            Arg::new("state-dir")
                .long("state-dir")
                .global(true)
                .value_parser(value_parser!(PathBuf))
                .help("Directory holding the cursor and dead-letter log"),
        )
        .subcommand(
            Command::new("run")
                .about("Ingest a directory of image files")
                .arg(
                    Arg::new("source")
                        .long("source")
                        .value_parser(value_parser!(PathBuf))
                        .help("Directory served as the image store"),
                )
                .arg(
                    Arg::new("mode")
                        .long("mode")
                        .value_parser(["pixels", "file"])
                        .help("What gets hashed"),
                )
                .arg(
                    Arg::new("reset")
                        .long("reset")
                        .action(ArgAction::SetTrue)
                        .help("Rewind the watermark before starting"),
                )
                .arg(
                    Arg::new("once")
                        .long("once")
                        .action(ArgAction::SetTrue)
                        .help("Stop after the first empty poll"),
                ),
        )
        .subcommand(
            Command::new("hash")
                .about("Print the content identifier of one file")
                .arg(
                    Arg::new("file")
                        .required(true)
                        .value_parser(value_parser!(PathBuf))
                        .help("File to hash"),
                )
                .arg(
                    Arg::new("chunk-size")
                        .long("chunk-size")
                        .default_value("1048576")
                        .value_parser(value_parser!(usize))
                        .help("Read size in bytes"),
                ),
        )
        .subcommand(Command::new("status").about("Show watermark and dead-letter count"))
        .subcommand(Command::new("reset").about("Rewind the watermark to the origin"))
        .subcommand(Command::new("keygen").about("Generate a declaration signing key"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let matches = cli().get_matches();

    match matches.subcommand() {
        Some(("run", args)) => run_service(&matches, args).await,
        Some(("hash", args)) => {
            init_tracing("warn", LogFormat::Text);
            hash_file(args)
        }
        Some(("status", _)) => {
            let config = load_config(&matches, None)?;
            init_tracing(&config.log_level, config.log_format);
            show_status(&config)
        }
        Some(("reset", _)) => {
            let config = load_config(&matches, None)?;
            init_tracing(&config.log_level, config.log_format);
            reset_cursor(&config)
        }
        Some(("keygen", _)) => {
            let keypair = Keypair::generate();
            println!("{SECRET_KEY_ENV}={}", keypair.secret_multibase());
            println!("# public key: {}", keypair.public_multibase());
            Ok(())
        }
        _ => Err(anyhow!("no subcommand given")),
    }
}

fn init_tracing(level: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .init(),
        LogFormat::Text => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .init(),
    }
}

/// File and environment, then command-line overrides
fn load_config(global: &ArgMatches, run: Option<&ArgMatches>) -> anyhow::Result<ServiceConfig> {
    let path = global.get_one::<PathBuf>("config");
    let mut config = ServiceConfig::load(path.map(PathBuf::as_path))?;

    if let Some(dir) = global.get_one::<PathBuf>("state-dir") {
        config.state_dir.clone_from(dir);
    }
    if let Some(args) = run {
        if let Some(dir) = args.get_one::<PathBuf>("source") {
            config.source_dir = Some(dir.clone());
        }
        if let Some(mode) = args.get_one::<String>("mode") {
            config.hash_mode = mode.parse::<HashMode>().map_err(anyhow::Error::msg)?;
        }
    }
    config.validate()?;
    Ok(config)
}

/// A directory store only serves raw files
fn check_directory_mode(config: &ServiceConfig) -> anyhow::Result<()> {
    match config.hash_mode {
        HashMode::File => Ok(()),
        HashMode::Pixels => Err(anyhow!(
            "a directory source has no pixel access: pass --mode file or set hash_mode = \"file\""
        )),
    }
}

async fn run_service(global: &ArgMatches, args: &ArgMatches) -> anyhow::Result<()> {
    let config = load_config(global, Some(args))?;
    init_tracing(&config.log_level, config.log_format);
    check_directory_mode(&config)?;

    let source_dir = config
        .source_dir
        .clone()
        .context("no image source: set source_dir or pass --source")?;
    std::fs::create_dir_all(&config.state_dir)
        .with_context(|| format!("cannot create state dir {}", config.state_dir.display()))?;

    let store = DirectoryStore::open(&source_dir, &config.state_dir)?;
    let declarer = declarer_from_config(&config);
    let (handle, signal) = stop_channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, finishing current image");
            handle.stop();
        }
    });

    let mut session = IngestSession::new(store, declarer, config, signal)?;
    if args.get_flag("reset") {
        session.reset_cursor()?;
    }
    let stats = if args.get_flag("once") {
        session.drain().await?
    } else {
        session.run().await?
    };
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

fn hash_file(args: &ArgMatches) -> anyhow::Result<()> {
    let path = args
        .get_one::<PathBuf>("file")
        .context("missing file argument")?;
    let chunk_size = args
        .get_one::<usize>("chunk-size")
        .copied()
        .unwrap_or(DEFAULT_CHUNK_SIZE);
    let file = std::fs::File::open(path)
        .with_context(|| format!("cannot open {}", path.display()))?;
    let identifier = identify_reader(std::io::BufReader::new(file), chunk_size)
        .with_context(|| format!("cannot read {}", path.display()))?;
    println!("{}", serde_json::to_string_pretty(&identifier)?);
    Ok(())
}

fn show_status(config: &ServiceConfig) -> anyhow::Result<()> {
    let cursor = Cursor::load(&config.state_dir)?;
    let dead_letters = DeadLetterLog::new(&config.state_dir).count()?;
    let status = json!({
        "state_dir": config.state_dir,
        "watermark": cursor.watermark(),
        "dead_letters": dead_letters,
        "hash_mode": config.hash_mode,
        "namespace": config.namespace,
        "registry": config.registry.endpoint().ok(),
    });
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

fn reset_cursor(config: &ServiceConfig) -> anyhow::Result<()> {
    let mut cursor = match Cursor::load(&config.state_dir) {
        Ok(cursor) => cursor,
        Err(CursorError::Corrupt { path, .. }) => {
            warn!(path = %path.display(), "replacing corrupt cursor");
            Cursor::origin(&config.state_dir)
        }
        Err(e) => return Err(e.into()),
    };
    let previous = cursor.watermark();
    cursor.reset()?;
    info!(previous, "watermark reset to origin");
    println!("watermark reset (was {previous})");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_is_consistent() {
        cli().debug_assert();
    }

    #[test]
    fn run_overrides_apply() {
        let matches = cli()
            .try_get_matches_from([
                "biocode",
                "--state-dir",
                "/tmp/biocode-state",
                "run",
                "--source",
                "/srv/images",
                "--mode",
                "file",
            ])
            .unwrap();
        let (_, run) = matches.subcommand().unwrap();
        let config = load_config(&matches, Some(run)).unwrap();
        assert_eq!(config.state_dir, PathBuf::from("/tmp/biocode-state"));
        assert_eq!(config.source_dir, Some(PathBuf::from("/srv/images")));
        assert_eq!(config.hash_mode, HashMode::File);
    }

    #[test]
    fn directory_runs_need_file_mode() {
        let matches = cli()
            .try_get_matches_from(["biocode", "run", "--source", "/srv/images", "--mode", "pixels"])
            .unwrap();
        let (_, run) = matches.subcommand().unwrap();
        let config = load_config(&matches, Some(run)).unwrap();
        let err = check_directory_mode(&config).unwrap_err();
        assert!(err.to_string().contains("--mode file"));
        assert!(check_directory_mode(&config.with_hash_mode(HashMode::File)).is_ok());
    }

    #[test]
    fn hash_requires_a_file() {
        assert!(cli().try_get_matches_from(["biocode", "hash"]).is_err());
    }
}
