use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use pinharvest::config::{BoardSource, Config};
use pinharvest::db::Store;
use pinharvest::export::{export_dataset, ExportFormat};
use pinharvest::{logging, Pipeline};

enum Command {
    Run { boards: Vec<String> },
    ResetFailed { pin_id: String },
    Stats,
    Export { path: PathBuf, format: Option<ExportFormat> },
    LastReport,
}

struct Args {
    command: Command,
    config_path: Option<PathBuf>,
    verbose: bool,
}

fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().collect();
    let mut config_path = None;
    let mut verbose = false;
    let mut format = None;
    let mut positional = Vec::new();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("pinharvest {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--verbose" | "-v" => {
                verbose = true;
            }
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                } else {
                    eprintln!("Error: --config requires a path argument");
                    std::process::exit(1);
                }
            }
            "--format" | "-f" => {
                if i + 1 < args.len() {
                    match args[i + 1].parse::<ExportFormat>() {
                        Ok(f) => format = Some(f),
                        Err(e) => {
                            eprintln!("Error: {}", e);
                            std::process::exit(1);
                        }
                    }
                    i += 1;
                } else {
                    eprintln!("Error: --format requires json or csv");
                    std::process::exit(1);
                }
            }
            arg if arg.starts_with('-') => {
                eprintln!("Unknown argument: {}", arg);
                print_help();
                std::process::exit(1);
            }
            arg => positional.push(arg.to_string()),
        }
        i += 1;
    }

    let mut positional = positional.into_iter();
    let command = match positional.next().as_deref() {
        None | Some("run") => Command::Run {
            boards: positional.collect(),
        },
        Some("reset-failed") => match positional.next() {
            Some(pin_id) => Command::ResetFailed { pin_id },
            None => {
                eprintln!("Error: reset-failed requires a PIN_ID");
                std::process::exit(1);
            }
        },
        Some("stats") => Command::Stats,
        Some("last-report") => Command::LastReport,
        Some("export") => match positional.next() {
            Some(path) => Command::Export {
                path: PathBuf::from(path),
                format,
            },
            None => {
                eprintln!("Error: export requires an output PATH");
                std::process::exit(1);
            }
        },
        Some(other) => {
            eprintln!("Unknown command: {}", other);
            print_help();
            std::process::exit(1);
        }
    };

    Args {
        command,
        config_path,
        verbose,
    }
}

fn print_help() {
    println!(
        r#"pinharvest - Crawl boards into a deduplicated, labeled image corpus

USAGE:
    pinharvest [OPTIONS] [COMMAND]

COMMANDS:
    run [BOARD_URL...]      Crawl, download and label (default; boards from config if none given)
    reset-failed PIN_ID     Make a permanently failed pin eligible for download again
    stats                   Show per-board totals
    export PATH             Write labeled pins as a training dataset
    last-report             Show the most recent run report as JSON

OPTIONS:
    --config, -c PATH       Path to config file
    --format, -f FORMAT     Export format: json or csv (default: from PATH extension)
    --verbose, -v           Log to stderr instead of the journal
    --version, -V           Show version
    --help, -h              Show this help message

ENVIRONMENT:
    PINHARVEST_CONFIG       Path to config file (overrides default location)
    PINHARVEST_LOG          Log filter (trace, debug, info, warn, error)
    PINHARVEST_API_KEY      Vision provider API key
    PINHARVEST_EMAIL        Login email for boards behind an auth wall
    PINHARVEST_PASSWORD     Login password

Config file location: $XDG_CONFIG_HOME/pinharvest/config.toml"#
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args();

    let _ = logging::init(Some(Config::config_dir().join("logs")), args.verbose);

    let config = match &args.config_path {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    match args.command {
        Command::Run { boards } => run(config, boards).await,
        Command::ResetFailed { pin_id } => {
            let store = Store::open_initialized(&config.database.sqlite_path)?;
            let reset = store.reset_failed(&pin_id)?;
            if reset == 0 {
                println!("No failed pin with id {}", pin_id);
            } else {
                println!("Reset {} pin(s) with id {}", reset, pin_id);
            }
            Ok(())
        }
        Command::Stats => {
            let store = Store::open_initialized(&config.database.sqlite_path)?;
            let stats = store.board_stats()?;
            if stats.is_empty() {
                println!("No boards crawled yet");
            }
            for board in stats {
                println!(
                    "{} ({})\n  pins: {}  downloaded: {}  labeled: {}  failed: {}  last crawled: {}",
                    board.display_name,
                    board.url,
                    board.pins,
                    board.downloaded,
                    board.labeled,
                    board.failed,
                    board.last_crawled_at.as_deref().unwrap_or("never"),
                );
            }
            Ok(())
        }
        Command::Export { path, format } => {
            let store = Store::open_initialized(&config.database.sqlite_path)?;
            let format = format.unwrap_or_else(|| ExportFormat::from_path(&path));
            let count = export_dataset(&store, &path, format)
                .with_context(|| format!("Failed to export to {}", path.display()))?;
            println!("Exported {} labeled pins to {}", count, path.display());
            Ok(())
        }
        Command::LastReport => {
            let store = Store::open_initialized(&config.database.sqlite_path)?;
            match store.latest_run_report()? {
                Some(report) => println!("{}", serde_json::to_string_pretty(&report)?),
                None => println!("No runs recorded yet"),
            }
            Ok(())
        }
    }
}

async fn run(config: Config, board_urls: Vec<String>) -> Result<()> {
    let limits = config.validate()?;

    let boards: Vec<BoardSource> = if board_urls.is_empty() {
        config.boards.clone()
    } else {
        board_urls.into_iter().map(BoardSource::new).collect()
    };
    if boards.is_empty() {
        bail!("No boards to crawl: pass BOARD_URL arguments or add [[boards]] to the config");
    }

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, finishing in-flight work");
                stop.store(true, Ordering::SeqCst);
            }
        });
    }

    let pipeline = Pipeline::from_config(&config, &limits, stop);
    info!(boards = boards.len(), "Run starting");

    let report = tokio::task::spawn_blocking(move || pipeline.run(&boards, &limits)).await?;
    println!("{}", report);

    if let Some(fatal) = report.fatal {
        bail!("Run aborted: {}", fatal);
    }
    Ok(())
}
