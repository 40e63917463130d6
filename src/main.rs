//! Purpose: `lookaside` CLI entry point and command dispatch.
//! Role: Binary crate root; parses args, runs commands, emits JSON on stdout.
//! Invariants: Errors are emitted as JSON on stderr.
//! Invariants: Process exit code is derived from `api::to_exit_code`.
//! Invariants: All table access goes through `api::Connection` or `api::FileBackend`.
#![allow(clippy::result_large_err)]
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Instant;

use clap::{Parser, Subcommand, ValueHint, error::ErrorKind as ClapErrorKind};
use serde_json::{Value, json};
use tracing_subscriber::EnvFilter;

mod table_paths;

use lookaside::api::{
    Connection, ConnectionConfig, Error, ErrorKind, FileBackend, LookasideValue, StorageBackend,
    TableCursor, inspect_table, to_exit_code,
};
use table_paths::default_table_dir;

#[derive(Parser, Debug)]
#[command(
    name = "lookaside",
    version,
    about = "Manage and exercise the lookaside store that parks evicted record versions"
)]
struct Cli {
    #[arg(
        long,
        help = "Directory holding table files (default: ~/.lookaside/tables)",
        value_hint = ValueHint::DirPath
    )]
    dir: Option<PathBuf>,
    #[arg(long, help = "JSON connection config file", value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the lookaside store, report it, then tear it down.
    Warm,
    /// Describe a table file left on disk.
    Inspect {
        #[arg(help = "Table file name (default: configured lookaside table)")]
        table: Option<String>,
    },
    /// Force-drop a table, e.g. a stale lookaside table after a crash.
    Drop {
        #[arg(help = "Table file name (default: configured lookaside table)")]
        table: Option<String>,
    },
    /// Borrow the lookaside cursor from many threads and report totals.
    Stress {
        #[arg(long, default_value_t = 4, help = "Concurrent borrowers")]
        workers: usize,
        #[arg(long, default_value_t = 100, help = "Borrow cycles per worker")]
        ops: usize,
        #[arg(long, default_value_t = 64, help = "Payload bytes per record")]
        payload: usize,
    },
}

fn main() {
    init_tracing();
    let exit_code = match run() {
        Ok(()) => 0,
        Err(err) => {
            emit_error(&err);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn run() -> Result<(), Error> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp | ClapErrorKind::DisplayVersion => {
                err.print().map_err(|io_err| {
                    Error::new(ErrorKind::Io)
                        .with_message("failed to write help")
                        .with_source(io_err)
                })?;
                return Ok(());
            }
            _ => {
                return Err(Error::new(ErrorKind::Usage).with_message(err.to_string().trim().to_string()));
            }
        },
    };

    let dir = cli.dir.unwrap_or_else(default_table_dir);
    let config = match &cli.config {
        Some(path) => ConnectionConfig::from_json_file(path)?,
        None => ConnectionConfig::default(),
    };

    let output = match cli.command {
        Command::Warm => warm(&dir, config)?,
        Command::Inspect { table } => {
            let name = table.unwrap_or(config.lookaside.table_name);
            let path = FileBackend::new(&dir).table_path(&name)?;
            serde_json::to_value(inspect_table(&path)?).map_err(encode_error)?
        }
        Command::Drop { table } => {
            let name = table.unwrap_or(config.lookaside.table_name);
            FileBackend::new(&dir).drop_table(&name, true)?;
            json!({ "dropped": name })
        }
        Command::Stress {
            workers,
            ops,
            payload,
        } => stress(&dir, config, workers, ops, payload)?,
    };
    emit_json(&output)
}

fn ensure_dir(dir: &Path) -> Result<(), Error> {
    std::fs::create_dir_all(dir).map_err(|err| {
        Error::new(ErrorKind::Io)
            .with_message("failed to create table directory")
            .with_path(dir)
            .with_source(err)
    })
}

fn warm(dir: &Path, config: ConnectionConfig) -> Result<Value, Error> {
    ensure_dir(dir)?;
    let connection = Connection::open(FileBackend::new(dir), config)?;
    connection.lookaside().create()?;
    let table = connection.backend().table_path(connection.lookaside().table_name())?;
    let info = inspect_table(&table)?;
    let stats = connection.stats();
    connection.close()?;
    Ok(json!({
        "table": info,
        "stats": stats,
    }))
}

fn stress(
    dir: &Path,
    config: ConnectionConfig,
    workers: usize,
    ops: usize,
    payload: usize,
) -> Result<Value, Error> {
    if workers == 0 {
        return Err(Error::new(ErrorKind::Usage).with_message("--workers must be at least 1"));
    }
    ensure_dir(dir)?;
    let connection = Connection::open(FileBackend::new(dir), config)?;
    let started = Instant::now();

    let borrowed = thread::scope(|scope| {
        let handles: Vec<_> = (0..workers)
            .map(|worker| {
                let connection = &connection;
                scope.spawn(move || stress_worker(connection, worker, ops, payload))
            })
            .collect();
        let mut total = 0u64;
        for handle in handles {
            total += handle.join().map_err(|_| {
                Error::new(ErrorKind::Internal).with_message("stress worker panicked")
            })??;
        }
        Ok::<u64, Error>(total)
    })?;
    let elapsed_ms = started.elapsed().as_millis() as u64;

    let mut session = connection.open_session("stress-report");
    let cursor = connection.lookaside_cursor(&mut session)?;
    let records = cursor.len();
    cursor.release()?;

    let stats = connection.stats();
    connection.close()?;
    Ok(json!({
        "workers": workers,
        "ops": ops,
        "borrows": borrowed,
        "records": records,
        "elapsed_ms": elapsed_ms,
        "stats": stats,
    }))
}

fn stress_worker(
    connection: &Connection<FileBackend>,
    worker: usize,
    ops: usize,
    payload: usize,
) -> Result<u64, Error> {
    let mut session = connection.open_session(format!("stress-{worker}"));
    let body = vec![(worker % 251) as u8; payload];
    for op in 0..ops {
        let key = format!("w{worker}/k{op}").into_bytes();
        let mut cursor = connection.lookaside_cursor(&mut session)?;
        cursor.insert(&key, &LookasideValue::new(op as u64, worker as u32, body.clone()))?;
        if cursor.search(&key)?.is_none() {
            return Err(Error::new(ErrorKind::Internal).with_message("inserted record is missing"));
        }
        if op % 2 == 1 {
            cursor.remove(&key)?;
        }
        cursor.release()?;
    }
    Ok(ops as u64)
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

fn encode_error(err: serde_json::Error) -> Error {
    Error::new(ErrorKind::Internal)
        .with_message("json encode failed")
        .with_source(err)
}

fn emit_json(value: &Value) -> Result<(), Error> {
    let json = serde_json::to_string_pretty(value).map_err(encode_error)?;
    println!("{json}");
    Ok(())
}

fn error_message(err: &Error) -> String {
    if let Some(message) = err.message() {
        return message.to_string();
    }
    match err.kind() {
        ErrorKind::Internal => "internal error".to_string(),
        ErrorKind::Usage => "usage error".to_string(),
        ErrorKind::NotFound => "not found".to_string(),
        ErrorKind::AlreadyExists => "already exists".to_string(),
        ErrorKind::Busy => "resource is busy".to_string(),
        ErrorKind::Permission => "permission denied".to_string(),
        ErrorKind::Corrupt => "corrupt data".to_string(),
        ErrorKind::Io => "i/o error".to_string(),
    }
}

fn emit_error(err: &Error) {
    let mut body = json!({
        "kind": format!("{:?}", err.kind()),
        "message": error_message(err),
    });
    if let Some(table) = err.table() {
        body["table"] = json!(table);
    }
    let json = serde_json::to_string(&json!({ "error": body })).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}
