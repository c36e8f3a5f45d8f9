//! Demo host: registers `foo` and `bar`, spawns a worker and serves its calls.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process;

use anyhow::Context;
use hostcall::logging::init_tracing;
use hostcall::{HostConfig, OperationTable, spawn_worker};

const USAGE: &str = "Usage: hostcall-host [--worker <path>] [-- <worker args>...]";

fn main() {
    let args: Vec<OsString> = std::env::args_os().collect();

    let (worker, worker_args) = match parse_args(&args) {
        Ok(v) => v,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("{USAGE}");
            eprintln!();
            eprintln!("Options:");
            eprintln!("  --worker <path>  Worker executable [default: hostcall-worker next to this binary]");
            eprintln!();
            eprintln!("Arguments after -- are passed to the worker, e.g. foo=100 bar=x");
            process::exit(2);
        }
    };

    init_tracing();

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("error: failed to start runtime: {e}");
            process::exit(1);
        }
    };

    match runtime.block_on(run(worker, worker_args)) {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("error: {e:#}");
            process::exit(1);
        }
    }
}

/// Paths and worker arguments are passed through as-is, so they need not be
/// UTF-8.
fn parse_args(args: &[OsString]) -> Result<(PathBuf, Vec<OsString>), String> {
    let mut worker: Option<PathBuf> = None;
    let mut worker_args = Vec::new();

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].to_str() {
            Some("--worker") => {
                i += 1;
                worker = Some(PathBuf::from(
                    args.get(i).ok_or("--worker requires a value")?,
                ));
            }
            Some("--") => {
                worker_args.extend(args[i + 1..].iter().cloned());
                break;
            }
            Some("--help" | "-h") => return Err(String::new()),
            _ => {
                return Err(format!(
                    "unexpected argument: {}",
                    args[i].to_string_lossy()
                ));
            }
        }
        i += 1;
    }

    let worker = match worker {
        Some(path) => path,
        None => default_worker().ok_or("cannot locate hostcall-worker; pass --worker")?,
    };
    Ok((worker, worker_args))
}

fn default_worker() -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    Some(exe.with_file_name("hostcall-worker"))
}

fn operations() -> Result<OperationTable, hostcall::RegistryError> {
    OperationTable::builder()
        .register("foo", |arg| format!("Foo was called with arg {arg}"))
        .register("bar", |arg| format!("Bar was called with arg {arg}"))
        .build()
}

/// Returns the exit code to use: the worker's own, or 1 if it had none.
async fn run(worker: PathBuf, worker_args: Vec<OsString>) -> anyhow::Result<i32> {
    let table = operations()?;
    tracing::info!(operations = ?table.names(), "hostcall host {}", env!("CARGO_PKG_VERSION"));

    let config = HostConfig::new(&worker).with_args(worker_args);
    let mut session = spawn_worker(config)
        .await
        .with_context(|| format!("cannot start worker {}", worker.display()))?;

    session.serve(&table).await?;

    let status = session.wait().await?;
    if !status.success() {
        tracing::warn!(%status, "Worker exited unsuccessfully");
    }
    Ok(status.code().unwrap_or(1))
}
