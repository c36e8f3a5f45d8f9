//! Demo worker: calls the host once per `name=argument` argument and prints
//! each result on its own line.

use std::ffi::OsString;
use std::process;

use anyhow::Context;
use hostcall::connect_from_env;
use hostcall::logging::init_tracing;

const USAGE: &str = "Usage: hostcall-worker [<name>=<argument>]...";

fn main() {
    let args: Vec<OsString> = std::env::args_os().collect();

    let calls = match parse_args(&args) {
        Ok(v) => v,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("{USAGE}");
            eprintln!();
            eprintln!("Must be spawned by a hostcall host (reads HOSTCALL_CHANNEL).");
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

    if let Err(e) = runtime.block_on(run(calls)) {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn parse_args(args: &[OsString]) -> Result<Vec<(String, String)>, String> {
    let mut calls = Vec::new();
    for arg in args.iter().skip(1) {
        // Names and arguments travel as UTF-8 strings.
        let arg = arg
            .to_str()
            .ok_or_else(|| format!("argument is not valid UTF-8: {}", arg.to_string_lossy()))?;
        if arg == "--help" || arg == "-h" {
            return Err(String::new());
        }
        let (name, argument) = arg
            .split_once('=')
            .ok_or_else(|| format!("expected <name>=<argument>, got '{arg}'"))?;
        calls.push((name.to_string(), argument.to_string()));
    }
    Ok(calls)
}

async fn run(calls: Vec<(String, String)>) -> anyhow::Result<()> {
    let (session, mut caller) = connect_from_env().context("cannot connect to host")?;

    for (name, argument) in &calls {
        let result = caller.call(name, argument).await?;
        println!("{result}");
    }

    tracing::debug!(%session, calls = caller.calls(), "Worker done");
    // Dropping the caller closes our write end; the host sees end of stream.
    drop(caller);
    Ok(())
}
