//! Tracing setup shared by the host and worker binaries.
//!
//! - `RUST_LOG` wins when set.
//! - Otherwise `HOSTCALL_LOG` picks the level (`debug`, `info`, `warn`, `error`).
//! - `LOG_FORMAT=json` switches to JSON lines.
//!
//! Output always goes to stderr: the worker's stdout may be someone's data.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub const LOG_LEVEL_ENV: &str = "HOSTCALL_LOG";
pub const LOG_FORMAT_ENV: &str = "LOG_FORMAT";

fn filter_directive(level: Option<&str>) -> String {
    let level = match level {
        Some("trace") => "trace",
        Some("debug") => "debug",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    };
    format!("hostcall={level},hostcall_host={level},hostcall_worker={level}")
}

pub fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = std::env::var(LOG_LEVEL_ENV).ok();
        EnvFilter::new(filter_directive(level.as_deref()))
    };

    let use_json = std::env::var(LOG_FORMAT_ENV).as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_level_falls_back_to_info() {
        insta::assert_snapshot!(
            filter_directive(Some("loud")),
            @"hostcall=info,hostcall_host=info,hostcall_worker=info"
        );
        assert_eq!(filter_directive(None), filter_directive(Some("info")));
    }

    #[test]
    fn warning_is_an_alias_for_warn() {
        assert_eq!(filter_directive(Some("warning")), filter_directive(Some("warn")));
        assert!(filter_directive(Some("debug")).starts_with("hostcall=debug"));
    }
}
