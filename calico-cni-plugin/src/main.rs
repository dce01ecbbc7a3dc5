use std::io::Read;
use std::process::ExitCode;

use clap::Parser;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use calico_cni_plugin::add::add;
use calico_cni_plugin::check::check;
use calico_cni_plugin::config::{Args, Command};
use calico_cni_plugin::delete::delete;
use calico_cni_plugin::types::Input;
use calico_cni_plugin::version::version;
use calico_cni_plugin::{Error, Result, CNI_VERSION};

fn main() -> ExitCode {
    let args = Args::parse();

    if args.command == Command::Version {
        return version().write_out();
    }

    let input = match read_input() {
        Ok(input) => input,
        Err(e) => return e.into_response(CNI_VERSION).write_out(),
    };
    let _guard = setup_logging(input.conf.log_level.as_deref());

    let resp = match args.command {
        Command::Add => add(&args, input),
        Command::Delete => delete(&args, input),
        Command::Check => check(&args, input),
        Command::Version => unreachable!("handled above"),
    };
    resp.write_out()
}

fn read_input() -> Result<Input> {
    let mut buf = String::new();
    std::io::stdin().read_to_string(&mut buf)?;
    if buf.trim().is_empty() {
        return Err(Error::InvalidNetworkConfig(
            "no network config on stdin".into(),
        ));
    }
    Input::from_json(&buf)
}

/// Logs go to stderr for the runtime to collect, and best-effort to a
/// rolling file for debugging after the process is gone.
fn setup_logging(log_level: Option<&str>) -> Option<WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| match log_level.unwrap_or("warn").to_ascii_lowercase().as_str() {
            "debug" => "debug".into(),
            "info" => "info".into(),
            _ => "warn".into(),
        });

    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    if std::fs::create_dir_all("/var/log/calico/cni").is_ok() {
        let file_appender = tracing_appender::rolling::daily("/var/log/calico/cni", "cni.log");
        let (nonblocking, guard) = tracing_appender::non_blocking(file_appender);
        tracing_subscriber::registry()
            .with(filter)
            .with(stderr_layer)
            .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(nonblocking))
            .init();
        Some(guard)
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(stderr_layer)
            .init();
        None
    }
}
