//! Coriolis OVM exporter: exports differential VM disk snapshots over an
//! authenticated HTTPS API.

use std::path::PathBuf;

use clap::Parser;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::FmtSubscriber;

use coriolis_ovm_exporter::{Config, ExporterServer, DEFAULT_CONFIG_FILE};

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "coriolis-ovm-exporter")]
#[command(about = "Exports differential snapshots of OVM virtual machine disks")]
#[command(version)]
struct Args {
    /// Exporter config file.
    #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Enable debug logging.
    #[arg(long, short = 'd')]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();

    let config = Config::load(&args.config)?;

    let _log_guard = init_logging(&config, args.debug)?;

    let server = ExporterServer::new(config)?;
    server.run().await
}

/// Sets up the tracing subscriber. When a log file is configured, output
/// goes to a rolling file sink; the returned guard must stay alive for
/// the non-blocking writer to flush.
fn init_logging(
    config: &Config,
    debug: bool,
) -> Result<Option<WorkerGuard>, Box<dyn std::error::Error + Send + Sync>> {
    let log_level = if debug { Level::DEBUG } else { Level::INFO };

    let builder = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact();

    match &config.log_file {
        Some(log_file) => {
            let dir = log_file.parent().unwrap_or_else(|| std::path::Path::new("."));
            std::fs::create_dir_all(dir)?;
            let file_name = log_file
                .file_name()
                .ok_or("log_file must name a file")?
                .to_os_string();
            let appender = tracing_appender::rolling::daily(dir, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let subscriber = builder.with_writer(writer).with_ansi(false).finish();
            tracing::subscriber::set_global_default(subscriber)?;
            Ok(Some(guard))
        }
        None => {
            let subscriber = builder.finish();
            tracing::subscriber::set_global_default(subscriber)?;
            Ok(None)
        }
    }
}
