use clap::Parser;
use std::panic::{self, PanicHookInfo};
use switchbot_meter_bridge::app::{self, Options, RealScanner};
use switchbot_meter_bridge::output::mqtt::MqttSink;
use switchbot_meter_bridge::output::Offline;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Exit codes for the application
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_PANIC: i32 = 2;

/// `-v` forces debug output, otherwise `RUST_LOG` applies with `info` as the default.
fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Cancel `shutdown` on Ctrl-C so the current scan drains before exiting.
fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received interrupt, finishing current cycle");
                shutdown.cancel();
            }
            Err(e) => warn!("Failed to listen for interrupt signal: {}", e),
        }
    });
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    // Set up panic hook to ensure clean exit codes for process managers
    // (e.g., systemd) that monitor exit status
    panic::set_hook(Box::new(move |info: &PanicHookInfo| {
        eprintln!("Panic! {}", info);
        std::process::exit(EXIT_PANIC);
    }));

    let options = Options::parse();
    init_logging(options.verbose);

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    let mqtt_config = match options.mqtt_config() {
        Ok(config) => config,
        Err(why) => {
            error!("{}", why);
            std::process::exit(EXIT_ERROR);
        }
    };

    let result = match mqtt_config {
        Some(config) => {
            let mut sink = MqttSink::connect(&config);
            let result = app::run_with(&options, &RealScanner, &mut sink, shutdown).await;
            sink.shutdown().await;
            result
        }
        None => {
            warn!("No --mqtt-host given, readings will not be published");
            app::run_with(&options, &RealScanner, &mut Offline, shutdown).await
        }
    };

    match result {
        Ok(_) => std::process::exit(EXIT_SUCCESS),
        Err(why) => {
            error!("{}", why);
            std::process::exit(EXIT_ERROR);
        }
    }
}
