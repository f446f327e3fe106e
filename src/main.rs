//! MQTT Sampler - Load-test an MQTT broker
//!
//! Runs a number of virtual users that each publish to, or subscribe to, a
//! broker for a number of iterations and reports per-sample results.
//!
//! # Exit Codes
//!
//! | Code | Meaning |
//! |------|---------|
//! | 0 | Success (including graceful shutdown) |
//! | 1 | Configuration/argument error |
//! | 2 | Connection/authentication error |
//! | 4 | Failed samples or runtime error |

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};

use mqtt_sampler::cli::Args;
use mqtt_sampler::error::MqttSamplerError;
use mqtt_sampler::logging;
use mqtt_sampler::runner::{LoadRunner, RunSummary};
use mqtt_sampler::sampler::{InterruptFlag, SampleResult};

/// Exit code for successful execution
const EXIT_SUCCESS: u8 = 0;
/// Exit code for configuration/argument errors
const EXIT_CONFIG_ERROR: u8 = 1;
/// Exit code for connection/authentication errors
const EXIT_CONNECTION_ERROR: u8 = 2;
/// Exit code for failed samples and runtime errors
const EXIT_RUNTIME_ERROR: u8 = 4;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    if let Err(e) = args.validate() {
        eprintln!("Error: Configuration error: {}", e);
        eprintln!("  Hint: Use --help for usage information");
        return ExitCode::from(EXIT_CONFIG_ERROR);
    }
    logging::init(&args.log_level);

    match run(args).await {
        Ok(summary) if summary.is_success() => ExitCode::from(EXIT_SUCCESS),
        Ok(summary) if summary.interrupted && summary.failures == 0 => {
            ExitCode::from(EXIT_SUCCESS)
        }
        Ok(_) => ExitCode::from(EXIT_RUNTIME_ERROR),
        Err(e) => {
            error!("{}", e);
            ExitCode::from(error_to_exit_code(&e))
        }
    }
}

async fn run(args: Args) -> Result<RunSummary, MqttSamplerError> {
    let json = args.json;
    let plan = args.into_plan()?;

    let interrupt = InterruptFlag::new();
    let mut runner = LoadRunner::new(plan)?.with_interrupt(interrupt.clone());
    if json {
        runner = runner.with_observer(Arc::new(|result: &SampleResult| {
            match serde_json::to_string(result) {
                Ok(line) => println!("{}", line),
                Err(e) => warn!("Failed to serialize sample: {}", e),
            }
        }));
    }

    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!("Error setting up signal handler: {}", e);
            return;
        }
        interrupt.raise();
    });

    let summary = tokio::task::spawn_blocking(move || runner.run())
        .await
        .map_err(|e| MqttSamplerError::Io(std::io::Error::other(e)))??;

    report(&summary, json)?;
    Ok(summary)
}

/// Wait for SIGINT (Ctrl+C) or SIGTERM signals.
async fn wait_for_shutdown_signal() -> Result<(), MqttSamplerError> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt()).map_err(MqttSamplerError::Io)?;
        let mut sigterm = signal(SignalKind::terminate()).map_err(MqttSamplerError::Io)?;

        tokio::select! {
            _ = sigint.recv() => info!("Received SIGINT (Ctrl+C), stopping virtual users..."),
            _ = sigterm.recv() => info!("Received SIGTERM, stopping virtual users..."),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.map_err(MqttSamplerError::Io)?;
        info!("Received Ctrl+C, stopping virtual users...");
    }

    Ok(())
}

fn report(summary: &RunSummary, json: bool) -> Result<(), MqttSamplerError> {
    if json {
        println!("{}", serde_json::to_string(summary)?);
        return Ok(());
    }

    eprintln!("Mode:        {}", summary.mode);
    eprintln!("Users:       {}", summary.threads);
    eprintln!("Samples:     {}", summary.samples);
    eprintln!("Successes:   {}", summary.successes);
    eprintln!("Failures:    {}", summary.failures);
    eprintln!("Bytes:       {}", summary.bytes);
    eprintln!("Elapsed:     {:?}", summary.elapsed);
    if summary.aborted_users > 0 {
        eprintln!("Aborted users: {}", summary.aborted_users);
    }
    if summary.interrupted {
        eprintln!("Run was interrupted");
    }
    for e in &summary.teardown_errors {
        eprintln!("Teardown error: {}", e);
    }
    Ok(())
}

/// Convert an error to the appropriate exit code.
fn error_to_exit_code(error: &MqttSamplerError) -> u8 {
    match error {
        MqttSamplerError::InvalidArgument(_)
        | MqttSamplerError::InvalidClientId { .. }
        | MqttSamplerError::Json(_) => EXIT_CONFIG_ERROR,
        MqttSamplerError::Connection { .. }
        | MqttSamplerError::ConnectionRefused(_)
        | MqttSamplerError::Client(_)
        | MqttSamplerError::Tls(_) => EXIT_CONNECTION_ERROR,
        MqttSamplerError::Publish { .. }
        | MqttSamplerError::Subscribe { .. }
        | MqttSamplerError::Close { .. }
        | MqttSamplerError::TimeoutExceeded(_)
        | MqttSamplerError::Teardown(_)
        | MqttSamplerError::Io(_) => EXIT_RUNTIME_ERROR,
    }
}
