use anyhow::{bail, Context, Result};
use clap::Parser;
use dalybms_ble::{
    Aggregator, BleTransport, Command, DeviceAddress, Session, SessionConfig, TelemetrySnapshot,
};
use flexi_logger::{Logger, LoggerHandle};
use log::*;
use std::{ops::Deref, panic};

mod commandline;
mod daemon;
mod mqtt;

use commandline::{CliArgs, CliCommands};

fn logging_init(loglevel: LevelFilter) -> Result<LoggerHandle> {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .with_context(|| "Cannot init logging")?
        .start()
        .with_context(|| "Cannot start logging")?;

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown>", 0, 0));
        let cause = panic_info
            .payload()
            .downcast_ref::<String>()
            .map(String::deref);
        let cause = cause.unwrap_or_else(|| {
            panic_info
                .payload()
                .downcast_ref::<&str>()
                .copied()
                .unwrap_or("<cause unknown>")
        });

        error!(
            "Thread '{}' panicked at {}:{}:{}: {}",
            std::thread::current().name().unwrap_or("<unknown>"),
            filename,
            line,
            column,
            cause
        );
    }));
    Ok(log_handle)
}

fn session_config(args: &CliArgs, device: DeviceAddress, commands: Vec<Command>) -> SessionConfig {
    SessionConfig {
        commands,
        response_timeout: args.timeout,
        connect_timeout: args.connect_timeout,
        max_consecutive_failures: args.retries,
        sleep_after: args.sleep_after,
        ..SessionConfig::new(device)
    }
}

/// Connects, polls `commands` once and disconnects again.
async fn fetch_once(config: SessionConfig, retries: u32) -> Result<TelemetrySnapshot> {
    let device = config.address;
    let mut session = Session::new(BleTransport::new(), config)
        .with_context(|| format!("Invalid session settings for {device}"))?;

    let attempts = retries.max(1);
    for attempt in 1..=attempts {
        match session.connect().await {
            Ok(()) => break,
            Err(err) if attempt < attempts => {
                trace!("Failed try {attempt} of {attempts}: {err}");
                tokio::time::sleep(session.reconnect_delay()).await;
            }
            Err(err) => return Err(err).with_context(|| format!("Cannot connect to {device}")),
        }
    }

    let mut aggregator = Aggregator::new();
    let report = session.poll(&mut aggregator).await;
    debug!("{device}: {report:?}, {:?}", session.statistics());
    session.close().await;

    if report.failed > 0 {
        warn!(
            "{device}: {} of {} commands failed, last error: {}",
            report.failed,
            report.failed + report.succeeded,
            session.statistics().last_error.unwrap_or_default()
        );
    }
    match aggregator.snapshot(&device) {
        Some(snapshot) if report.succeeded > 0 => Ok(snapshot),
        _ => bail!(
            "No data received from {device}: {}",
            session.statistics().last_error.unwrap_or_default()
        ),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    let _log_handle = logging_init(args.verbose.log_level_filter())?;

    let commands = args.command.commands()?;

    match &args.command {
        CliCommands::Daemon {
            output, interval, ..
        } => {
            daemon::run(
                args.device.clone(),
                output.clone(),
                *interval,
                commands,
                |device, commands| session_config(&args, device, commands),
            )
            .await?
        }
        _ => {
            for device in &args.device {
                let config = session_config(&args, *device, commands.clone());
                let snapshot = fetch_once(config, args.retries).await?;
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
            }
        }
    }

    Ok(())
}
