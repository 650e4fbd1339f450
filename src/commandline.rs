use crate::mqtt;
use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use dalybms_ble::{Command, DeviceAddress};
use std::time::Duration;

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// Show general BMS status: cell count, temperature sensors, charger/load status, cycles
    Status,
    /// Show total voltage, current, and State of Charge (SOC)
    Soc,
    /// Show MOSFET status: mode, charge/discharge state, capacity, and BMS cycles
    Mosfet,
    /// Show highest/lowest cell voltage and corresponding cell number
    VoltageRange,
    /// Show highest/lowest temperature and corresponding sensor number
    TemperatureRange,
    /// Show individual cell voltages (fetches the BMS status first)
    CellVoltages,
    /// Show individual temperature sensor readings (fetches the BMS status first)
    CellTemperatures,
    /// Show cell balancing status
    Balancing,
    /// Show current BMS error codes
    Errors,
    /// Show rated capacity and nominal cell voltage
    Rated,
    /// Show cell, pack, current and difference alarm thresholds
    Alarms,
    /// Show balancing start voltage and acceptable difference
    BalanceSettings,
    /// Show short circuit shutdown current and sampling resistance
    ShortCircuit,
    /// Show software and hardware version
    Version,
    /// Show all available BMS information
    All,
    /// Run in daemon mode, periodically fetching and outputting metrics
    Daemon {
        /// Output destination for metrics
        #[command(subcommand)]
        output: DaemonOutput,
        /// Interval for fetching metrics (e.g., "10s", "1m")
        #[clap(long, short, value_parser = humantime::parse_duration, default_value = "10s")]
        interval: Duration,
        /// Comma-separated list of metrics to fetch (e.g., status,soc,cell-voltages or all)
        #[clap(long, short, use_value_delimiter = true, default_value = "status,soc")]
        metrics: Vec<String>,
    },
}

impl CliCommands {
    /// Commands polled for this subcommand.
    pub fn commands(&self) -> Result<Vec<Command>> {
        let commands = match self {
            CliCommands::Status => vec![Command::Status],
            CliCommands::Soc => vec![Command::Soc],
            CliCommands::Mosfet => vec![Command::MosfetStatus],
            CliCommands::VoltageRange => vec![Command::CellVoltageRange],
            CliCommands::TemperatureRange => vec![Command::TemperatureRange],
            CliCommands::CellVoltages => vec![Command::CellVoltages],
            CliCommands::CellTemperatures => vec![Command::CellTemperatures],
            CliCommands::Balancing => vec![Command::CellBalanceState],
            CliCommands::Errors => vec![Command::ErrorCode],
            CliCommands::Rated => vec![Command::RatedNominals],
            CliCommands::Alarms => vec![
                Command::CellAlarmVoltages,
                Command::PackAlarmVoltages,
                Command::LoadChargeAlarms,
                Command::DifferenceAlarms,
            ],
            CliCommands::BalanceSettings => vec![Command::BalanceSettings],
            CliCommands::ShortCircuit => vec![Command::ShortCircuitShutdown],
            CliCommands::Version => vec![Command::SoftwareVersion, Command::HardwareVersion],
            CliCommands::All => Command::ALL.to_vec(),
            CliCommands::Daemon { metrics, .. } => parse_metrics(metrics)?,
        };
        Ok(commands)
    }
}

/// Resolves metric names to commands, `all` selects every command.
pub fn parse_metrics(metrics: &[String]) -> Result<Vec<Command>> {
    let mut commands = Vec::new();
    for metric in metrics {
        let metric = metric.trim();
        if metric == "all" {
            return Ok(Command::ALL.to_vec());
        }
        let Ok(command) = metric.parse::<Command>() else {
            bail!("Unknown metric name '{metric}'");
        };
        if !commands.contains(&command) {
            commands.push(command);
        }
    }
    if commands.is_empty() {
        bail!("No metrics selected");
    }
    Ok(commands)
}

#[derive(clap::ValueEnum, Debug, Clone, PartialEq)]
pub enum MqttFormat {
    Simple,
    Json,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum DaemonOutput {
    /// Continuously read metrics and print them to the standard output (console).
    Console,
    /// Continuously read metrics and publish them to an MQTT broker.
    Mqtt {
        /// The configuration file for the MQTT broker
        #[arg(long, default_value_t = mqtt::MqttConfig::DEFAULT_CONFIG_FILE.to_string())]
        config_file: String,
        /// Output format for MQTT messages
        #[arg(long, value_enum, default_value_t = MqttFormat::Simple)]
        format: MqttFormat,
    },
}

const fn about_text() -> &'static str {
    "daly bms bluetooth command line tool"
}

#[derive(Parser, Debug)]
#[command(version, about=about_text(), long_about = None)]
pub struct CliArgs {
    #[command(flatten)]
    pub verbose: Verbosity<InfoLevel>,

    /// Bluetooth address of the BMS (e.g., 17:71:06:02:0B:7E), repeat for several devices
    #[arg(short, long, required = true)]
    pub device: Vec<DeviceAddress>,

    #[command(subcommand)]
    pub command: CliCommands,

    /// Time to wait for a complete reply (e.g., "500ms", "5s")
    #[arg(value_parser = humantime::parse_duration, long, default_value = "5s")]
    pub timeout: Duration,

    /// Time to wait for discovery and connection of a device
    #[arg(value_parser = humantime::parse_duration, long, default_value = "15s")]
    pub connect_timeout: Duration,

    /// Number of consecutive failures before reconnecting
    #[arg(long, default_value = "3")]
    pub retries: u32,

    /// Inactivity after which the BMS is expected to sleep (e.g., "1h")
    #[arg(value_parser = humantime::parse_duration, long, default_value = "1h")]
    pub sleep_after: Duration,
}
