use crate::mqtt;
use canbms_lib::config::ChargerConfig;
use clap::{Parser, Subcommand};
use clap_verbosity_flag::{InfoLevel, Verbosity};

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// Decode a single frame and show its values and flag bits
    Decode {
        /// CAN id, decimal or hex with 0x prefix (e.g. 0x356)
        #[arg(value_parser = clap_num::maybe_hex::<u16>)]
        id: u16,
        /// Payload as hex bytes (e.g. "64140A009600" or "64 14 0A 00 96 00")
        payload: String,
    },
    /// Feed a `candump -L` log through the charger and output what it publishes
    Replay {
        /// Charger configuration file
        #[arg(long, short, default_value_t = ChargerConfig::DEFAULT_CONFIG_FILE.to_string())]
        config: String,
        /// Log file written by `candump -L`
        log_file: String,
        /// Output destination for published values
        #[command(subcommand)]
        output: DaemonOutput,
    },
    /// Run the charger on SocketCAN interfaces
    Run {
        /// Charger configuration file
        #[arg(long, short, default_value_t = ChargerConfig::DEFAULT_CONFIG_FILE.to_string())]
        config: String,
        /// Interface of the inverter bus, every battery needs an interface of its own
        #[arg(long, short, default_value = "can0")]
        interface: String,
        /// Output destination for published values
        #[command(subcommand)]
        output: DaemonOutput,
    },
}

#[derive(clap::ValueEnum, Debug, Clone, PartialEq)]
pub enum MqttFormat {
    Simple,
    Json,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum DaemonOutput {
    /// Print published values to the standard output (console).
    Console,
    /// Publish values to an MQTT broker.
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
    "CAN bus BMS decoder and multi battery charger"
}

#[derive(Parser, Debug)]
#[command(version, about=about_text(), long_about = None)]
pub struct CliArgs {
    #[command(flatten)]
    pub verbose: Verbosity<InfoLevel>,

    #[command(subcommand)]
    pub command: CliCommands,
}
