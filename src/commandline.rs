use crate::mqtt;
use clap::{Parser, Subcommand};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use std::path::PathBuf;
use std::time::Duration;
use ubms_lib::protocol::OperatingMode;

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// Run the handshake only and show identity and module counts
    Probe,
    /// Connect to the battery, keep the mode command alive and publish the battery state
    Daemon {
        /// Output destination for the battery state
        #[command(subcommand)]
        output: DaemonOutput,
        /// Interval for publishing the battery state (e.g., "1s", "10s")
        #[clap(long, value_parser = humantime::parse_duration, default_value = "1s")]
        interval: Duration,
    },
}

#[derive(clap::ValueEnum, Debug, Clone, PartialEq)]
pub enum MqttFormat {
    Simple,
    Json,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum DaemonOutput {
    /// Print the battery state to the standard output (console).
    Console,
    /// Publish the battery state to an MQTT broker and accept mode changes on `<topic>/Mode/set`.
    Mqtt {
        /// The configuration file for the MQTT broker
        #[arg(long, default_value_t = mqtt::MqttConfig::DEFAULT_CONFIG_FILE.to_string())]
        config_file: String,
        /// Output format for MQTT messages
        #[arg(long, value_enum, default_value_t = MqttFormat::Simple)]
        format: MqttFormat,
    },
}

#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitialMode {
    Standby,
    Charge,
    Drive,
}

impl From<InitialMode> for OperatingMode {
    fn from(mode: InitialMode) -> Self {
        match mode {
            InitialMode::Standby => OperatingMode::Standby,
            InitialMode::Charge => OperatingMode::Charge,
            InitialMode::Drive => OperatingMode::Drive,
        }
    }
}

const fn about_text() -> &'static str {
    "Valence U-BMS command line tool"
}

#[derive(Parser, Debug)]
#[command(version, about=about_text(), long_about = None)]
pub struct CliArgs {
    #[command(flatten)]
    pub verbose: Verbosity<InfoLevel>,

    /// SocketCAN interface the U-BMS is connected to
    #[arg(short, long, default_value = "can0")]
    pub interface: String,

    #[command(subcommand)]
    pub command: CliCommands,

    /// Installed capacity in Ah
    #[arg(long, default_value_t = 550.0)]
    pub capacity: f32,

    /// Maximum charge voltage in V, checked against the battery during the handshake
    #[arg(long, default_value_t = 14.5)]
    pub voltage: f32,

    /// Maximum number of modules
    #[arg(long, default_value_t = ubms_lib::protocol::MAX_MODULES)]
    pub modules: usize,

    /// Number of modules in series
    #[arg(long, default_value_t = 2)]
    pub series: usize,

    /// Settings file keeping the history across restarts, kept in memory if not given
    #[arg(long)]
    pub settings: Option<PathBuf>,

    /// Retransmission period of the mode command (e.g., "500ms", "1s")
    #[arg(value_parser = humantime::parse_duration, long, default_value = "1s")]
    pub keep_alive: Duration,

    /// Time to wait for the battery during the handshake
    #[arg(value_parser = humantime::parse_duration, long, default_value = "10s")]
    pub handshake_timeout: Duration,

    /// Upper bound of a single receive attempt
    #[arg(value_parser = humantime::parse_duration, long, default_value = "1s")]
    pub poll_timeout: Duration,

    /// Number of handshake retries before giving up
    #[arg(long, default_value = "0")]
    pub handshake_retries: u32,

    /// Operating mode commanded once connected
    #[arg(long, value_enum, default_value_t = InitialMode::Standby)]
    pub initial_mode: InitialMode,
}
