use clap::{Parser, Subcommand};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use jkbms_lib::protocol::Switch;
use std::time::Duration;

fn default_device_name() -> String {
    if cfg!(target_os = "windows") {
        String::from("COM1")
    } else {
        String::from("/dev/ttyUSB0")
    }
}

fn parse_switch(s: &str) -> Result<Switch, String> {
    s.parse()
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// Listen to a single BMS that streams frames on its own, printing records as JSON lines
    Listen,
    /// Poll one or more BMS units as bus master, printing records as JSON lines
    Poll {
        /// Comma-separated list of slave addresses to poll (e.g., 1,2,3)
        #[clap(long, short, use_value_delimiter = true, default_value = "1")]
        addresses: Vec<u8>,
        /// Stop after this many records, 0 for unlimited
        #[clap(long, short, default_value = "0")]
        count: u64,
    },
    /// Enable or disable one switch on a BMS, wait for the acknowledgement, and exit
    SetSwitch {
        /// Slave address of the BMS
        #[clap(long, short, default_value = "1")]
        address: u8,
        /// The switch to drive: charge, discharge, balance, float_charge, heating, display
        #[clap(value_parser = parse_switch)]
        switch: Switch,
        /// Enable the switch. If this flag is not present, it will be disabled.
        #[clap(long, short, action)]
        enable: bool,
    },
}

const fn about_text() -> &'static str {
    "JK-BMS command line tool"
}

#[derive(Parser, Debug)]
#[command(version, about=about_text(), long_about = None)]
pub struct CliArgs {
    #[command(flatten)]
    pub verbose: Verbosity<InfoLevel>,

    /// Serial port device path (e.g., /dev/ttyUSB0 on Linux, COM1 on Windows)
    #[arg(short, long, default_value_t = default_device_name())]
    pub device: String,

    /// Baud rate of the serial port
    #[arg(short, long, default_value = "115200")]
    pub baud_rate: u32,

    #[command(subcommand)]
    pub command: CliCommands,

    /// Budget for one request/response exchange (e.g., "500ms", "1s")
    #[arg(value_parser = humantime::parse_duration, long, default_value = "500ms")]
    pub timeout: Duration,

    // RS-485 dongles need a moment to switch between TX and RX
    /// Quiet time between exchanges on the bus (e.g., "50ms", "100ms")
    #[arg(value_parser = humantime::parse_duration, long, default_value = "100ms")]
    pub delay: Duration,

    /// Poll device settings every n-th cycle
    #[arg(long, default_value = "6")]
    pub settings_period: u32,

    /// Poll device info every n-th cycle
    #[arg(long, default_value = "720")]
    pub device_info_period: u32,

    /// Consecutive failed exchanges before giving up on the bus
    #[arg(long, default_value = "800")]
    pub max_errors: u32,
}
