use anyhow::{ensure, Context, Result};
use clap::Parser;
use flexi_logger::{Logger, LoggerHandle};
use log::*;
use std::{ops::Deref, panic, path::Path, sync::Arc};
use ubms_lib::handshake::{self, HandshakeResult, HandshakeTiming};
use ubms_lib::history::HistoryTracker;
use ubms_lib::mode::ModeController;
use ubms_lib::monitor::Monitor;
use ubms_lib::protocol::{OperatingMode, MAX_MODULES};
use ubms_lib::settings::{self, MemorySettings, SettingsStore, YamlSettings};
use ubms_lib::socketcan::SocketCanTransport;
use ubms_lib::state::{BatteryConfig, BatteryState};
use ubms_lib::transport::Transport;

mod commandline;
mod daemon;
mod mqtt;

use commandline::{CliArgs, CliCommands};

fn logging_init(loglevel: LevelFilter) -> LoggerHandle {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .expect("Cannot init logging")
        .start()
        .expect("Cannot start logging");

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
    log_handle
}

/// Runs the handshake, retrying timeouts with an increasing delay.
fn connect(
    transport: &dyn Transport,
    controller: &ModeController,
    battery: &mut BatteryState,
    timing: HandshakeTiming,
    mode: OperatingMode,
    retries: u32,
) -> Result<HandshakeResult> {
    let mut attempt = 0;
    loop {
        match handshake::connect(transport, controller, battery, timing, mode) {
            Ok(result) => return Ok(result),
            Err(ubms_lib::Error::HandshakeTimeout) if attempt < retries => {
                let delay = handshake::retry_backoff(attempt);
                attempt += 1;
                warn!("No battery detected, retry {attempt}/{retries} in {delay:?}");
                std::thread::sleep(delay);
            }
            Err(e) => return Err(e).with_context(|| "Battery handshake failed"),
        }
    }
}

fn open_settings(path: Option<&Path>) -> Result<Box<dyn SettingsStore>> {
    Ok(match path {
        Some(path) => Box::new(
            YamlSettings::open(path)
                .with_context(|| format!("Cannot open settings file {path:?}"))?,
        ),
        None => {
            info!("No settings file given, history is not kept across restarts");
            Box::new(MemorySettings::new())
        }
    })
}

fn main() -> Result<()> {
    let args = CliArgs::parse();

    let _log_handle = logging_init(args.verbose.log_level_filter());

    ensure!(
        (1..=MAX_MODULES).contains(&args.modules),
        "Module count must be between 1 and {MAX_MODULES}"
    );
    ensure!(
        (1..=args.modules).contains(&args.series),
        "Modules in series must be between 1 and {}",
        args.modules
    );

    let transport: Arc<dyn Transport> = Arc::new(
        SocketCanTransport::open(&args.interface)
            .with_context(|| format!("Cannot open CAN interface '{}'", args.interface))?,
    );
    let controller = Arc::new(ModeController::new(Arc::clone(&transport), args.keep_alive));
    let mut battery = BatteryState::new(BatteryConfig {
        capacity: args.capacity,
        max_charge_voltage: args.voltage,
        max_modules: args.modules,
        modules_in_series: args.series,
    });
    let timing = HandshakeTiming {
        poll_timeout: args.poll_timeout,
        timeout: args.handshake_timeout,
    };

    connect(
        transport.as_ref(),
        &controller,
        &mut battery,
        timing,
        args.initial_mode.into(),
        args.handshake_retries,
    )?;

    match args.command {
        CliCommands::Probe => {
            println!("Identity: {:?}", battery.identity);
            println!(
                "Modules: {} communicating, {} configured, {} balancing",
                battery.modules_communicating, battery.number_of_modules, battery.modules_balancing
            );
            println!("SOC: {}% Mode: {:#04X}", battery.soc, battery.mode);
        }
        CliCommands::Daemon { output, interval } => {
            let store = open_settings(args.settings.as_deref())?;
            let cycle_interval = settings::analytics_interval(store.as_ref());
            let history = HistoryTracker::load(store.as_ref(), f64::from(args.capacity));
            daemon::run(
                transport,
                controller,
                Monitor::new(battery, history),
                store,
                daemon::DaemonParams {
                    output,
                    timing: daemon::CycleTiming {
                        cycle_interval,
                        publish_interval: interval,
                        poll_timeout: args.poll_timeout,
                    },
                },
            )?;
        }
    }

    Ok(())
}
