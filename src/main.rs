mod commandline;

use anyhow::{bail, Context, Result};
use clap::Parser;
use commandline::{CliArgs, CliCommands};
use flexi_logger::{Logger, LoggerHandle};
use jkbms_lib::bus::{BusEvent, JkBus, PollConfig};
use jkbms_lib::protocol::{Record, SwitchCommand, SERIAL_FRAME_LENGTH};
use jkbms_lib::serial::{self, FrameReader};
use log::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::{ops::Deref, panic};
use tokio::sync::mpsc;

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

fn print_record(record: &Record) {
    match serde_json::to_string(record) {
        Ok(line) => println!("{line}"),
        Err(err) => warn!("Cannot serialize record: {err}"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    let _log_handle = logging_init(args.verbose.log_level_filter());

    let transport = serial::open(&args.device, args.baud_rate)
        .with_context(|| format!("Cannot open serial port '{}'", args.device))?;
    let reader = FrameReader::new(transport, args.timeout, SERIAL_FRAME_LENGTH);

    let addresses = match &args.command {
        CliCommands::Poll { addresses, .. } => addresses.clone(),
        CliCommands::SetSwitch { address, .. } => vec![*address],
        CliCommands::Listen => Vec::new(),
    };
    let config = PollConfig {
        addresses,
        settings_period: args.settings_period,
        device_info_period: args.device_info_period,
        exchange_timeout: args.timeout,
        turnaround: args.delay,
        max_consecutive_errors: args.max_errors,
    };

    let (event_tx, mut event_rx) = mpsc::channel(64);
    let (cmd_tx, cmd_rx) = mpsc::channel(16);
    let shutdown = Arc::new(AtomicBool::new(false));
    let mut bus = JkBus::new(reader, config, event_tx, cmd_rx, shutdown.clone());

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupted, shutting down");
                shutdown.store(true, Ordering::Relaxed);
            }
        });
    }

    match args.command {
        CliCommands::Listen => {
            let printer = async {
                while let Some(event) = event_rx.recv().await {
                    if let BusEvent::Record(record) = event {
                        print_record(&record);
                    }
                }
            };
            // dropping the bus closes the event channel so the printer ends
            let run = async move {
                let result = bus.run_stream().await;
                drop(bus);
                result
            };
            let (run, ()) = tokio::join!(run, printer);
            run.with_context(|| "Bus failure while listening")?;
        }
        CliCommands::Poll { count, .. } => {
            let printer = async {
                let mut printed = 0u64;
                while let Some(event) = event_rx.recv().await {
                    if let BusEvent::Record(record) = event {
                        print_record(&record);
                        printed += 1;
                        if count > 0 && printed >= count {
                            shutdown.store(true, Ordering::Relaxed);
                            break;
                        }
                    }
                }
            };
            let run = async move {
                let result = bus.run().await;
                drop(bus);
                result
            };
            let (run, ()) = tokio::join!(run, printer);
            run.with_context(|| "Bus failure while polling")?;
        }
        CliCommands::SetSwitch {
            address,
            switch,
            enable,
        } => {
            cmd_tx
                .send(SwitchCommand {
                    address,
                    switch,
                    enable,
                })
                .await
                .with_context(|| "Cannot queue switch command")?;

            let printer = async {
                let mut acked = None;
                while let Some(event) = event_rx.recv().await {
                    match event {
                        BusEvent::CommandResult { acked: ok, .. } => acked = Some(ok),
                        BusEvent::Record(record) => {
                            // the settings re-poll after the write confirms
                            // the new switch state; stop once it arrives
                            if matches!(record, Record::Settings(_)) && acked.is_some() {
                                print_record(&record);
                                shutdown.store(true, Ordering::Relaxed);
                                break;
                            }
                        }
                    }
                }
                acked
            };
            let run = async move {
                let result = bus.run().await;
                drop(bus);
                result
            };
            let (run, acked) = tokio::join!(run, printer);
            run.with_context(|| "Bus failure during switch write")?;
            match acked {
                Some(true) => info!("switch '{switch}' set to {enable}"),
                Some(false) => bail!("Switch write was not acknowledged"),
                None => bail!("Switch write was never executed"),
            }
        }
    }

    Ok(())
}
