//! Bus master: polls one or more BMS units over a shared RS-485 bus,
//! decodes their frames into records, and executes queued switch writes.
//!
//! Records flow out over an mpsc channel as immutable snapshots; switch
//! commands flow in over a second channel and are drained opportunistically
//! between poll cycles. The only terminal error is the consecutive-failure
//! watchdog; everything else is logged and retried on the next cycle.

use crate::protocol::{
    decode_device_info, decode_sample, decode_settings, frame_type, switch_command, wrap_command,
    write_ack, DeviceInfo, Layout, Record, Settings, SwitchCommand, COMMAND_DEVICE_INFO,
    COMMAND_SETTINGS, COMMAND_STATUS, FRAME_TYPE_DEVICE_INFO, FRAME_TYPE_SAMPLE,
    FRAME_TYPE_SETTINGS,
};
use crate::serial::{CommandEcho, FrameReader, Transport};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Errors of the bus master.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A transport error that escaped the per-exchange retry handling.
    #[error("serial error: {0}")]
    Serial(#[from] crate::serial::Error),
    /// Too many consecutive failed exchanges; the bus is considered dead.
    #[error("giving up after {failures} consecutive bus failures")]
    Watchdog { failures: u32 },
}

/// How long a streaming device may stay silent before it counts as a
/// failed exchange.
const STREAM_TIMEOUT: Duration = Duration::from_secs(5);

/// Poll cadence and bus timing.
#[derive(Debug, Clone)]
pub struct PollConfig {
    /// Slave addresses polled in master mode, in rotation order.
    pub addresses: Vec<u8>,
    /// Poll settings every n-th cycle.
    pub settings_period: u32,
    /// Poll device info every n-th cycle.
    pub device_info_period: u32,
    /// Budget for one request/response exchange.
    pub exchange_timeout: Duration,
    /// Quiet time between exchanges so slaves can release the bus.
    pub turnaround: Duration,
    /// Consecutive failed exchanges before [`Error::Watchdog`].
    pub max_consecutive_errors: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            addresses: vec![1],
            settings_period: 6,
            device_info_period: 720,
            exchange_timeout: Duration::from_millis(500),
            turnaround: Duration::from_millis(100),
            max_consecutive_errors: 800,
        }
    }
}

/// Everything the bus reports to its consumer.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BusEvent {
    Record(Record),
    /// Outcome of one queued switch write.
    CommandResult { command: SwitchCommand, acked: bool },
}

/// What we have learned about one slave so far.
#[derive(Debug, Default)]
struct DeviceState {
    settings: Option<Settings>,
    device_info: Option<DeviceInfo>,
}

impl DeviceState {
    fn layout(&self) -> Layout {
        self.device_info
            .as_ref()
            .map(|di| di.layout())
            .unwrap_or_default()
    }

    fn has_float_charger(&self) -> bool {
        self.device_info
            .as_ref()
            .map(|di| di.has_float_charger)
            .unwrap_or(false)
    }
}

/// The bus master. Owns the serial transport for its whole lifetime.
pub struct JkBus<T> {
    reader: FrameReader<T>,
    config: PollConfig,
    events: mpsc::Sender<BusEvent>,
    commands: mpsc::Receiver<SwitchCommand>,
    shutdown: Arc<AtomicBool>,
    devices: HashMap<u8, DeviceState>,
    cycle: u32,
    failures: u32,
}

impl<T: Transport> JkBus<T> {
    pub fn new(
        reader: FrameReader<T>,
        config: PollConfig,
        events: mpsc::Sender<BusEvent>,
        commands: mpsc::Receiver<SwitchCommand>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            reader,
            config,
            events,
            commands,
            shutdown,
            devices: HashMap::new(),
            cycle: 0,
            failures: 0,
        }
    }

    pub fn transport_mut(&mut self) -> &mut T {
        self.reader.transport_mut()
    }

    fn stopping(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Run as bus master: rotate over the configured addresses, polling
    /// status every cycle, settings and device info on their periods.
    /// Returns `Ok` on shutdown, [`Error::Watchdog`] when the bus dies.
    pub async fn run(&mut self) -> Result<(), Error> {
        log::info!(
            "polling {} device(s): {:?}",
            self.config.addresses.len(),
            self.config.addresses
        );
        loop {
            if self.stopping() {
                return Ok(());
            }
            for address in self.config.addresses.clone() {
                if self.stopping() {
                    return Ok(());
                }
                if self.cycle % self.config.device_info_period == 0 {
                    self.exchange(address, &COMMAND_DEVICE_INFO).await?;
                    tokio::time::sleep(self.config.turnaround).await;
                }
                if self.cycle % self.config.settings_period == 0 {
                    self.exchange(address, &COMMAND_SETTINGS).await?;
                    tokio::time::sleep(self.config.turnaround).await;
                }
                self.exchange(address, &COMMAND_STATUS).await?;
                tokio::time::sleep(self.config.turnaround).await;
            }
            // a settings snapshot from this cycle may be needed for
            // multi-flag writes, so the queue drains after the rotation
            self.drain_command_queue().await?;
            self.cycle = self.cycle.wrapping_add(1);
        }
    }

    /// Run against a single device that streams frames on its own, without
    /// being polled. Queued switch writes are still executed between frames.
    pub async fn run_stream(&mut self) -> Result<(), Error> {
        log::info!("listening for streamed frames");
        loop {
            if self.stopping() {
                return Ok(());
            }
            self.drain_command_queue().await?;

            let mut echoes = Vec::new();
            let result = tokio::time::timeout(STREAM_TIMEOUT, async {
                loop {
                    match self.reader.read_frame(&mut echoes).await {
                        // silence is normal between streamed frames
                        Err(crate::serial::Error::NoData { .. }) => continue,
                        other => break other,
                    }
                }
            })
            .await;
            match result {
                Ok(Ok(frame)) => {
                    self.failures = 0;
                    self.log_echoes(&echoes);
                    self.handle_frame(&frame).await;
                }
                Ok(Err(err)) => self.register_failure(&err.to_string())?,
                Err(elapsed) => self.register_failure(&elapsed.to_string())?,
            }
        }
    }

    /// One request/response exchange with a slave. Failures are counted
    /// against the watchdog instead of being propagated.
    async fn exchange(&mut self, address: u8, command: &[u8]) -> Result<(), Error> {
        let envelope = wrap_command(address, command);
        if let Err(err) = self.reader.send(&envelope).await {
            return self.register_failure(&err.to_string());
        }

        let mut echoes = Vec::new();
        let reply = tokio::time::timeout(
            self.config.exchange_timeout,
            self.reader.read_frame(&mut echoes),
        )
        .await;
        match reply {
            Ok(Ok(frame)) => {
                self.failures = 0;
                self.log_echoes(&echoes);
                self.handle_frame(&frame).await;
                Ok(())
            }
            Ok(Err(err)) => self.register_failure(&err.to_string()),
            Err(elapsed) => self.register_failure(&elapsed.to_string()),
        }
    }

    fn register_failure(&mut self, reason: &str) -> Result<(), Error> {
        self.failures += 1;
        log::warn!(
            "bus exchange failed ({}/{}): {reason}",
            self.failures,
            self.config.max_consecutive_errors
        );
        if self.failures > self.config.max_consecutive_errors {
            Err(Error::Watchdog {
                failures: self.failures,
            })
        } else {
            Ok(())
        }
    }

    fn log_echoes(&self, echoes: &[CommandEcho]) {
        for echo in echoes {
            if !echo.crc_ok {
                log::warn!("command echo with bad CRC: {:02X?}", echo.bytes);
            }
        }
    }

    /// Decode a validated frame and publish the record.
    async fn handle_frame(&mut self, frame: &[u8]) {
        let record = match frame_type(frame) {
            FRAME_TYPE_SETTINGS => match decode_settings(frame) {
                Ok(settings) => {
                    let state = self.devices.entry(settings.address).or_default();
                    state.settings = Some(settings.clone());
                    Some(Record::Settings(settings))
                }
                Err(err) => {
                    log::warn!("undecodable settings frame: {err}");
                    None
                }
            },
            FRAME_TYPE_SAMPLE => self.decode_sample_frame(frame),
            FRAME_TYPE_DEVICE_INFO => match decode_device_info(frame) {
                Ok(info) => {
                    log::info!(
                        "device {} is a {} {} (hw {}, sw {})",
                        info.address,
                        info.manufacturer,
                        info.model,
                        info.hw_version,
                        info.sw_version
                    );
                    let state = self.devices.entry(info.address).or_default();
                    state.device_info = Some(info.clone());
                    Some(Record::DeviceInfo(info))
                }
                Err(err) => {
                    log::warn!("undecodable device-info frame: {err}");
                    None
                }
            },
            kind => {
                log::warn!("frame with unknown record type {kind}");
                Some(Record::Unknown { kind })
            }
        };
        if let Some(record) = record {
            self.emit(BusEvent::Record(record)).await;
        }
    }

    fn decode_sample_frame(&mut self, frame: &[u8]) -> Option<Record> {
        let address = frame.get(300).copied().unwrap_or(0);
        let state = self.devices.entry(address).or_default();
        let Some(num_cells) = state.settings.as_ref().map(|s| s.cell_count.min(32) as u8) else {
            // cell count is unknown until the first settings poll answers
            log::warn!("sample from device {address} before its settings, skipping");
            return None;
        };
        let layout = state.layout();
        let has_float_charger = state.has_float_charger();
        match decode_sample(
            frame,
            num_cells,
            layout,
            state.settings.as_ref(),
            has_float_charger,
        ) {
            Ok(sample) => Some(Record::Sample(sample)),
            Err(err) => {
                log::warn!("undecodable sample frame: {err}");
                None
            }
        }
    }

    /// Execute all queued switch writes, each followed by a forced settings
    /// re-poll so the published state catches up with the change.
    async fn drain_command_queue(&mut self) -> Result<(), Error> {
        while let Ok(command) = self.commands.try_recv() {
            self.execute_command(command).await?;
        }
        Ok(())
    }

    async fn execute_command(&mut self, command: SwitchCommand) -> Result<(), Error> {
        log::info!(
            "switch write: device {} {} -> {}",
            command.address,
            command.switch,
            command.enable
        );
        let flag_register = self
            .devices
            .get(&command.address)
            .and_then(|state| state.settings.as_ref())
            .map(|settings| settings.flag_register);

        let payload = match switch_command(command.switch, command.enable, flag_register) {
            Ok(payload) => payload,
            Err(err) => {
                log::warn!("switch write rejected: {err}");
                self.emit(BusEvent::CommandResult {
                    command,
                    acked: false,
                })
                .await;
                return Ok(());
            }
        };
        let envelope = wrap_command(command.address, &payload);
        let expected = write_ack(&envelope);

        if let Err(err) = self.reader.send(&envelope).await {
            return self.register_failure(&err.to_string());
        }
        let acked = match tokio::time::timeout(
            self.config.exchange_timeout,
            self.reader.read_exact_match(&expected),
        )
        .await
        {
            Ok(Ok(acked)) => acked,
            Ok(Err(err)) => {
                log::warn!("no ack for switch write: {err}");
                false
            }
            Err(_) => {
                log::warn!("switch write ack timed out");
                false
            }
        };
        self.emit(BusEvent::CommandResult { command, acked }).await;

        // re-read settings right away so switch state reflects the write
        tokio::time::sleep(self.config.turnaround).await;
        self.exchange(command.address, &COMMAND_SETTINGS).await
    }

    async fn emit(&mut self, event: BusEvent) {
        if self.events.send(event).await.is_err() {
            // consumer gone, stop at the next loop head
            log::debug!("event channel closed, shutting down");
            self.shutdown.store(true, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crc::{crc16_modbus_le, sum8};
    use crate::protocol::tests::{from_hex, SAMPLE_FRAME_HEX, SETTINGS_FRAME_HEX};
    use crate::protocol::{Switch, FRAME_HEADER, SERIAL_FRAME_LENGTH};
    use crate::serial::testing::MockTransport;

    /// Synthesize a valid device-info long frame for a PB2A16S on 11.x.
    fn device_info_frame(address: u8) -> Vec<u8> {
        let mut buf = vec![0u8; SERIAL_FRAME_LENGTH];
        buf[..4].copy_from_slice(&FRAME_HEADER);
        buf[4] = FRAME_TYPE_DEVICE_INFO;
        buf[6..6 + 7].copy_from_slice(b"PB2A16S");
        buf[22..22 + 4].copy_from_slice(b"V2.0");
        buf[30..30 + 5].copy_from_slice(b"11.26");
        buf[299] = sum8(&buf[..299]);
        buf[300] = address;
        let crc = crc16_modbus_le(&buf[300..306]);
        buf[306..308].copy_from_slice(&crc);
        buf
    }

    fn bus(
        transport: MockTransport,
        config: PollConfig,
    ) -> (
        JkBus<MockTransport>,
        mpsc::Receiver<BusEvent>,
        mpsc::Sender<SwitchCommand>,
        Arc<AtomicBool>,
    ) {
        let (event_tx, event_rx) = mpsc::channel(64);
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let shutdown = Arc::new(AtomicBool::new(false));
        let reader = FrameReader::with_defaults(transport);
        let bus = JkBus::new(reader, config, event_tx, cmd_rx, shutdown.clone());
        (bus, event_rx, cmd_tx, shutdown)
    }

    #[tokio::test(start_paused = true)]
    async fn first_cycle_polls_all_record_kinds() {
        let mut transport = MockTransport::new();
        // cycle 0 polls device info, settings, status in that order
        transport.feed(&device_info_frame(1));
        transport.feed(&from_hex(SETTINGS_FRAME_HEX));
        transport.feed(&from_hex(SAMPLE_FRAME_HEX));

        let (mut bus, mut events, _cmd_tx, shutdown) = bus(transport, PollConfig::default());
        let consumer = async {
            let mut records = Vec::new();
            for _ in 0..3 {
                match events.recv().await {
                    Some(BusEvent::Record(record)) => records.push(record),
                    other => panic!("unexpected event {other:?}"),
                }
            }
            shutdown.store(true, Ordering::Relaxed);
            records
        };
        let (run, records) = tokio::join!(bus.run(), consumer);
        run.unwrap();

        assert!(matches!(records[0], Record::DeviceInfo(_)));
        assert!(matches!(records[1], Record::Settings(_)));
        let Record::Sample(sample) = &records[2] else {
            panic!("expected a sample record");
        };
        assert_eq!(sample.cell_voltages.len(), 16);
        // switch map is fed from the settings poll, float charger from the model
        assert_eq!(sample.switches.get(&Switch::Charge), Some(&true));
        assert_eq!(sample.switches.get(&Switch::FloatCharge), Some(&true));

        // the three poll envelopes went out wrapped for address 1
        let written = &bus.transport_mut().written;
        assert_eq!(written[0], wrap_command(1, &COMMAND_DEVICE_INFO));
        assert_eq!(written[1], wrap_command(1, &COMMAND_SETTINGS));
        assert_eq!(written[2], wrap_command(1, &COMMAND_STATUS));
    }

    #[tokio::test(start_paused = true)]
    async fn sample_before_settings_is_skipped() {
        let mut transport = MockTransport::new();
        transport.feed(&from_hex(SAMPLE_FRAME_HEX));

        let (mut bus, mut events, _cmd_tx, shutdown) = bus(transport, PollConfig::default());
        let consumer = async {
            let got =
                tokio::time::timeout(Duration::from_secs(30), events.recv()).await;
            shutdown.store(true, Ordering::Relaxed);
            got
        };
        let (run, got) = tokio::join!(bus.run_stream(), consumer);
        run.unwrap();
        // nothing published; the sample arrived with no cell count known
        assert!(got.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn switch_write_is_acked_and_settings_repolled() {
        let mut transport = MockTransport::new();
        // TX echo plus the BMS ack, then the forced settings re-poll answer
        transport.feed(&from_hex("01 10 10 70 00 02 44 D3"));
        transport.feed(&from_hex(SETTINGS_FRAME_HEX));

        let (mut bus, mut events, cmd_tx, shutdown) = bus(transport, PollConfig::default());
        cmd_tx
            .send(SwitchCommand {
                address: 1,
                switch: Switch::Charge,
                enable: true,
            })
            .await
            .unwrap();

        let consumer = async {
            let first = events.recv().await;
            let second = events.recv().await;
            shutdown.store(true, Ordering::Relaxed);
            (first, second)
        };
        let (run, (first, second)) = tokio::join!(bus.run_stream(), consumer);
        run.unwrap();

        match first {
            Some(BusEvent::CommandResult { command, acked }) => {
                assert!(acked);
                assert_eq!(command.switch, Switch::Charge);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(matches!(second, Some(BusEvent::Record(Record::Settings(_)))));

        let written = &bus.transport_mut().written;
        assert_eq!(
            written[0],
            from_hex("01 10 10 70 00 02 04 00 00 00 01 F8 8B")
        );
        assert_eq!(written[1], wrap_command(1, &COMMAND_SETTINGS));
    }

    #[tokio::test(start_paused = true)]
    async fn flag_switch_without_settings_is_rejected() {
        let (mut bus, mut events, cmd_tx, shutdown) =
            bus(MockTransport::new(), PollConfig::default());
        cmd_tx
            .send(SwitchCommand {
                address: 1,
                switch: Switch::FloatCharge,
                enable: true,
            })
            .await
            .unwrap();

        let consumer = async {
            let event = events.recv().await;
            shutdown.store(true, Ordering::Relaxed);
            event
        };
        let (run, event) = tokio::join!(bus.run_stream(), consumer);
        run.unwrap();

        match event {
            Some(BusEvent::CommandResult { acked, .. }) => assert!(!acked),
            other => panic!("unexpected event {other:?}"),
        }
        // nothing was written to the bus for the rejected command
        assert!(bus.transport_mut().written.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn watchdog_kills_a_dead_bus() {
        let config = PollConfig {
            max_consecutive_errors: 3,
            ..Default::default()
        };
        let (mut bus, _events, _cmd_tx, _shutdown) = bus(MockTransport::new(), config);
        let err = bus.run().await.unwrap_err();
        assert!(matches!(err, Error::Watchdog { failures: 4 }));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_flag_stops_the_loop() {
        let (mut bus, _events, _cmd_tx, shutdown) =
            bus(MockTransport::new(), PollConfig::default());
        shutdown.store(true, Ordering::Relaxed);
        bus.run().await.unwrap();
        bus.run_stream().await.unwrap();
    }
}
