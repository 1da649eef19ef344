use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use ubms_lib::mode::ModeController;
use ubms_lib::monitor::{self, Monitor, Snapshot};
use ubms_lib::settings::SettingsStore;
use ubms_lib::state::BatteryState;
use ubms_lib::transport::Transport;

use crate::{commandline, mqtt};

/// Publishes every leaf below `base_topic`, stopping at the first failure.
fn publish_simple_format(
    publisher: &mqtt::MqttPublisher,
    base_topic: &str,
    value: &serde_json::Value,
) -> Result<()> {
    fn publish_recursive(
        publisher: &mqtt::MqttPublisher,
        topic: &str,
        val: &serde_json::Value,
    ) -> Result<()> {
        match val {
            serde_json::Value::Object(map) => {
                for (k, v) in map {
                    let sub_topic = format!("{topic}/{k}");
                    publish_recursive(publisher, &sub_topic, v)?;
                }
                Ok(())
            }
            serde_json::Value::Array(arr) => {
                for (i, v) in arr.iter().enumerate() {
                    let sub_topic = format!("{topic}/{i}");
                    publish_recursive(publisher, &sub_topic, v)?;
                }
                Ok(())
            }
            serde_json::Value::String(s) => publisher.publish(topic, s),
            serde_json::Value::Number(n) => publisher.publish(topic, &n.to_string()),
            serde_json::Value::Bool(b) => publisher.publish(topic, &b.to_string()),
            // Do not publish null values
            serde_json::Value::Null => Ok(()),
        }
    }
    publish_recursive(publisher, base_topic, value)
}

/// Feeds every received frame into the shared state until `stop` is set.
fn spawn_receiver(
    transport: Arc<dyn Transport>,
    state: Arc<Mutex<BatteryState>>,
    poll_timeout: Duration,
    stop: Arc<AtomicBool>,
) -> Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("can-rx".into())
        .spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                match transport.receive(poll_timeout) {
                    Ok(Some(frame)) => monitor::lock(&state).decode(&frame),
                    Ok(None) => {}
                    Err(e) => {
                        warn!("Receive failed: {e}");
                        std::thread::sleep(poll_timeout);
                    }
                }
            }
            debug!("Receiver stopped");
        })
        .with_context(|| "Cannot start receive thread")
}

enum Sink {
    Console,
    Mqtt {
        publisher: mqtt::MqttPublisher,
        format: commandline::MqttFormat,
    },
}

impl Sink {
    fn publish(&self, snapshot: &Snapshot) {
        let value = match serde_json::to_value(snapshot) {
            Ok(value) => value,
            Err(e) => {
                error!("Failed to serialize battery state: {e}");
                return;
            }
        };
        match self {
            Sink::Console => {
                println!("--- Data at {} ---", snapshot.timestamp.to_rfc3339());
                if let serde_json::Value::Object(map) = &value {
                    for (name, data) in map {
                        println!("{name}: {data}");
                    }
                }
                println!("--------------------------");
            }
            Sink::Mqtt {
                publisher,
                format: commandline::MqttFormat::Simple,
            } => {
                if let Err(e) = publish_simple_format(publisher, publisher.topic(), &value) {
                    warn!("Snapshot dropped: {e:#}");
                }
            }
            Sink::Mqtt {
                publisher,
                format: commandline::MqttFormat::Json,
            } => {
                match serde_json::to_string(&value) {
                    Ok(json_payload) => {
                        if let Err(e) = publisher.publish(publisher.topic(), &json_payload) {
                            error!("Failed to publish data to MQTT: {e:?}");
                        }
                    }
                    Err(e) => error!("Failed to serialize data to JSON string: {e}"),
                }
            }
        }
    }
}

/// Periods driving the analytics loop.
#[derive(Debug, Clone, Copy)]
pub struct CycleTiming {
    /// Analytics cycle period.
    pub cycle_interval: Duration,
    /// Minimum time between two published snapshots.
    pub publish_interval: Duration,
    pub poll_timeout: Duration,
}

pub struct DaemonParams {
    pub output: commandline::DaemonOutput,
    pub timing: CycleTiming,
}

pub fn run(
    transport: Arc<dyn Transport>,
    controller: Arc<ModeController>,
    mut monitor: Monitor,
    mut store: Box<dyn SettingsStore>,
    params: DaemonParams,
) -> Result<()> {
    info!(
        "Starting daemon mode: output={:?}, timing={:?}",
        params.output, params.timing
    );

    let sink = match &params.output {
        commandline::DaemonOutput::Console => Sink::Console,
        commandline::DaemonOutput::Mqtt {
            config_file,
            format,
        } => {
            let config = mqtt::MqttConfig::load(config_file)
                .with_context(|| format!("Failed to open MQTT config file at '{config_file}'"))?;
            info!("Successfully loaded MQTT config from {config_file}: {config:?}");
            let mode_controller = Arc::clone(&controller);
            let publisher = mqtt::MqttPublisher::new(config, move |payload| {
                mqtt::handle_mode_request(&mode_controller, payload)
            })
            .with_context(|| "Failed to create MQTT publisher")?;
            Sink::Mqtt {
                publisher,
                format: format.clone(),
            }
        }
    };

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .with_context(|| "Cannot create runtime")?;
    let result = runtime.block_on(async {
        let shutdown = shutdown_signal()?;
        serve(
            transport,
            &mut monitor,
            store.as_mut(),
            params.timing,
            |snapshot| sink.publish(snapshot),
            shutdown,
        )
        .await
    });

    if let Sink::Mqtt { publisher, .. } = &sink {
        publisher.disconnect();
    }
    info!("Stopped, mode command was {:?}", controller.mode());
    result
}

/// Resolves on the first SIGINT or SIGTERM, the handlers are installed once.
#[cfg(unix)]
fn shutdown_signal() -> Result<impl Future<Output = ()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt =
        signal(SignalKind::interrupt()).with_context(|| "Cannot install SIGINT handler")?;
    let mut terminate =
        signal(SignalKind::terminate()).with_context(|| "Cannot install SIGTERM handler")?;
    Ok(async move {
        tokio::select! {
            _ = interrupt.recv() => info!("Ctrl+C received, shutting down"),
            _ = terminate.recv() => info!("SIGTERM received, shutting down"),
        }
    })
}

#[cfg(not(unix))]
fn shutdown_signal() -> Result<impl Future<Output = ()>> {
    Ok(async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Ctrl+C received, shutting down"),
            Err(e) => error!("Cannot listen for Ctrl+C, shutting down: {e}"),
        }
    })
}

/// Runs the receive thread and the analytics loop until `shutdown` resolves.
///
/// The history is flushed on every exit path.
pub async fn serve<P, S>(
    transport: Arc<dyn Transport>,
    monitor: &mut Monitor,
    store: &mut dyn SettingsStore,
    timing: CycleTiming,
    publish: P,
    shutdown: S,
) -> Result<()>
where
    P: FnMut(&Snapshot),
    S: Future<Output = ()>,
{
    let stop = Arc::new(AtomicBool::new(false));
    let receiver = spawn_receiver(
        transport,
        monitor.shared_state(),
        timing.poll_timeout,
        Arc::clone(&stop),
    )?;

    cycle_loop(monitor, store, timing, publish, shutdown).await;

    stop.store(true, Ordering::Relaxed);
    if receiver.join().is_err() {
        error!("Receive thread panicked");
    }
    monitor
        .flush(store)
        .with_context(|| "Cannot save history")?;
    info!("History saved");
    Ok(())
}

async fn cycle_loop<P, S>(
    monitor: &mut Monitor,
    store: &mut dyn SettingsStore,
    timing: CycleTiming,
    mut publish: P,
    shutdown: S,
) where
    P: FnMut(&Snapshot),
    S: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    let mut ticker = tokio::time::interval(timing.cycle_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut last_publish: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = &mut shutdown => return,
            _ = ticker.tick() => {
                let snapshot = match monitor.cycle(chrono::Local::now(), store) {
                    Ok(snapshot) => snapshot,
                    Err(e) => {
                        error!("Analytics cycle failed: {e}");
                        continue;
                    }
                };
                if last_publish.map_or(true, |t| t.elapsed() >= timing.publish_interval) {
                    last_publish = Some(Instant::now());
                    publish(&snapshot);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::poll_fn;
    use std::task::Poll;
    use ubms_lib::history::{HistoryState, HistoryTracker};
    use ubms_lib::protocol::{Filter, Frame, STATUS_ID};
    use ubms_lib::settings::{self, MemorySettings};
    use ubms_lib::state::BatteryConfig;
    use ubms_lib::transport::PeriodicHandle;

    /// Delivers the same frame on every receive, or nothing.
    struct RepeatingTransport(Option<Frame>);

    impl Transport for RepeatingTransport {
        fn send(&self, _frame: &Frame) -> Result<(), ubms_lib::Error> {
            Ok(())
        }

        fn receive(&self, timeout: Duration) -> Result<Option<Frame>, ubms_lib::Error> {
            std::thread::sleep(timeout);
            Ok(self.0)
        }

        fn set_filters(&self, _filters: &[Filter]) -> Result<(), ubms_lib::Error> {
            Ok(())
        }

        fn send_periodic(
            &self,
            _frame: Frame,
            _period: Duration,
        ) -> Result<PeriodicHandle, ubms_lib::Error> {
            Err(ubms_lib::Error::Transport("not supported".into()))
        }
    }

    const TIMING: CycleTiming = CycleTiming {
        cycle_interval: Duration::from_millis(20),
        publish_interval: Duration::from_millis(0),
        poll_timeout: Duration::from_millis(5),
    };

    fn monitor(history: HistoryState) -> Monitor {
        let config = BatteryConfig {
            capacity: 100.0,
            ..Default::default()
        };
        Monitor::new(
            BatteryState::new(config),
            HistoryTracker::new(history, 100.0),
        )
    }

    #[tokio::test]
    async fn shutdown_flushes_history() {
        let mut monitor = monitor(HistoryState {
            average_discharge: 2.5,
            total_ah_drawn: -40.0,
            capacity: Some(95.0),
            ..Default::default()
        });
        let mut store = MemorySettings::new();
        serve(
            Arc::new(RepeatingTransport(None)),
            &mut monitor,
            &mut store,
            TIMING,
            |_| {},
            std::future::ready(()),
        )
        .await
        .unwrap();
        assert_eq!(store.get(settings::AVG_DISCHARGE), Some(2.5));
        assert_eq!(store.get(settings::CAPACITY), Some(95.0));
        assert!(store.get(settings::TOTAL_AH_DRAWN).is_some());
    }

    #[tokio::test]
    async fn received_full_charge_is_stored() {
        let full = Frame::new(STATUS_ID, &[100, 0x02, 0x10, 0, 0, 4, 0, 0]).unwrap();
        let mut monitor = monitor(HistoryState::default());
        let mut store = MemorySettings::new();
        serve(
            Arc::new(RepeatingTransport(Some(full))),
            &mut monitor,
            &mut store,
            TIMING,
            |_| {},
            tokio::time::sleep(Duration::from_millis(300)),
        )
        .await
        .unwrap();
        assert!(store.get(settings::TIME_LAST_FULL).is_some());
    }

    #[tokio::test]
    async fn shutdown_requested_while_publishing_ends_loop() {
        let requested = Arc::new(AtomicBool::new(false));
        let mut published = 0;
        let mut monitor = monitor(HistoryState::default());
        let mut store = MemorySettings::new();
        let flag = Arc::clone(&requested);
        let shutdown = poll_fn(move |_| {
            if flag.load(Ordering::Relaxed) {
                Poll::Ready(())
            } else {
                Poll::Pending
            }
        });
        let served = serve(
            Arc::new(RepeatingTransport(None)),
            &mut monitor,
            &mut store,
            TIMING,
            |_| {
                published += 1;
                requested.store(true, Ordering::Relaxed);
            },
            shutdown,
        );
        tokio::time::timeout(Duration::from_secs(2), served)
            .await
            .unwrap()
            .unwrap();
        assert!(published >= 1);
    }
}
