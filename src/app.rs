//! Scan-cycle controller (business logic) for `switchbot-meter-bridge`.
//!
//! This module is decoupled from CLI parsing, the MQTT client and process
//! exit codes, so whole cycles can be tested deterministically with a fake
//! scanner and a recording broker sink.

use crate::alias::Alias;
use crate::discovery::{DEFAULT_DISCOVERY_PREFIX, DiscoveryAnnouncer};
use crate::mac_address::MacAddress;
use crate::measurement::HumanReadable;
use crate::output::BrokerSink;
use crate::output::mqtt::MqttConfig;
use crate::pipeline::{Pipeline, PipelineError};
use crate::queue::{DEFAULT_QUEUE_CAPACITY, PublishQueue};
use crate::scanner::{Advertisement, Backend, ScanError};
use clap::{Parser, ValueEnum};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// MQTT keep-alive interval.
const MQTT_KEEP_ALIVE: Duration = Duration::from_secs(30);

/// When scanning stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum Mode {
    /// Repeat scan windows until interrupted
    #[default]
    Continuous,
    /// Scan for one window, publish, exit
    FixedWindow,
    /// Scan until every --target has been seen or --timeout elapses, publish, exit
    UntilAllSeen,
}

/// Configuration for the bridge.
#[derive(Parser, Debug, Clone)]
#[command(author, about, version)]
pub struct Options {
    /// Bluetooth scanner backend to use
    #[arg(long, default_value_t, value_enum, env = "SWITCHBOT_BACKEND")]
    pub backend: Backend,

    /// Termination policy
    #[arg(long, default_value_t, value_enum, env = "SWITCHBOT_MODE")]
    pub mode: Mode,

    /// Device that must be seen before an until-all-seen scan ends.
    /// May be given multiple times.
    #[arg(long = "target", value_name = "MAC")]
    pub targets: Vec<MacAddress>,

    /// Length of one scan window in continuous and fixed-window modes.
    /// Accepts duration with suffix: 3s, 1m, 500ms, 2h.
    #[arg(long, default_value = "5s", value_parser = crate::duration::parse_duration, env = "SWITCHBOT_WINDOW")]
    pub window: Duration,

    /// Upper bound for an until-all-seen scan
    #[arg(long, default_value = "2m", value_parser = crate::duration::parse_duration, env = "SWITCHBOT_TIMEOUT")]
    pub timeout: Duration,

    /// Specify human-readable alias for a meter.
    /// Format: --alias C7:EB:E0:FC:87:08=Bedroom
    #[arg(long = "alias", value_parser = crate::alias::parse_alias, value_name = "ALIAS")]
    pub aliases: Vec<Alias>,

    /// Home Assistant discovery topic prefix
    #[arg(long, default_value = DEFAULT_DISCOVERY_PREFIX, env = "SWITCHBOT_DISCOVERY_PREFIX")]
    pub discovery_prefix: String,

    /// Messages kept while the broker is unreachable; the oldest is dropped beyond this
    #[arg(long, default_value_t = DEFAULT_QUEUE_CAPACITY)]
    pub queue_capacity: usize,

    /// MQTT broker host. Without it readings are decoded and logged only.
    #[arg(long, env = "MQTT_HOST")]
    pub mqtt_host: Option<String>,

    #[arg(long, default_value_t = 1883, env = "MQTT_PORT")]
    pub mqtt_port: u16,

    #[arg(long, env = "MQTT_USERNAME")]
    pub mqtt_username: Option<String>,

    #[arg(long, env = "MQTT_PASSWORD", hide_env_values = true)]
    pub mqtt_password: Option<String>,

    #[arg(long, default_value = "switchbot-meter-bridge", env = "MQTT_CLIENT_ID")]
    pub mqtt_client_id: String,

    /// Upper bound for handing one message to the MQTT client
    #[arg(long, default_value = "5s", value_parser = crate::duration::parse_duration)]
    pub mqtt_timeout: Duration,

    /// Verbose output, log every advertisement and decode error
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,
}

impl Options {
    /// The termination policy selected by `--mode`.
    pub fn policy(&self) -> Result<TerminationPolicy, RunError> {
        match self.mode {
            Mode::Continuous => Ok(TerminationPolicy::Continuous(self.window)),
            Mode::FixedWindow => Ok(TerminationPolicy::FixedWindow(self.window)),
            Mode::UntilAllSeen if self.targets.is_empty() => Err(RunError::Config(
                "--mode until-all-seen requires at least one --target".to_string(),
            )),
            Mode::UntilAllSeen => Ok(TerminationPolicy::UntilAllSeen {
                targets: self.targets.iter().copied().collect(),
                timeout: self.timeout,
            }),
        }
    }

    /// Broker connection settings, if a broker host was given.
    ///
    /// A password is only sent together with a username, so a password on
    /// its own is rejected.
    pub fn mqtt_config(&self) -> Result<Option<MqttConfig>, RunError> {
        if self.mqtt_password.is_some() && self.mqtt_username.is_none() {
            return Err(RunError::Config(
                "--mqtt-password requires --mqtt-username".to_string(),
            ));
        }

        Ok(self.mqtt_host.as_ref().map(|host| MqttConfig {
            host: host.clone(),
            port: self.mqtt_port,
            client_id: self.mqtt_client_id.clone(),
            username: self.mqtt_username.clone(),
            password: self.mqtt_password.clone(),
            keep_alive: MQTT_KEEP_ALIVE,
            timeout: self.mqtt_timeout,
        }))
    }

    fn pipeline(&self) -> Pipeline {
        Pipeline::new(
            DiscoveryAnnouncer::new(
                self.discovery_prefix.clone(),
                crate::alias::to_map(&self.aliases),
            ),
            PublishQueue::with_capacity(self.queue_capacity),
        )
    }
}

/// When the controller stops scanning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationPolicy {
    /// One cycle that ends early once every target has been seen.
    UntilAllSeen {
        targets: BTreeSet<MacAddress>,
        timeout: Duration,
    },
    /// One cycle of the given length.
    FixedWindow(Duration),
    /// Cycles of the given length until shutdown.
    Continuous(Duration),
}

impl TerminationPolicy {
    /// Length of one scan window.
    pub fn window(&self) -> Duration {
        match self {
            TerminationPolicy::UntilAllSeen { timeout, .. } => *timeout,
            TerminationPolicy::FixedWindow(window) | TerminationPolicy::Continuous(window) => {
                *window
            }
        }
    }

    /// Whether another cycle follows a completed one.
    pub fn repeats(&self) -> bool {
        matches!(self, TerminationPolicy::Continuous(_))
    }

    fn targets(&self) -> Option<&BTreeSet<MacAddress>> {
        match self {
            TerminationPolicy::UntilAllSeen { targets, .. } => Some(targets),
            _ => None,
        }
    }
}

/// Errors returned by the controller.
#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Scan(#[from] ScanError),
    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Scanner abstraction to enable deterministic unit tests without Bluetooth hardware.
pub trait Scanner: Send + Sync {
    fn start_scan(
        &self,
        backend: Backend,
    ) -> Pin<Box<dyn Future<Output = Result<mpsc::Receiver<Advertisement>, ScanError>> + Send + '_>>;
}

/// Real scanner implementation that delegates to the compiled-in backends.
#[derive(Debug, Default, Clone, Copy)]
pub struct RealScanner;

impl Scanner for RealScanner {
    fn start_scan(
        &self,
        backend: Backend,
    ) -> Pin<Box<dyn Future<Output = Result<mpsc::Receiver<Advertisement>, ScanError>> + Send + '_>>
    {
        Box::pin(async move { crate::scanner::start_scan(backend).await })
    }
}

/// Controller lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    Idle,
    Scanning,
    Draining,
    Terminated,
}

/// What one scan window produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Readings from this many distinct devices were processed.
    Observed(usize),
    /// No meter advertisement was decoded during the window.
    NoDevices,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    pub outcome: CycleOutcome,
    /// Messages published while draining
    pub delivered: usize,
    /// Scanning was interrupted by shutdown
    pub cancelled: bool,
}

/// Totals over a whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunSummary {
    pub cycles: usize,
    /// Distinct devices seen since start-up
    pub devices: usize,
    pub delivered: usize,
}

/// Drives scan windows and drains the publish queue between them.
pub struct ScanCycleController<'a> {
    pipeline: Pipeline,
    policy: TerminationPolicy,
    backend: Backend,
    scanner: &'a dyn Scanner,
    sink: &'a mut dyn BrokerSink,
    shutdown: CancellationToken,
    state: CycleState,
}

impl<'a> ScanCycleController<'a> {
    pub fn new(
        pipeline: Pipeline,
        policy: TerminationPolicy,
        backend: Backend,
        scanner: &'a dyn Scanner,
        sink: &'a mut dyn BrokerSink,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            pipeline,
            policy,
            backend,
            scanner,
            sink,
            shutdown,
            state: CycleState::Idle,
        }
    }

    pub fn state(&self) -> CycleState {
        self.state
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Run cycles until the policy or a shutdown request ends them.
    ///
    /// A scan backend that fails to start ends a bounded run with
    /// [`RunError::Scan`]; in continuous mode the failure is logged, the
    /// queue drained, and the scan retried after one window.
    pub async fn run(&mut self) -> Result<RunSummary, RunError> {
        let mut summary = RunSummary::default();

        'cycles: while !self.shutdown.is_cancelled() {
            let report = match self.run_cycle().await {
                Ok(report) => report,
                Err(e) if self.policy.repeats() => {
                    let delay = self.policy.window();
                    warn!("Failed to start scan, retrying in {delay:?}: {e}");
                    self.state = CycleState::Draining;
                    summary.delivered += self.pipeline.drain(&mut *self.sink).await;
                    self.state = CycleState::Idle;
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break 'cycles,
                        _ = tokio::time::sleep(delay) => continue 'cycles,
                    }
                }
                Err(e) => {
                    self.state = CycleState::Terminated;
                    return Err(e.into());
                }
            };

            summary.cycles += 1;
            summary.delivered += report.delivered;

            if report.cancelled || !self.policy.repeats() {
                break;
            }
        }

        self.state = CycleState::Terminated;
        summary.devices = self.pipeline.registry().known_count();
        info!(
            cycles = summary.cycles,
            devices = summary.devices,
            delivered = summary.delivered,
            "Scanning finished"
        );
        Ok(summary)
    }

    /// One scan window followed by a drain of the publish queue.
    pub async fn run_cycle(&mut self) -> Result<CycleReport, ScanError> {
        self.state = CycleState::Scanning;
        let mut advertisements = match self.scanner.start_scan(self.backend).await {
            Ok(rx) => rx,
            Err(e) => {
                self.state = CycleState::Idle;
                return Err(e);
            }
        };

        let window = self.policy.window();
        let deadline = Instant::now() + window;
        debug!("Scanning for {window:?} using {} backend", self.backend);

        let mut seen = HashSet::new();
        let mut cancelled = false;
        let mut scanner_closed = false;

        'scan: loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    info!("Shutdown requested, stopping scan");
                    cancelled = true;
                    break 'scan;
                }
                _ = tokio::time::sleep_until(deadline) => {
                    debug!("Scan window elapsed");
                    break 'scan;
                }
                received = advertisements.recv() => {
                    let Some(advertisement) = received else {
                        warn!("Scanner stopped delivering advertisements");
                        scanner_closed = true;
                        break 'scan;
                    };
                    if let Some(address) = self.process(&advertisement) {
                        seen.insert(address);
                    }
                    if self.targets_reached() {
                        info!("All target devices seen");
                        break 'scan;
                    }
                }
            }
        }

        // stops the backend
        drop(advertisements);

        self.state = CycleState::Draining;
        let delivered = self.pipeline.drain(&mut *self.sink).await;
        self.log_snapshot();
        self.state = CycleState::Idle;

        // a backend that keeps closing is restarted at most once per window
        if scanner_closed && self.policy.repeats() {
            tokio::select! {
                _ = self.shutdown.cancelled() => cancelled = true,
                _ = tokio::time::sleep_until(deadline) => {}
            }
        }

        let outcome = if seen.is_empty() {
            info!("No devices found");
            CycleOutcome::NoDevices
        } else {
            CycleOutcome::Observed(seen.len())
        };

        Ok(CycleReport {
            outcome,
            delivered,
            cancelled,
        })
    }

    fn process(&mut self, advertisement: &Advertisement) -> Option<MacAddress> {
        let address = advertisement.address;
        match self.pipeline.handle(advertisement) {
            Ok(observation) => {
                if observation.is_new_device {
                    info!("Found {address} (new)");
                } else {
                    debug!("Found {address}");
                }
                Some(address)
            }
            Err(PipelineError::Decode(e)) => {
                debug!("Skipping advertisement from {address}: {e}");
                None
            }
            Err(e) => {
                error!("Failed to process advertisement from {address}: {e}");
                None
            }
        }
    }

    fn targets_reached(&self) -> bool {
        self.policy
            .targets()
            .is_some_and(|targets| self.pipeline.registry().all_seen(targets))
    }

    fn log_snapshot(&self) {
        let readings: BTreeMap<MacAddress, HumanReadable> = self
            .pipeline
            .registry()
            .snapshot()
            .into_iter()
            .map(|(address, measurement)| (address, measurement.human_readable()))
            .collect();

        match serde_json::to_string(&readings) {
            Ok(json) => info!(devices = readings.len(), "Latest readings: {json}"),
            Err(e) => error!("Failed to serialize registry snapshot: {e}"),
        }
    }
}

/// Build a controller from `options` and run it to completion.
pub async fn run_with(
    options: &Options,
    scanner: &dyn Scanner,
    sink: &mut dyn BrokerSink,
    shutdown: CancellationToken,
) -> Result<RunSummary, RunError> {
    let policy = options.policy()?;
    let mut controller = ScanCycleController::new(
        options.pipeline(),
        policy,
        options.backend,
        scanner,
        sink,
        shutdown,
    );
    controller.run().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::{Offline, PublishFuture};
    use crate::queue::OutboundMessage;
    use crate::test_utils::{RecordingSink, TEST_MAC, advertisement};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const OTHER_MAC: MacAddress = MacAddress([0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);

    // 21.5 °C, 45 % humidity, 90 % battery
    const PAYLOAD: [u8; 6] = [0x54, 0x00, 0x5A, 0x05, 0x95, 0x2D];

    const CONFIG_TOPIC: &str = "homeassistant/sensor/AABBCCDDEEFF_T/config";
    const STATE_TOPIC: &str = "homeassistant/sensor/AABBCCDDEEFF_T/state";

    /// Replays one scripted batch per `start_scan` call.
    ///
    /// The sender stays open until the receiver is dropped, so a cycle ends on
    /// its window unless `close_after_batch` is set. Once the script is
    /// exhausted, `stop` is cancelled.
    struct FakeScanner {
        batches: Mutex<VecDeque<Result<Vec<Advertisement>, ScanError>>>,
        starts: AtomicUsize,
        stop: Option<CancellationToken>,
        close_after_batch: bool,
    }

    impl FakeScanner {
        fn new(batches: Vec<Result<Vec<Advertisement>, ScanError>>) -> Self {
            Self {
                batches: Mutex::new(batches.into()),
                starts: AtomicUsize::new(0),
                stop: None,
                close_after_batch: false,
            }
        }

        fn once(advertisements: Vec<Advertisement>) -> Self {
            Self::new(vec![Ok(advertisements)])
        }

        fn stopping(mut self, token: &CancellationToken) -> Self {
            self.stop = Some(token.clone());
            self
        }
    }

    impl Scanner for FakeScanner {
        fn start_scan(
            &self,
            _backend: Backend,
        ) -> Pin<
            Box<dyn Future<Output = Result<mpsc::Receiver<Advertisement>, ScanError>> + Send + '_>,
        > {
            self.starts.fetch_add(1, Ordering::SeqCst);
            let next = self.batches.lock().unwrap().pop_front();
            let close = self.close_after_batch;
            Box::pin(async move {
                let batch = match next {
                    Some(batch) => batch?,
                    None => {
                        if let Some(stop) = &self.stop {
                            stop.cancel();
                        }
                        Vec::new()
                    }
                };
                let (tx, rx) = mpsc::channel(batch.len().max(1));
                tokio::spawn(async move {
                    for advertisement in batch {
                        if tx.send(advertisement).await.is_err() {
                            return;
                        }
                    }
                    if !close {
                        tx.closed().await;
                    }
                });
                Ok(rx)
            })
        }
    }

    /// Reports no connection for the first `outage` drains.
    struct RecoveringSink {
        outage: AtomicUsize,
        inner: RecordingSink,
    }

    impl BrokerSink for RecoveringSink {
        fn is_available(&self) -> bool {
            self.outage
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_err()
        }

        fn publish<'a>(&'a mut self, message: &'a OutboundMessage) -> PublishFuture<'a> {
            self.inner.publish(message)
        }
    }

    fn controller<'a>(
        policy: TerminationPolicy,
        scanner: &'a FakeScanner,
        sink: &'a mut dyn BrokerSink,
        shutdown: CancellationToken,
    ) -> ScanCycleController<'a> {
        ScanCycleController::new(
            Pipeline::default(),
            policy,
            Backend::default(),
            scanner,
            sink,
            shutdown,
        )
    }

    fn count(topics: &[String], topic: &str) -> usize {
        topics.iter().filter(|t| *t == topic).count()
    }

    #[tokio::test(start_paused = true)]
    async fn cycle_publishes_discovery_then_state() {
        let scanner = FakeScanner::once(vec![advertisement(TEST_MAC, &PAYLOAD)]);
        let mut sink = RecordingSink::new();
        let mut controller = controller(
            TerminationPolicy::FixedWindow(Duration::from_secs(5)),
            &scanner,
            &mut sink,
            CancellationToken::new(),
        );

        let summary = controller.run().await.unwrap();

        assert_eq!(controller.state(), CycleState::Terminated);
        assert!(controller.pipeline().queue().is_empty());
        assert_eq!(
            summary,
            RunSummary {
                cycles: 1,
                devices: 1,
                delivered: 2,
            }
        );
        assert_eq!(sink.topics(), [CONFIG_TOPIC, STATE_TOPIC]);

        let state: serde_json::Value = serde_json::from_str(&sink.published[1].payload).unwrap();
        assert_eq!(state["raw_values"]["temperature_value"], 21.5);
        assert_eq!(state["human_readable"]["humidity"], "45%");
    }

    #[tokio::test(start_paused = true)]
    async fn cycle_report_counts_distinct_devices() {
        let scanner = FakeScanner::once(vec![
            advertisement(TEST_MAC, &PAYLOAD),
            advertisement(OTHER_MAC, &PAYLOAD),
            advertisement(TEST_MAC, &PAYLOAD),
        ]);
        let mut sink = RecordingSink::new();
        let mut controller = controller(
            TerminationPolicy::FixedWindow(Duration::from_secs(5)),
            &scanner,
            &mut sink,
            CancellationToken::new(),
        );

        let report = controller.run_cycle().await.unwrap();

        assert_eq!(report.outcome, CycleOutcome::Observed(2));
        assert_eq!(report.delivered, 5);
        assert!(!report.cancelled);
        assert_eq!(controller.state(), CycleState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_window_reports_no_devices() {
        let scanner = FakeScanner::once(vec![]);
        let mut sink = RecordingSink::new();
        let mut controller = controller(
            TerminationPolicy::FixedWindow(Duration::from_secs(5)),
            &scanner,
            &mut sink,
            CancellationToken::new(),
        );

        let started = Instant::now();
        let report = controller.run_cycle().await.unwrap();

        assert_eq!(report.outcome, CycleOutcome::NoDevices);
        assert_eq!(report.delivered, 0);
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert!(sink.published.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn undecodable_advertisements_are_skipped() {
        let scanner = FakeScanner::once(vec![
            advertisement(OTHER_MAC, &[0x54, 0x00]),
            advertisement(TEST_MAC, &PAYLOAD),
        ]);
        let mut sink = RecordingSink::new();
        let mut controller = controller(
            TerminationPolicy::FixedWindow(Duration::from_secs(5)),
            &scanner,
            &mut sink,
            CancellationToken::new(),
        );

        let report = controller.run_cycle().await.unwrap();

        assert_eq!(report.outcome, CycleOutcome::Observed(1));
        assert!(!controller.pipeline().registry().contains(&OTHER_MAC));
        assert_eq!(sink.topics(), [CONFIG_TOPIC, STATE_TOPIC]);
    }

    #[tokio::test(start_paused = true)]
    async fn until_all_seen_stops_early() {
        let timeout = Duration::from_secs(120);
        let scanner = FakeScanner::once(vec![
            advertisement(TEST_MAC, &PAYLOAD),
            advertisement(OTHER_MAC, &PAYLOAD),
        ]);
        let mut sink = RecordingSink::new();
        let mut controller = controller(
            TerminationPolicy::UntilAllSeen {
                targets: BTreeSet::from([TEST_MAC, OTHER_MAC]),
                timeout,
            },
            &scanner,
            &mut sink,
            CancellationToken::new(),
        );

        let started = Instant::now();
        let summary = controller.run().await.unwrap();

        assert!(started.elapsed() < timeout);
        assert_eq!(summary.cycles, 1);
        assert_eq!(summary.devices, 2);
        assert_eq!(scanner.starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn until_all_seen_gives_up_at_timeout() {
        let timeout = Duration::from_secs(120);
        let scanner = FakeScanner::once(vec![advertisement(TEST_MAC, &PAYLOAD)]);
        let mut sink = RecordingSink::new();
        let mut controller = controller(
            TerminationPolicy::UntilAllSeen {
                targets: BTreeSet::from([TEST_MAC, OTHER_MAC]),
                timeout,
            },
            &scanner,
            &mut sink,
            CancellationToken::new(),
        );

        let started = Instant::now();
        let summary = controller.run().await.unwrap();

        assert!(started.elapsed() >= timeout);
        assert_eq!(summary.cycles, 1);
        assert_eq!(summary.devices, 1);
        assert_eq!(controller.state(), CycleState::Terminated);
        // what was seen is still published
        assert_eq!(sink.topics(), [CONFIG_TOPIC, STATE_TOPIC]);
    }

    #[tokio::test(start_paused = true)]
    async fn continuous_announces_each_device_once() {
        let shutdown = CancellationToken::new();
        let batch = || Ok(vec![advertisement(TEST_MAC, &PAYLOAD)]);
        let scanner = FakeScanner::new(vec![batch(), batch(), batch()]).stopping(&shutdown);
        let mut sink = RecordingSink::new();
        let mut controller = controller(
            TerminationPolicy::Continuous(Duration::from_secs(5)),
            &scanner,
            &mut sink,
            shutdown,
        );

        let summary = controller.run().await.unwrap();

        // three scripted cycles plus the one interrupted by shutdown
        assert_eq!(summary.cycles, 4);
        assert_eq!(summary.devices, 1);
        assert_eq!(summary.delivered, 4);
        let topics = sink.topics();
        assert_eq!(count(&topics, CONFIG_TOPIC), 1);
        assert_eq!(count(&topics, STATE_TOPIC), 3);
        assert_eq!(topics[0], CONFIG_TOPIC);
    }

    #[tokio::test(start_paused = true)]
    async fn continuous_retries_after_scan_failure() {
        let shutdown = CancellationToken::new();
        let scanner = FakeScanner::new(vec![
            Err(ScanError::Bluetooth("adapter powered off".to_string())),
            Ok(vec![advertisement(TEST_MAC, &PAYLOAD)]),
        ])
        .stopping(&shutdown);
        let mut sink = RecordingSink::new();
        let mut controller = controller(
            TerminationPolicy::Continuous(Duration::from_secs(5)),
            &scanner,
            &mut sink,
            shutdown,
        );

        let summary = controller.run().await.unwrap();

        assert_eq!(scanner.starts.load(Ordering::SeqCst), 3);
        assert_eq!(summary.cycles, 2);
        assert_eq!(sink.topics(), [CONFIG_TOPIC, STATE_TOPIC]);
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_run_fails_when_scan_cannot_start() {
        let scanner = FakeScanner::new(vec![Err(ScanError::Bluetooth(
            "no adapter".to_string(),
        ))]);
        let mut sink = RecordingSink::new();
        let mut controller = controller(
            TerminationPolicy::FixedWindow(Duration::from_secs(5)),
            &scanner,
            &mut sink,
            CancellationToken::new(),
        );

        let result = controller.run().await;

        assert!(matches!(result, Err(RunError::Scan(ScanError::Bluetooth(_)))));
        assert_eq!(controller.state(), CycleState::Terminated);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_interrupts_scan_and_drains() {
        let shutdown = CancellationToken::new();
        let scanner = FakeScanner::once(vec![advertisement(TEST_MAC, &PAYLOAD)]);
        let mut sink = RecordingSink::new();
        let window = Duration::from_secs(60);

        let trigger = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let mut controller = controller(
            TerminationPolicy::Continuous(window),
            &scanner,
            &mut sink,
            shutdown,
        );
        let started = Instant::now();
        let summary = controller.run().await.unwrap();

        assert!(started.elapsed() < window);
        assert_eq!(summary.cycles, 1);
        assert_eq!(controller.state(), CycleState::Terminated);
        assert_eq!(sink.topics(), [CONFIG_TOPIC, STATE_TOPIC]);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_scanner_channel_ends_cycle() {
        let mut scanner = FakeScanner::once(vec![advertisement(TEST_MAC, &PAYLOAD)]);
        scanner.close_after_batch = true;
        let mut sink = RecordingSink::new();
        let window = Duration::from_secs(60);
        let mut controller = controller(
            TerminationPolicy::FixedWindow(window),
            &scanner,
            &mut sink,
            CancellationToken::new(),
        );

        let started = Instant::now();
        let report = controller.run_cycle().await.unwrap();

        assert!(started.elapsed() < window);
        assert_eq!(report.outcome, CycleOutcome::Observed(1));
    }

    #[tokio::test(start_paused = true)]
    async fn unavailable_broker_keeps_messages_queued() {
        let scanner = FakeScanner::once(vec![advertisement(TEST_MAC, &PAYLOAD)]);
        let mut sink = Offline;
        let mut controller = controller(
            TerminationPolicy::FixedWindow(Duration::from_secs(5)),
            &scanner,
            &mut sink,
            CancellationToken::new(),
        );

        let summary = controller.run().await.unwrap();

        assert_eq!(summary.delivered, 0);
        assert_eq!(
            controller.pipeline().queue().topics().collect::<Vec<_>>(),
            [CONFIG_TOPIC, STATE_TOPIC]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn run_with_applies_options() {
        let options = Options::try_parse_from([
            "switchbot-meter-bridge",
            "--mode",
            "fixed-window",
            "--discovery-prefix",
            "ha",
            "--alias",
            "AA:BB:CC:DD:EE:FF=Bedroom",
        ])
        .unwrap();
        let scanner = FakeScanner::once(vec![advertisement(TEST_MAC, &PAYLOAD)]);
        let mut sink = RecordingSink::new();

        let summary = run_with(&options, &scanner, &mut sink, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.cycles, 1);
        assert_eq!(
            sink.topics(),
            [
                "ha/sensor/AABBCCDDEEFF_T/config",
                "ha/sensor/AABBCCDDEEFF_T/state"
            ]
        );
        let config: serde_json::Value = serde_json::from_str(&sink.published[0].payload).unwrap();
        assert_eq!(config["name"], "Bedroom");
    }

    #[tokio::test(start_paused = true)]
    async fn continuous_waits_out_window_when_scanner_closes() {
        let shutdown = CancellationToken::new();
        let mut scanner = FakeScanner::new(vec![]);
        scanner.close_after_batch = true;
        let mut sink = RecordingSink::new();

        let trigger = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(12)).await;
            trigger.cancel();
        });

        let mut controller = controller(
            TerminationPolicy::Continuous(Duration::from_secs(5)),
            &scanner,
            &mut sink,
            shutdown,
        );
        let summary = tokio::time::timeout(Duration::from_secs(60), controller.run())
            .await
            .unwrap()
            .unwrap();

        // restarted at 0s, 5s and 10s, interrupted at 12s
        assert_eq!(scanner.starts.load(Ordering::SeqCst), 3);
        assert_eq!(summary.cycles, 3);
        assert_eq!(controller.state(), CycleState::Terminated);
    }

    #[tokio::test(start_paused = true)]
    async fn continuous_drains_while_scan_keeps_failing() {
        let shutdown = CancellationToken::new();
        let failure = || Err(ScanError::Bluetooth("adapter powered off".to_string()));
        let scanner = FakeScanner::new(vec![
            Ok(vec![advertisement(TEST_MAC, &PAYLOAD)]),
            failure(),
            failure(),
            failure(),
        ]);
        let mut sink = RecoveringSink {
            outage: AtomicUsize::new(1),
            inner: RecordingSink::new(),
        };

        let trigger = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(7)).await;
            trigger.cancel();
        });

        let mut controller = controller(
            TerminationPolicy::Continuous(Duration::from_secs(5)),
            &scanner,
            &mut sink,
            shutdown,
        );
        let summary = controller.run().await.unwrap();

        // the only scan ran while the broker was down
        assert_eq!(summary.cycles, 1);
        assert_eq!(summary.delivered, 2);
        assert_eq!(scanner.starts.load(Ordering::SeqCst), 2);
        drop(controller);
        assert_eq!(sink.inner.topics(), [CONFIG_TOPIC, STATE_TOPIC]);
    }

    #[test]
    fn options_defaults() {
        let options = Options::try_parse_from(["switchbot-meter-bridge"]).unwrap();
        assert_eq!(options.mode, Mode::Continuous);
        assert_eq!(options.window, Duration::from_secs(5));
        assert_eq!(options.timeout, Duration::from_secs(120));
        assert_eq!(options.queue_capacity, DEFAULT_QUEUE_CAPACITY);
        assert_eq!(
            options.policy().unwrap(),
            TerminationPolicy::Continuous(Duration::from_secs(5))
        );
    }

    #[test]
    fn options_until_all_seen_policy() {
        let options = Options::try_parse_from([
            "switchbot-meter-bridge",
            "--mode",
            "until-all-seen",
            "--target",
            "aa:bb:cc:dd:ee:ff",
            "--target",
            "11-22-33-44-55-66",
            "--timeout",
            "30s",
        ])
        .unwrap();

        assert_eq!(
            options.policy().unwrap(),
            TerminationPolicy::UntilAllSeen {
                targets: BTreeSet::from([TEST_MAC, OTHER_MAC]),
                timeout: Duration::from_secs(30),
            }
        );
    }

    #[test]
    fn options_until_all_seen_requires_targets() {
        let options =
            Options::try_parse_from(["switchbot-meter-bridge", "--mode", "until-all-seen"]).unwrap();
        assert!(matches!(options.policy(), Err(RunError::Config(_))));
    }

    #[test]
    fn options_reject_bad_target() {
        let result =
            Options::try_parse_from(["switchbot-meter-bridge", "--target", "not-a-mac"]);
        assert!(result.is_err());
    }

    #[test]
    fn options_mqtt_config() {
        let options = Options::try_parse_from([
            "switchbot-meter-bridge",
            "--mqtt-host",
            "broker.local",
            "--mqtt-port",
            "8883",
            "--mqtt-timeout",
            "2s",
        ])
        .unwrap();

        let config = options.mqtt_config().unwrap().unwrap();
        assert_eq!(config.host, "broker.local");
        assert_eq!(config.port, 8883);
        assert_eq!(config.timeout, Duration::from_secs(2));
        assert_eq!(config.keep_alive, MQTT_KEEP_ALIVE);
    }

    #[test]
    fn options_mqtt_password_requires_username() {
        let options = Options::try_parse_from([
            "switchbot-meter-bridge",
            "--mqtt-host",
            "broker.local",
            "--mqtt-password",
            "secret",
        ])
        .unwrap();
        assert!(matches!(options.mqtt_config(), Err(RunError::Config(_))));

        let options = Options::try_parse_from([
            "switchbot-meter-bridge",
            "--mqtt-host",
            "broker.local",
            "--mqtt-username",
            "bridge",
        ])
        .unwrap();
        let config = options.mqtt_config().unwrap().unwrap();
        assert_eq!(config.username.as_deref(), Some("bridge"));
        assert_eq!(config.password, None);
    }
}
