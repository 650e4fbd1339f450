//! Connection session: owns the link to one BMS and drives the
//! request/response exchanges over it.
//!
//! # State transitions
//! ```text
//! Disconnected -> Connecting                (connect())
//! Connecting   -> Ready | Reconnecting      (link up / connect failed)
//! Ready        -> AwaitingResponse          (request sent)
//! AwaitingResponse -> Ready                 (complete reply or timeout)
//! Ready | AwaitingResponse -> Reconnecting  (link lost, too many failures)
//! Reconnecting -> Connecting                (after the backoff delay)
//! any          -> Closing -> Disconnected   (close())
//! ```
//!
//! Every wait is bounded by one of the configured timeouts. Errors of a
//! single exchange never leave the session: they are logged, counted and
//! turned into state transitions.

use crate::error::{Error, Result};
use crate::protocol::{Address, Frame};
use crate::reassembler::Reassembler;
use crate::registry::{self, Command, Status, TelemetryUpdate};
use crate::telemetry::{Aggregator, TelemetrySnapshot};
use crate::transport::{DeviceAddress, Transport};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, sleep_until, timeout, timeout_at, Instant};

/// Settings of one session. All options act independently.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub address: DeviceAddress,
    /// Source address put into requests
    pub host_address: Address,
    /// Commands requested on every poll cycle, in this order
    pub commands: Vec<Command>,
    pub poll_interval: Duration,
    pub response_timeout: Duration,
    pub connect_timeout: Duration,
    /// Bound for the graceful disconnect on close
    pub disconnect_timeout: Duration,
    pub reconnect_backoff_min: Duration,
    pub reconnect_backoff_max: Duration,
    /// Delay before reconnecting after too many consecutive failures
    pub escalation_backoff: Duration,
    pub max_consecutive_failures: u32,
    /// Inactivity after which the BMS is expected to be asleep
    pub sleep_after: Duration,
}

impl SessionConfig {
    pub fn new(address: DeviceAddress) -> Self {
        Self {
            address,
            host_address: Address::UartHost,
            commands: Command::ALL.to_vec(),
            poll_interval: Duration::from_secs(10),
            response_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(15),
            disconnect_timeout: Duration::from_secs(2),
            reconnect_backoff_min: Duration::from_secs(1),
            reconnect_backoff_max: Duration::from_secs(60),
            escalation_backoff: Duration::from_secs(120),
            max_consecutive_failures: 3,
            sleep_after: Duration::from_secs(60 * 60),
        }
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("response timeout", self.response_timeout),
            ("connect timeout", self.connect_timeout),
            ("disconnect timeout", self.disconnect_timeout),
            ("minimum reconnect backoff", self.reconnect_backoff_min),
        ] {
            if value.is_zero() {
                return Err(Error::Config(format!("{name} must not be zero")));
            }
        }
        if self.reconnect_backoff_min > self.reconnect_backoff_max {
            return Err(Error::Config(format!(
                "minimum reconnect backoff {:?} exceeds maximum {:?}",
                self.reconnect_backoff_min, self.reconnect_backoff_max
            )));
        }
        if self.max_consecutive_failures == 0 {
            return Err(Error::Config(
                "at least one failure has to be tolerated".to_string(),
            ));
        }
        if self.commands.is_empty() {
            return Err(Error::Config("no commands to poll".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Ready,
    AwaitingResponse,
    Reconnecting,
    Closing,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Counters for monitoring the health of a session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStatistics {
    pub connects: u64,
    pub connect_failures: u64,
    pub requests: u64,
    pub responses: u64,
    pub timeouts: u64,
    /// Bytes thrown away while resynchronizing on the frame start
    pub corrupt_bytes: u64,
    /// Valid frames answering another command than the pending one
    pub unmatched_frames: u64,
    pub unknown_frames: u64,
    /// Numbered frames received twice or outside the expected range
    pub duplicate_frames: u64,
    pub decode_errors: u64,
    pub link_losses: u64,
    pub escalations: u64,
    pub last_error: Option<String>,
}

/// Outcome of one poll cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollReport {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

#[derive(Debug)]
struct PendingRequest {
    command: Command,
    sent_at: Instant,
    expected_frames: usize,
    /// Keyed by frame number, always 1 for single frame replies
    frames: BTreeMap<u8, Frame>,
}

#[derive(Debug)]
struct Backoff {
    min: Duration,
    max: Duration,
    current: Option<Duration>,
}

impl Backoff {
    fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max,
            current: None,
        }
    }

    fn next(&mut self) -> Duration {
        let delay = match self.current {
            None => self.min,
            Some(current) => current.saturating_mul(2).min(self.max),
        };
        self.current = Some(delay);
        delay
    }

    fn reset(&mut self) {
        self.current = None;
    }
}

async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        let stop = *shutdown.borrow_and_update();
        // a dropped sender stops the session as well
        if stop || shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Runs `future` unless shutdown is requested first.
async fn or_shutdown<F: Future>(
    shutdown: &mut watch::Receiver<bool>,
    future: F,
) -> Option<F::Output> {
    tokio::select! {
        output = future => Some(output),
        _ = shutdown_requested(shutdown) => None,
    }
}

pub struct Session<T: Transport> {
    transport: T,
    config: SessionConfig,
    state: SessionState,
    link: Option<T::Link>,
    reassembler: Reassembler,
    pending: Option<PendingRequest>,
    status: Option<Status>,
    last_response: Option<Instant>,
    consecutive_failures: u32,
    backoff: Backoff,
    reconnect_delay: Duration,
    statistics: SessionStatistics,
}

impl<T: Transport> Session<T> {
    pub fn new(transport: T, config: SessionConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            transport,
            backoff: Backoff::new(config.reconnect_backoff_min, config.reconnect_backoff_max),
            reconnect_delay: Duration::ZERO,
            config,
            state: SessionState::Disconnected,
            link: None,
            reassembler: Reassembler::new(),
            pending: None,
            status: None,
            last_response: None,
            consecutive_failures: 0,
            statistics: SessionStatistics::default(),
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn statistics(&self) -> SessionStatistics {
        SessionStatistics {
            corrupt_bytes: self.reassembler.discarded() as u64,
            ..self.statistics.clone()
        }
    }

    /// Delay before the next connection attempt while `Reconnecting`.
    pub fn reconnect_delay(&self) -> Duration {
        self.reconnect_delay
    }

    /// Time since the last complete response, `None` before the first one.
    pub fn idle_for(&self) -> Option<Duration> {
        self.last_response.map(|instant| instant.elapsed())
    }

    /// Whether the BMS has been silent long enough to have gone to sleep.
    pub fn is_probably_asleep(&self) -> bool {
        self.idle_for()
            .is_some_and(|idle| idle >= self.config.sleep_after)
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            log::debug!("{}: {} -> {}", self.config.address, self.state, state);
            self.state = state;
        }
    }

    fn schedule_reconnect(&mut self, delay: Duration) {
        self.reconnect_delay = delay;
        self.set_state(SessionState::Reconnecting);
    }

    /// Establishes the link and subscribes to notifications.
    pub async fn connect(&mut self) -> Result<()> {
        self.set_state(SessionState::Connecting);
        log::info!("Connecting to {}", self.config.address);
        let result = match timeout(
            self.config.connect_timeout,
            self.transport.connect(&self.config.address),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(self.config.connect_timeout)),
        };
        match result {
            Ok(link) => {
                self.link = Some(link);
                self.reassembler.clear();
                self.backoff.reset();
                self.consecutive_failures = 0;
                self.statistics.connects += 1;
                self.set_state(SessionState::Ready);
                log::info!("Connected to {}", self.config.address);
                Ok(())
            }
            Err(err) => {
                let delay = self.backoff.next();
                log::warn!(
                    "Connection to {} failed ({err}), retrying in {delay:?}",
                    self.config.address
                );
                self.statistics.connect_failures += 1;
                self.statistics.last_error = Some(err.to_string());
                self.schedule_reconnect(delay);
                Err(err)
            }
        }
    }

    /// Sends one request and collects its complete, validated reply.
    pub async fn request(&mut self, command: Command) -> Result<Vec<Frame>> {
        if self.state != SessionState::Ready || self.link.is_none() {
            return Err(Error::LinkLost);
        }
        let expected_frames = command
            .expected_frames(self.status.as_ref())
            .ok_or(Error::StatusRequired)?;
        if expected_frames == 0 {
            return Ok(Vec::new());
        }
        let request = command.request(self.config.host_address)?;

        // bytes of an earlier, timed out reply must not be taken for this one
        self.reassembler.clear();
        self.pending = Some(PendingRequest {
            command,
            sent_at: Instant::now(),
            expected_frames,
            frames: BTreeMap::new(),
        });
        self.set_state(SessionState::AwaitingResponse);
        self.statistics.requests += 1;

        log::trace!("write bytes: {request:02X?}");
        let result = match self.link.as_mut() {
            Some(link) => self.transport.write(link, &request).await,
            None => Err(Error::LinkLost),
        };
        let result = match result {
            Ok(()) => self.collect_response().await,
            Err(err) => {
                log::warn!("Write of {command} failed: {err}");
                Err(Error::LinkLost)
            }
        };
        let pending = self.pending.take();

        match result {
            Ok(frames) => {
                if let Some(pending) = pending {
                    log::trace!(
                        "{command} answered after {:?}",
                        pending.sent_at.elapsed()
                    );
                }
                self.last_response = Some(Instant::now());
                self.statistics.responses += 1;
                self.set_state(SessionState::Ready);
                Ok(frames)
            }
            Err(Error::LinkLost) => {
                self.link_lost();
                Err(Error::LinkLost)
            }
            Err(err) => {
                if let Error::Timeout(_) = err {
                    self.statistics.timeouts += 1;
                }
                self.set_state(SessionState::Ready);
                Err(err)
            }
        }
    }

    async fn collect_response(&mut self) -> Result<Vec<Frame>> {
        let deadline = match &self.pending {
            Some(pending) => pending.sent_at + self.config.response_timeout,
            None => return Err(Error::LinkLost),
        };
        loop {
            while let Some(frame) = self.reassembler.try_extract() {
                if let Some(frames) = self.accept(frame) {
                    return Ok(frames);
                }
            }
            let Some(link) = self.link.as_mut() else {
                return Err(Error::LinkLost);
            };
            match timeout_at(deadline, self.transport.notification(link)).await {
                Ok(Some(chunk)) => self.reassembler.feed(&chunk),
                Ok(None) => return Err(Error::LinkLost),
                Err(_) => return Err(Error::Timeout(self.config.response_timeout)),
            }
        }
    }

    /// Files `frame` under the pending request, returning all frames in
    /// frame number order once every number of the reply is present.
    fn accept(&mut self, frame: Frame) -> Option<Vec<Frame>> {
        let pending = self.pending.as_mut()?;
        if frame.command != pending.command.id() {
            match Command::try_from(frame.command) {
                Ok(other) => {
                    log::debug!(
                        "Dropping {other} reply while waiting for {}",
                        pending.command
                    );
                    self.statistics.unmatched_frames += 1;
                }
                Err(err) => {
                    log::warn!("Dropping frame: {err}");
                    self.statistics.unknown_frames += 1;
                    self.statistics.last_error = Some(err.to_string());
                }
            }
            return None;
        }
        let number = if pending.command.numbered_frames() {
            match frame.data.first() {
                Some(&n) if (1..=pending.expected_frames).contains(&usize::from(n)) => n,
                _ => {
                    log::debug!("Dropping {} frame out of range: {frame:?}", pending.command);
                    self.statistics.duplicate_frames += 1;
                    return None;
                }
            }
        } else {
            1
        };
        if pending.frames.contains_key(&number) {
            log::debug!("Dropping repeated frame {number} of {}", pending.command);
            self.statistics.duplicate_frames += 1;
            return None;
        }
        pending.frames.insert(number, frame);
        if pending.frames.len() == pending.expected_frames {
            Some(std::mem::take(&mut pending.frames).into_values().collect())
        } else {
            None
        }
    }

    fn link_lost(&mut self) {
        log::warn!("Link to {} lost", self.config.address);
        self.link = None;
        self.pending = None;
        self.statistics.link_losses += 1;
        self.statistics.last_error = Some(Error::LinkLost.to_string());
        let delay = self.backoff.next();
        self.schedule_reconnect(delay);
    }

    async fn drop_link(&mut self) {
        if let Some(link) = self.link.take() {
            log::debug!("Disconnecting from {}", self.config.address);
            match timeout(
                self.config.disconnect_timeout,
                self.transport.disconnect(link),
            )
            .await
            {
                Ok(Ok(())) => log::info!("Disconnected from {}", self.config.address),
                Ok(Err(err)) => log::warn!("Disconnect from {} failed: {err}", self.config.address),
                Err(_) => log::warn!(
                    "Disconnect from {} timed out after {:?}",
                    self.config.address,
                    self.config.disconnect_timeout
                ),
            }
        }
    }

    /// Requests `command`, decodes every reply frame and merges the result.
    async fn exchange(&mut self, command: Command, aggregator: &mut Aggregator) -> Result<()> {
        let frames = self.request(command).await?;
        let mut first_error = None;
        for frame in frames {
            match registry::decode_frame(&frame) {
                Ok(update) => {
                    if let TelemetryUpdate::Status(status) = &update {
                        self.status = Some(status.clone());
                    }
                    aggregator.apply(&self.config.address, update);
                }
                Err(err) => {
                    log::warn!("Cannot decode {frame:?}: {err}");
                    self.statistics.decode_errors += 1;
                    first_error.get_or_insert(err);
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn record_failure(&mut self, command: Command, err: Error) {
        self.statistics.last_error = Some(format!("{command}: {err}"));
        if !err.is_recoverable() {
            // the link is already on its way to Reconnecting
            return;
        }
        self.consecutive_failures += 1;
        if self.is_probably_asleep() {
            log::info!(
                "{} silent for {:?}, probably asleep until the next request wakes it",
                self.config.address,
                self.idle_for().unwrap_or_default()
            );
        }
        log::warn!(
            "{command} failed ({err}), {} consecutive failures",
            self.consecutive_failures
        );
        if self.consecutive_failures >= self.config.max_consecutive_failures {
            log::warn!(
                "Too many failures, reconnecting to {} in {:?}",
                self.config.address,
                self.config.escalation_backoff
            );
            self.statistics.escalations += 1;
            self.consecutive_failures = 0;
            self.drop_link().await;
            self.schedule_reconnect(self.config.escalation_backoff);
        }
    }

    /// One pass over the configured commands.
    ///
    /// Cell count dependent commands are preceded by a status request as
    /// long as no status is known.
    pub async fn poll(&mut self, aggregator: &mut Aggregator) -> PollReport {
        let mut commands = self.config.commands.clone();
        if self.status.is_none() && commands.iter().any(|command| command.needs_status()) {
            commands.retain(|command| *command != Command::Status);
            commands.insert(0, Command::Status);
        }

        let mut report = PollReport::default();
        for command in commands {
            if self.state != SessionState::Ready {
                break;
            }
            log::debug!("Fetching {command}");
            match self.exchange(command, aggregator).await {
                Ok(()) => {
                    report.succeeded += 1;
                    self.consecutive_failures = 0;
                }
                Err(Error::StatusRequired) => report.skipped += 1,
                Err(err) => {
                    report.failed += 1;
                    self.record_failure(command, err).await;
                }
            }
        }
        report
    }

    /// Keeps the device polled until `shutdown` turns true, reconnecting as
    /// needed. A snapshot copy is sent after every poll cycle once anything
    /// has been decoded for the device.
    pub async fn run(
        &mut self,
        aggregator: &mut Aggregator,
        snapshots: &mpsc::Sender<TelemetrySnapshot>,
        shutdown: &mut watch::Receiver<bool>,
    ) {
        let address = self.config.address;
        let interval = self.config.poll_interval;
        loop {
            let step = match self.state {
                SessionState::Disconnected | SessionState::Connecting => {
                    or_shutdown(shutdown, self.connect()).await.map(|_| ())
                }
                SessionState::Reconnecting => {
                    let delay = self.reconnect_delay;
                    log::info!("Reconnecting to {address} in {delay:?}");
                    match or_shutdown(shutdown, sleep(delay)).await {
                        Some(()) => or_shutdown(shutdown, self.connect()).await.map(|_| ()),
                        None => None,
                    }
                }
                SessionState::Ready | SessionState::AwaitingResponse => {
                    let started = Instant::now();
                    let cycle = async {
                        let report = self.poll(aggregator).await;
                        log::debug!("{address}: poll cycle {report:?}");
                        if let Some(snapshot) = aggregator.snapshot(&address) {
                            if snapshots.send(snapshot).await.is_err() {
                                log::warn!("Snapshot receiver is gone");
                            }
                        }
                        // a lost or escalated link waits for its reconnect backoff instead
                        if self.state == SessionState::Ready {
                            sleep_until(started + interval).await;
                        }
                    };
                    or_shutdown(shutdown, cycle).await
                }
                SessionState::Closing => None,
            };
            if step.is_none() {
                log::info!("Shutdown requested for {address}");
                break;
            }
        }
        self.close().await;
    }

    /// Gracefully tears the link down. The disconnect is bounded by the
    /// configured disconnect timeout.
    pub async fn close(&mut self) {
        self.set_state(SessionState::Closing);
        self.pending = None;
        self.drop_link().await;
        self.set_state(SessionState::Disconnected);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{encode, Address};
    use async_trait::async_trait;
    use std::collections::{HashMap, VecDeque};

    /// In-memory device: every write of a request queues the scripted
    /// notification chunks for its command.
    #[derive(Default)]
    struct ScriptedTransport {
        replies: HashMap<u8, Vec<Option<Vec<u8>>>>,
        queue: VecDeque<Option<Vec<u8>>>,
        failing_connects: usize,
        connects: usize,
        disconnects: usize,
        hanging_disconnect: bool,
        writes: Vec<Vec<u8>>,
    }

    impl ScriptedTransport {
        fn reply(mut self, command: Command, chunks: Vec<Vec<u8>>) -> Self {
            self.replies
                .insert(command.id(), chunks.into_iter().map(Some).collect());
            self
        }

        fn lose_link_on(mut self, command: Command) -> Self {
            self.replies.insert(command.id(), vec![None]);
            self
        }

        fn written_commands(&self) -> Vec<u8> {
            self.writes.iter().map(|request| request[2]).collect()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        type Link = ();

        async fn connect(&mut self, _address: &DeviceAddress) -> Result<()> {
            self.connects += 1;
            if self.failing_connects > 0 {
                self.failing_connects -= 1;
                return Err(Error::Transport("device not found".into()));
            }
            Ok(())
        }

        async fn write(&mut self, _link: &mut (), bytes: &[u8]) -> Result<()> {
            self.writes.push(bytes.to_vec());
            if let Some(chunks) = self.replies.get(&bytes[2]) {
                self.queue.extend(chunks.iter().cloned());
            }
            Ok(())
        }

        async fn notification(&mut self, _link: &mut ()) -> Option<Vec<u8>> {
            match self.queue.pop_front() {
                Some(chunk) => chunk,
                None => std::future::pending().await,
            }
        }

        async fn disconnect(&mut self, _link: ()) -> Result<()> {
            self.disconnects += 1;
            if self.hanging_disconnect {
                std::future::pending::<()>().await;
            }
            Ok(())
        }
    }

    fn device() -> DeviceAddress {
        DeviceAddress::new([0x17, 0x71, 0x06, 0x02, 0x0b, 0x7e])
    }

    fn config(commands: &[Command]) -> SessionConfig {
        SessionConfig {
            commands: commands.to_vec(),
            ..SessionConfig::new(device())
        }
    }

    fn bms_reply(command: Command, data: [u8; 8]) -> Vec<u8> {
        encode(Address::Bms, command.id(), &data).unwrap()
    }

    // 53.2 V, +5.0 A, 85.0 %
    fn soc_reply() -> Vec<u8> {
        bms_reply(
            Command::Soc,
            [0x02, 0x14, 0x00, 0x00, 0x75, 0x62, 0x03, 0x52],
        )
    }

    // 5 cells, 1 sensor
    fn status_reply() -> Vec<u8> {
        bms_reply(Command::Status, [0x05, 0x01, 0x00, 0x01, 0x00, 0x00, 0x10, 0x00])
    }

    async fn connected(transport: ScriptedTransport, commands: &[Command]) -> Session<ScriptedTransport> {
        let mut session = Session::new(transport, config(commands)).unwrap();
        session.connect().await.unwrap();
        assert_eq!(session.state(), SessionState::Ready);
        session
    }

    #[test]
    fn invalid_configuration_is_rejected() {
        let mut config = config(&[Command::Soc]);
        config.response_timeout = Duration::ZERO;
        assert!(matches!(
            Session::new(ScriptedTransport::default(), config),
            Err(Error::Config(_))
        ));

        let mut config = self::config(&[Command::Soc]);
        config.reconnect_backoff_min = Duration::from_secs(90);
        assert!(config.validate().is_err());

        assert!(self::config(&[]).validate().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_returns_to_ready_and_next_poll_requests_again() {
        let mut session = connected(ScriptedTransport::default(), &[Command::Soc]).await;

        let started = Instant::now();
        let result = session.request(Command::Soc).await;
        assert!(matches!(result, Err(Error::Timeout(_))));
        assert_eq!(started.elapsed(), session.config().response_timeout);
        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(session.statistics().timeouts, 1);

        let mut aggregator = Aggregator::new();
        let report = session.poll(&mut aggregator).await;
        assert_eq!(report.failed, 1);
        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(session.transport().writes.len(), 2);
        assert_eq!(session.statistics().timeouts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn pack_status_fixture_reaches_the_snapshot() {
        let reply = soc_reply();
        // delivered in two notification chunks
        let transport = ScriptedTransport::default()
            .reply(Command::Soc, vec![reply[..7].to_vec(), reply[7..].to_vec()]);
        let mut session = connected(transport, &[Command::Soc]).await;
        let mut aggregator = Aggregator::new();

        let report = session.poll(&mut aggregator).await;
        assert_eq!(report.succeeded, 1);

        let snapshot = aggregator.snapshot(&device()).unwrap();
        assert_eq!(snapshot.pack_voltage(), Some(53.2));
        assert_eq!(snapshot.pack_current(), Some(5.0));
        assert_eq!(snapshot.soc_percent(), Some(85.0));
        assert_eq!(
            session.transport().writes[0],
            [0xa5, 0x80, 0x90, 0x08, 0, 0, 0, 0, 0, 0, 0, 0, 0xbd]
        );
        assert!(session.idle_for().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn multi_frame_cell_voltages_follow_status() {
        let mut frames = bms_reply(
            Command::CellVoltages,
            [0x01, 0x0c, 0xe4, 0x0c, 0xe5, 0x0c, 0xe6, 0x00],
        );
        frames.extend(bms_reply(
            Command::CellVoltages,
            [0x02, 0x0c, 0xe7, 0x0c, 0xe8, 0x00, 0x00, 0x00],
        ));
        let transport = ScriptedTransport::default()
            .reply(Command::Status, vec![status_reply()])
            // both frames in one notification, as the Bluetooth module sends them
            .reply(Command::CellVoltages, vec![frames]);
        let mut session = connected(transport, &[Command::CellVoltages]).await;
        let mut aggregator = Aggregator::new();

        let report = session.poll(&mut aggregator).await;
        assert_eq!(report.succeeded, 2);
        assert_eq!(session.transport().written_commands(), vec![0x94, 0x95]);

        let snapshot = aggregator.snapshot(&device()).unwrap();
        assert_eq!(
            snapshot.cell_voltages,
            vec![Some(3.3), Some(3.301), Some(3.302), Some(3.303), Some(3.304)]
        );
        assert_eq!(snapshot.status.map(|status| status.cells), Some(5));
    }

    #[tokio::test(start_paused = true)]
    async fn foreign_and_corrupt_frames_are_dropped() {
        let mut corrupted = soc_reply();
        corrupted[5] ^= 0xff;
        let unknown = encode(Address::Bms, 0x42, &[0; 8]).unwrap();
        let transport = ScriptedTransport::default().reply(
            Command::Soc,
            vec![corrupted, unknown, status_reply(), soc_reply()],
        );
        let mut session = connected(transport, &[Command::Soc]).await;

        let frames = session.request(Command::Soc).await.unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].command, 0x90);
        let statistics = session.statistics();
        assert_eq!(statistics.unknown_frames, 1);
        assert_eq!(statistics.unmatched_frames, 1);
        assert_eq!(statistics.corrupt_bytes, 13);
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn link_loss_moves_to_reconnecting() {
        let transport = ScriptedTransport::default().lose_link_on(Command::Soc);
        let mut session = connected(transport, &[Command::Soc, Command::Status]).await;
        let mut aggregator = Aggregator::new();

        let report = session.poll(&mut aggregator).await;
        assert_eq!(report.failed, 1);
        assert_eq!(session.state(), SessionState::Reconnecting);
        assert_eq!(session.statistics().link_losses, 1);
        assert_eq!(session.reconnect_delay(), Duration::from_secs(1));
        // status is not requested on a lost link
        assert_eq!(session.transport().written_commands(), vec![0x90]);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_failures_escalate_to_reconnect() {
        let mut config = config(&[Command::Soc, Command::Status, Command::ErrorCode]);
        config.max_consecutive_failures = 2;
        let mut session = Session::new(ScriptedTransport::default(), config).unwrap();
        session.connect().await.unwrap();
        let mut aggregator = Aggregator::new();

        let report = session.poll(&mut aggregator).await;
        assert_eq!(report.failed, 2);
        assert_eq!(session.state(), SessionState::Reconnecting);
        assert_eq!(session.reconnect_delay(), session.config().escalation_backoff);
        assert_eq!(session.statistics().escalations, 1);
        assert_eq!(session.transport().disconnects, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_failures_back_off_exponentially() {
        let transport = ScriptedTransport {
            failing_connects: 3,
            ..Default::default()
        };
        let mut session = Session::new(transport, config(&[Command::Soc])).unwrap();
        for expected in [1, 2, 4] {
            assert!(session.connect().await.is_err());
            assert_eq!(session.state(), SessionState::Reconnecting);
            assert_eq!(session.reconnect_delay(), Duration::from_secs(expected));
        }
        session.connect().await.unwrap();
        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(session.statistics().connect_failures, 3);
        assert_eq!(session.statistics().connects, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn requests_need_a_ready_link() {
        let mut session = Session::new(ScriptedTransport::default(), config(&[Command::Soc])).unwrap();
        assert!(matches!(
            session.request(Command::Soc).await,
            Err(Error::LinkLost)
        ));
        session.connect().await.unwrap();
        assert!(matches!(
            session.request(Command::CellTemperatures).await,
            Err(Error::StatusRequired)
        ));
        assert!(session.transport().writes.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn run_publishes_and_stops_on_shutdown() {
        let transport = ScriptedTransport::default().reply(Command::Soc, vec![soc_reply()]);
        let mut session = Session::new(transport, config(&[Command::Soc])).unwrap();
        let mut aggregator = Aggregator::new();
        let (snapshots, mut received) = mpsc::channel(8);
        let (stop, mut shutdown) = watch::channel(false);

        let stopper = async {
            sleep(Duration::from_secs(25)).await;
            stop.send(true).unwrap();
        };
        tokio::join!(
            session.run(&mut aggregator, &snapshots, &mut shutdown),
            stopper
        );

        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(session.transport().disconnects, 1);
        // cycles at 0 s, 10 s and 20 s
        let mut count = 0;
        while let Ok(snapshot) = received.try_recv() {
            assert_eq!(snapshot.soc_percent(), Some(85.0));
            count += 1;
        }
        assert_eq!(count, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_interrupts_reconnect_backoff() {
        let transport = ScriptedTransport {
            failing_connects: usize::MAX,
            ..Default::default()
        };
        let mut session = Session::new(transport, config(&[Command::Soc])).unwrap();
        let mut aggregator = Aggregator::new();
        let (snapshots, _received) = mpsc::channel(1);
        let (stop, mut shutdown) = watch::channel(false);

        let stopper = async {
            sleep(Duration::from_millis(1500)).await;
            stop.send(true).unwrap();
        };
        tokio::join!(
            session.run(&mut aggregator, &snapshots, &mut shutdown),
            stopper
        );
        assert_eq!(session.state(), SessionState::Disconnected);
        // first attempt at 0 s, second after the 1 s backoff, then stopped
        // during the 2 s backoff
        assert_eq!(session.transport().connects, 2);
        assert_eq!(session.transport().disconnects, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_frame_does_not_complete_a_numbered_reply() {
        let first = bms_reply(
            Command::CellVoltages,
            [0x01, 0x0c, 0xe4, 0x0c, 0xe5, 0x0c, 0xe6, 0x00],
        );
        let second = bms_reply(
            Command::CellVoltages,
            [0x02, 0x0c, 0xe7, 0x0c, 0xe8, 0x00, 0x00, 0x00],
        );
        let transport = ScriptedTransport::default()
            .reply(Command::Status, vec![status_reply()])
            .reply(Command::CellVoltages, vec![[first.clone(), first, second].concat()]);
        let mut session = connected(transport, &[Command::CellVoltages]).await;
        let mut aggregator = Aggregator::new();

        let report = session.poll(&mut aggregator).await;
        assert_eq!(report.succeeded, 2);
        assert_eq!(session.statistics().duplicate_frames, 1);
        let snapshot = aggregator.snapshot(&device()).unwrap();
        assert_eq!(
            snapshot.cell_voltages,
            vec![Some(3.3), Some(3.301), Some(3.302), Some(3.303), Some(3.304)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn numbered_frames_are_returned_in_order() {
        let first = bms_reply(
            Command::SoftwareVersion,
            [0x01, b'V', b'1', b'.', b'2', b'.', b'3', b'-'],
        );
        let second = bms_reply(Command::SoftwareVersion, [0x02, b'r', b'c', 0, 0, 0, 0, 0]);
        let out_of_range = bms_reply(Command::SoftwareVersion, [0x03, 0, 0, 0, 0, 0, 0, 0]);
        let transport = ScriptedTransport::default().reply(
            Command::SoftwareVersion,
            vec![second, out_of_range, first],
        );
        let mut session = connected(transport, &[Command::SoftwareVersion]).await;

        let frames = session.request(Command::SoftwareVersion).await.unwrap();
        let numbers: Vec<u8> = frames.iter().map(|frame| frame.data[0]).collect();
        assert_eq!(numbers, vec![1, 2]);
        assert_eq!(session.statistics().duplicate_frames, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn silence_beyond_sleep_window_is_an_ordinary_timeout() {
        let transport = ScriptedTransport::default().reply(Command::Soc, vec![soc_reply()]);
        let mut session = connected(transport, &[Command::Soc]).await;
        let mut aggregator = Aggregator::new();
        assert_eq!(session.idle_for(), None);
        assert!(!session.is_probably_asleep());

        assert_eq!(session.poll(&mut aggregator).await.succeeded, 1);
        assert!(session.idle_for().is_some());
        assert!(!session.is_probably_asleep());

        tokio::time::advance(Duration::from_secs(3700)).await;
        assert!(session.is_probably_asleep());

        // the sleeping BMS ignores the request that wakes it
        session.transport_mut().replies.clear();
        let report = session.poll(&mut aggregator).await;
        assert_eq!(report.failed, 1);
        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(session.statistics().timeouts, 1);

        session
            .transport_mut()
            .replies
            .insert(Command::Soc.id(), vec![Some(soc_reply())]);
        let report = session.poll(&mut aggregator).await;
        assert_eq!(report.succeeded, 1);
        assert!(!session.is_probably_asleep());
        assert_eq!(session.transport().writes.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_interrupts_a_pending_exchange() {
        let transport = ScriptedTransport {
            hanging_disconnect: true,
            ..Default::default()
        };
        let mut config = config(&[Command::Soc]);
        config.response_timeout = Duration::from_secs(30);
        let mut session = Session::new(transport, config).unwrap();
        let mut aggregator = Aggregator::new();
        let (snapshots, _received) = mpsc::channel(1);
        let (stop, mut shutdown) = watch::channel(false);

        let started = Instant::now();
        let stopper = async {
            sleep(Duration::from_secs(3)).await;
            stop.send(true).unwrap();
        };
        tokio::join!(
            session.run(&mut aggregator, &snapshots, &mut shutdown),
            stopper
        );
        // stopped at 3 s, then the hanging disconnect is cut off after 2 s
        assert_eq!(started.elapsed(), Duration::from_secs(5));
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(session.statistics().timeouts, 0);
        assert_eq!(session.transport().writes.len(), 1);
        assert_eq!(session.transport().disconnects, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn close_is_bounded_by_disconnect_timeout() {
        let transport = ScriptedTransport {
            hanging_disconnect: true,
            ..Default::default()
        };
        let mut session = connected(transport, &[Command::Soc]).await;

        let started = Instant::now();
        session.close().await;
        assert_eq!(started.elapsed(), session.config().disconnect_timeout);
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(session.transport().disconnects, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn lost_link_reconnects_without_waiting_for_the_poll_interval() {
        let transport = ScriptedTransport::default().lose_link_on(Command::Soc);
        let mut session = Session::new(transport, config(&[Command::Soc])).unwrap();
        let mut aggregator = Aggregator::new();
        let (snapshots, _received) = mpsc::channel(1);
        let (stop, mut shutdown) = watch::channel(false);

        let stopper = async {
            sleep(Duration::from_millis(2500)).await;
            stop.send(true).unwrap();
        };
        tokio::join!(
            session.run(&mut aggregator, &snapshots, &mut shutdown),
            stopper
        );
        // connects at 0 s, 1 s and 2 s, each link lost on the first request
        assert_eq!(session.transport().connects, 3);
        assert_eq!(session.statistics().link_losses, 3);
        assert_eq!(session.state(), SessionState::Disconnected);
    }
}
