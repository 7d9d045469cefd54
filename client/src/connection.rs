//! Connection manager for the progress stream.
//!
//! A single driver task owns the connection and every timer attached to
//! it: connect timeout, reconnect backoff, heartbeat and staleness checks.
//! Timers are `select!` branches of the phase that needs them, so leaving
//! a phase (disconnect, drop, shutdown) cancels them with it. Callers hold
//! a cheap [`ConnectionManager`] handle that sends commands to the driver
//! and reads its published [`ConnectionSnapshot`].
//!
//! ```text
//! Idle --subscribe--> Connect --ok--> Live --drop--> Backoff --delay--> Connect
//!                        |                             ^
//!                        +--timeout / error------------+
//! ```
//!
//! After `max_reconnect_attempts` consecutive failed reconnects the driver
//! reports `ConnectionFailed` and goes idle until the next subscribe.

use std::sync::Arc;
use std::time::Duration;

use brand_audit_protocol::ClientMessage;
use brand_audit_protocol::ServerMessage;
use chrono::Utc;
use strum_macros::Display;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio::time::MissedTickBehavior;
use tokio::time::interval_at;
use tokio_util::sync::CancellationToken;

use crate::dispatcher::EventDispatcher;
use crate::dispatcher::JobScope;
use crate::dispatcher::StreamEvent;
use crate::error::ApiError;
use crate::heartbeat::ConnectionQuality;
use crate::heartbeat::HeartbeatMonitor;
use crate::heartbeat::Staleness;
use crate::notify::Notice;
use crate::notify::Notifier;
use crate::transport::StreamConnector;
use crate::transport::StreamSession;
use crate::transport::TransportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub connect_timeout: Duration,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
    pub max_reconnect_attempts: u32,
    pub heartbeat_interval: Duration,
    pub staleness_check_interval: Duration,
    /// Silence after which quality drops to `Poor`.
    pub degraded_after: Duration,
    /// Silence after which the connection is presented as disconnected.
    pub stale_after: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(20),
            reconnect_base: Duration::from_millis(1000),
            reconnect_max: Duration::from_millis(10_000),
            max_reconnect_attempts: 5,
            heartbeat_interval: Duration::from_secs(10),
            staleness_check_interval: Duration::from_secs(5),
            degraded_after: Duration::from_secs(30),
            stale_after: Duration::from_secs(60),
        }
    }
}

impl ConnectionConfig {
    /// `min(base * 2^attempt, max)`.
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        self.reconnect_base
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.reconnect_max)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionSnapshot {
    pub status: ConnectionStatus,
    pub subscribed_job_id: Option<String>,
    pub reconnect_attempts: u32,
    pub last_inbound_at: Option<Instant>,
    pub latency: Option<Duration>,
    pub quality: ConnectionQuality,
    /// `status`, except a connection that has gone stale is presented as
    /// `Disconnected` before the transport notices.
    pub presented_status: ConnectionStatus,
    /// Set when the reconnect budget ran out; cleared by the next subscribe.
    pub failed: bool,
}

impl Default for ConnectionSnapshot {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            subscribed_job_id: None,
            reconnect_attempts: 0,
            last_inbound_at: None,
            latency: None,
            quality: ConnectionQuality::Unknown,
            presented_status: ConnectionStatus::Disconnected,
            failed: false,
        }
    }
}

#[derive(Debug)]
enum Command {
    Subscribe(String),
    Unsubscribe(String),
    Disconnect,
}

/// Handle to the connection driver. Clones share the same connection.
#[derive(Debug, Clone)]
pub struct ConnectionManager {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionSnapshot>,
    cancel: CancellationToken,
}

impl ConnectionManager {
    /// Spawns the driver task and installs the manager as the dispatcher's
    /// job scope. Must be called inside a tokio runtime.
    pub fn spawn(
        connector: Arc<dyn StreamConnector>,
        dispatcher: Arc<EventDispatcher>,
        notifier: Arc<dyn Notifier>,
        config: ConnectionConfig,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionSnapshot::default());
        let cancel = CancellationToken::new();

        dispatcher.set_job_scope(Arc::new(CommandScope {
            commands: tx.downgrade(),
        }));

        let driver = Driver {
            heartbeat: HeartbeatMonitor::new(config.degraded_after, config.stale_after),
            connector,
            dispatcher,
            notifier,
            config,
            commands: rx,
            state: state_tx,
            cancel: cancel.clone(),
            status: ConnectionStatus::Disconnected,
            job_id: None,
            reconnect_attempts: 0,
            failed: false,
            quality: ConnectionQuality::Unknown,
            last_ping_ts: 0,
        };
        tokio::spawn(driver.run());

        Self {
            commands: tx,
            state: state_rx,
            cancel,
        }
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            tracing::debug!("connection driver has stopped; command dropped");
        }
    }

    /// Opens the connection if needed and joins `job_id`, leaving any
    /// previously joined job. Also resets an exhausted reconnect budget.
    pub fn subscribe_to_job(&self, job_id: impl Into<String>) {
        self.send(Command::Subscribe(job_id.into()));
    }

    /// Leaves `job_id` if connected; local subscription state is cleared
    /// either way.
    pub fn unsubscribe_from_job(&self, job_id: impl Into<String>) {
        self.send(Command::Unsubscribe(job_id.into()));
    }

    /// Tears the connection down and suppresses pending reconnects.
    pub fn disconnect(&self) {
        self.send(Command::Disconnect);
    }

    /// Stops the driver task for good.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.state.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<ConnectionSnapshot> {
        self.state.clone()
    }
}

/// Routes dispatcher join/leave requests to the driver without keeping it
/// alive.
struct CommandScope {
    commands: mpsc::WeakUnboundedSender<Command>,
}

impl CommandScope {
    fn send(&self, command: Command) {
        match self.commands.upgrade() {
            Some(tx) => {
                if tx.send(command).is_err() {
                    tracing::debug!("connection driver has stopped; command dropped");
                }
            }
            None => tracing::debug!("connection manager dropped; command ignored"),
        }
    }
}

impl JobScope for CommandScope {
    fn join(&self, job_id: &str) {
        self.send(Command::Subscribe(job_id.to_string()));
    }

    fn leave(&self, job_id: &str) {
        self.send(Command::Unsubscribe(job_id.to_string()));
    }
}

enum Phase {
    Idle,
    Connect,
    Backoff(Duration),
    Live(StreamSession),
    Exit,
}

struct Driver {
    connector: Arc<dyn StreamConnector>,
    dispatcher: Arc<EventDispatcher>,
    notifier: Arc<dyn Notifier>,
    config: ConnectionConfig,
    commands: mpsc::UnboundedReceiver<Command>,
    state: watch::Sender<ConnectionSnapshot>,
    cancel: CancellationToken,
    status: ConnectionStatus,
    job_id: Option<String>,
    reconnect_attempts: u32,
    failed: bool,
    heartbeat: HeartbeatMonitor,
    quality: ConnectionQuality,
    last_ping_ts: i64,
}

impl Driver {
    async fn run(mut self) {
        let mut phase = Phase::Idle;
        loop {
            phase = match phase {
                Phase::Idle => self.idle().await,
                Phase::Connect => self.connect().await,
                Phase::Backoff(delay) => self.backoff(delay).await,
                Phase::Live(session) => self.live(session).await,
                Phase::Exit => break,
            };
        }
        self.set_status(ConnectionStatus::Disconnected);
        tracing::debug!("connection driver stopped");
    }

    async fn idle(&mut self) -> Phase {
        loop {
            let command = tokio::select! {
                _ = self.cancel.cancelled() => return Phase::Exit,
                command = self.commands.recv() => command,
            };
            match command {
                None => return Phase::Exit,
                Some(Command::Subscribe(job_id)) => {
                    self.job_id = Some(job_id);
                    self.reconnect_attempts = 0;
                    self.failed = false;
                    return Phase::Connect;
                }
                Some(Command::Unsubscribe(job_id)) => self.clear_job(&job_id),
                Some(Command::Disconnect) => {
                    self.job_id = None;
                    self.publish_state();
                }
            }
        }
    }

    async fn connect(&mut self) -> Phase {
        self.set_status(ConnectionStatus::Connecting);
        tracing::debug!(attempt = self.reconnect_attempts, "opening progress stream");

        let connector = Arc::clone(&self.connector);
        let timeout = self.config.connect_timeout;
        let attempt = tokio::time::timeout(timeout, async move { connector.connect().await });
        tokio::pin!(attempt);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Phase::Exit,
                result = &mut attempt => {
                    return match result {
                        Ok(Ok(session)) => self.on_connected(session),
                        Ok(Err(err)) => self.connection_lost(&err),
                        Err(_) => self.connection_lost(&TransportError::Timeout(timeout)),
                    };
                }
                command = self.commands.recv() => match command {
                    None => return Phase::Exit,
                    Some(Command::Subscribe(job_id)) => {
                        self.job_id = Some(job_id);
                        self.reconnect_attempts = 0;
                        self.failed = false;
                        self.publish_state();
                    }
                    Some(Command::Unsubscribe(job_id)) => self.clear_job(&job_id),
                    Some(Command::Disconnect) => {
                        self.job_id = None;
                        self.reconnect_attempts = 0;
                        self.set_status(ConnectionStatus::Disconnected);
                        return Phase::Idle;
                    }
                },
            }
        }
    }

    async fn backoff(&mut self, delay: Duration) -> Phase {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Phase::Exit,
                _ = &mut sleep => return Phase::Connect,
                command = self.commands.recv() => match command {
                    None => return Phase::Exit,
                    Some(Command::Subscribe(job_id)) => {
                        self.job_id = Some(job_id);
                        self.reconnect_attempts = 0;
                        self.failed = false;
                        return Phase::Connect;
                    }
                    Some(Command::Unsubscribe(job_id)) => self.clear_job(&job_id),
                    Some(Command::Disconnect) => {
                        tracing::debug!("disconnect requested; pending reconnect cancelled");
                        self.job_id = None;
                        self.reconnect_attempts = 0;
                        self.publish_state();
                        return Phase::Idle;
                    }
                },
            }
        }
    }

    async fn live(&mut self, mut session: StreamSession) -> Phase {
        let heartbeat_every = self.config.heartbeat_interval;
        let check_every = self.config.staleness_check_interval;
        let mut heartbeat = interval_at(Instant::now() + heartbeat_every, heartbeat_every);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut staleness = interval_at(Instant::now() + check_every, check_every);
        staleness.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Phase::Exit,
                command = self.commands.recv() => match command {
                    None => return Phase::Exit,
                    Some(Command::Subscribe(job_id)) => self.switch_job(&session, job_id),
                    Some(Command::Unsubscribe(job_id)) => {
                        if self.job_id.as_deref() == Some(job_id.as_str()) {
                            send_or_log(&session, ClientMessage::LeaveAnalysis { analysis_id: job_id.clone() });
                        }
                        self.clear_job(&job_id);
                    }
                    Some(Command::Disconnect) => {
                        if let Some(job_id) = self.job_id.take() {
                            send_or_log(&session, ClientMessage::LeaveAnalysis { analysis_id: job_id });
                        }
                        drop(session);
                        self.reconnect_attempts = 0;
                        self.set_status(ConnectionStatus::Disconnected);
                        tracing::info!("progress stream disconnected");
                        return Phase::Idle;
                    }
                },
                message = session.recv() => match message {
                    Some(message) => self.on_message(message),
                    None => {
                        drop(session);
                        return self.connection_lost(&TransportError::Closed);
                    }
                },
                _ = heartbeat.tick() => {
                    let timestamp = Utc::now().timestamp_millis().max(self.last_ping_ts + 1);
                    self.last_ping_ts = timestamp;
                    self.heartbeat.ping_sent(timestamp);
                    if session.send(ClientMessage::Ping { timestamp }).is_err() {
                        drop(session);
                        return self.connection_lost(&TransportError::Closed);
                    }
                }
                _ = staleness.tick() => self.check_staleness(),
            }
        }
    }

    fn on_connected(&mut self, session: StreamSession) -> Phase {
        tracing::info!(
            after_attempts = self.reconnect_attempts,
            job_id = ?self.job_id,
            "progress stream connected"
        );
        self.reconnect_attempts = 0;
        self.failed = false;
        self.heartbeat.reset();
        self.quality = ConnectionQuality::Unknown;
        self.set_status(ConnectionStatus::Connected);

        if let Some(job_id) = &self.job_id {
            send_or_log(
                &session,
                ClientMessage::JoinAnalysis {
                    analysis_id: job_id.clone(),
                },
            );
        }
        Phase::Live(session)
    }

    /// Handles an unexpected drop or a failed connect attempt.
    fn connection_lost(&mut self, err: &TransportError) -> Phase {
        self.set_status(ConnectionStatus::Disconnected);

        if self.reconnect_attempts >= self.config.max_reconnect_attempts {
            let attempts = self.reconnect_attempts;
            tracing::error!(attempts, "giving up on progress stream: {err}");
            self.failed = true;
            self.publish_state();
            self.dispatcher
                .publish(&StreamEvent::ConnectionFailed { attempts });
            self.notifier
                .notify(Notice::from_api_error(&ApiError::connection_failed(attempts)));
            return Phase::Idle;
        }

        let delay = self.config.reconnect_delay(self.reconnect_attempts);
        self.reconnect_attempts += 1;
        tracing::warn!(
            attempt = self.reconnect_attempts,
            delay_ms = delay.as_millis() as u64,
            "progress stream lost, reconnecting: {err}"
        );
        self.publish_state();
        Phase::Backoff(delay)
    }

    fn switch_job(&mut self, session: &StreamSession, job_id: String) {
        if self.job_id.as_deref() == Some(job_id.as_str()) {
            return;
        }
        if let Some(previous) = self.job_id.take() {
            send_or_log(
                session,
                ClientMessage::LeaveAnalysis {
                    analysis_id: previous,
                },
            );
        }
        send_or_log(
            session,
            ClientMessage::JoinAnalysis {
                analysis_id: job_id.clone(),
            },
        );
        self.job_id = Some(job_id);
        self.publish_state();
    }

    fn clear_job(&mut self, job_id: &str) {
        if self.job_id.as_deref() == Some(job_id) {
            self.job_id = None;
            self.publish_state();
        }
    }

    fn on_message(&mut self, message: ServerMessage) {
        self.heartbeat.record_inbound();
        match message {
            ServerMessage::Connected(info) => {
                self.dispatcher.publish(&StreamEvent::Connected(info));
            }
            ServerMessage::Pong { timestamp } => {
                let latency = self
                    .heartbeat
                    .record_pong(timestamp, Utc::now().timestamp_millis());
                tracing::trace!(latency_ms = latency.as_millis() as u64, "pong");
                self.dispatcher.publish(&StreamEvent::Pong { latency });
            }
            ServerMessage::ProgressUpdate(update) => {
                let Some(job_id) = update.analysis_id.clone().or_else(|| self.job_id.clone())
                else {
                    tracing::debug!("progress update with no job to attribute it to");
                    return;
                };
                self.dispatcher
                    .publish(&StreamEvent::ProgressUpdate { job_id, update });
            }
        }
        // Traffic after silence clears staleness.
        self.heartbeat.take_staleness_change();
        self.refresh_quality();
    }

    fn check_staleness(&mut self) {
        if let Some(change) = self.heartbeat.take_staleness_change()
            && change != Staleness::Fresh
        {
            let silent_for = self.heartbeat.silent_for().unwrap_or_default();
            tracing::warn!(
                silent_ms = silent_for.as_millis() as u64,
                staleness = %change,
                "no inbound traffic on progress stream"
            );
            self.dispatcher
                .publish(&StreamEvent::ConnectionStale { silent_for });
        }
        self.refresh_quality();
    }

    fn refresh_quality(&mut self) {
        let quality = self.heartbeat.quality();
        if quality != self.quality {
            self.quality = quality;
            self.dispatcher.publish(&StreamEvent::QualityChanged(quality));
        }
        self.publish_state();
    }

    fn set_status(&mut self, status: ConnectionStatus) {
        if status != self.status {
            self.status = status;
            self.dispatcher.publish(&StreamEvent::StatusChanged(status));
        }
        self.publish_state();
    }

    fn publish_state(&self) {
        let connected = self.status == ConnectionStatus::Connected;
        let stale = connected && self.heartbeat.staleness() == Staleness::Stale;
        self.state.send_replace(ConnectionSnapshot {
            status: self.status,
            subscribed_job_id: self.job_id.clone(),
            reconnect_attempts: self.reconnect_attempts,
            last_inbound_at: self.heartbeat.last_inbound_at(),
            latency: self.heartbeat.latency(),
            quality: if connected {
                self.quality
            } else {
                ConnectionQuality::Unknown
            },
            presented_status: if stale {
                ConnectionStatus::Disconnected
            } else {
                self.status
            },
            failed: self.failed,
        });
    }
}

fn send_or_log(session: &StreamSession, message: ClientMessage) {
    if let Err(err) = session.send(message) {
        tracing::debug!("stream message not sent: {err}");
    }
}
