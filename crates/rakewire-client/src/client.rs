//! Reconnecting dashboard client.
//!
//! The client runs as one background task. It keeps the set of channels the
//! application asked for, re-issues all of them after every reconnect, and
//! reports everything that happens as [`ClientEvent`]s. When the server
//! rejects the credentials, or retries are exhausted, the client goes offline
//! and, if a [`Poller`] was supplied, keeps polling instead.

use crate::backoff::BackoffPolicy;
use crate::fallback::{Poller, DEFAULT_POLL_INTERVAL};
use crate::traits::{ClientError, Connector, Session};
use rakewire_protocol::{ClientFrame, ServerFrame};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Default interval between application heartbeats.
pub const DEFAULT_CLIENT_HEARTBEAT: Duration = Duration::from_secs(30);

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Retry schedule after an unexpected disconnect.
    pub backoff: BackoffPolicy,
    /// Heartbeat interval while connected; `None` disables heartbeats.
    pub heartbeat_interval: Option<Duration>,
    /// Interval between polls once offline.
    pub poll_interval: Duration,
    /// Capacity of the event channel.
    pub event_buffer: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            heartbeat_interval: Some(DEFAULT_CLIENT_HEARTBEAT),
            poll_interval: DEFAULT_POLL_INTERVAL,
            event_buffer: 256,
        }
    }
}

/// Something the application should know about.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Session established.
    Connected,
    /// Frame received from the server.
    Frame(ServerFrame),
    /// Session lost.
    Disconnected { reason: String },
    /// Waiting before the next connection attempt.
    Reconnecting { attempt: u32, delay: Duration },
    /// Realtime delivery has stopped for good.
    Offline,
    /// Snapshot fetched by the polling fallback.
    Polled(Value),
}

#[derive(Debug)]
enum Command {
    Subscribe(String),
    Unsubscribe(String),
    Message { channel: String, data: Value },
    Shutdown,
}

/// Handle for driving a running client.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl ClientHandle {
    /// Subscribe to a channel, now and after every reconnect.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Shutdown`] if the client has stopped.
    pub fn subscribe(&self, channel: impl Into<String>) -> Result<(), ClientError> {
        self.send(Command::Subscribe(channel.into()))
    }

    /// Stop receiving a channel.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Shutdown`] if the client has stopped.
    pub fn unsubscribe(&self, channel: impl Into<String>) -> Result<(), ClientError> {
        self.send(Command::Unsubscribe(channel.into()))
    }

    /// Broadcast `data` to the members of `channel`.
    ///
    /// Messages issued while disconnected are dropped.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Shutdown`] if the client has stopped.
    pub fn send_message(&self, channel: impl Into<String>, data: Value) -> Result<(), ClientError> {
        self.send(Command::Message {
            channel: channel.into(),
            data,
        })
    }

    /// Close the session and stop the client.
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }

    fn send(&self, command: Command) -> Result<(), ClientError> {
        self.commands.send(command).map_err(|_| ClientError::Shutdown)
    }
}

enum Exit {
    Shutdown,
    Lost(ClientError),
}

/// Background task state.
pub struct ReconnectionClient {
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    poller: Option<Arc<dyn Poller>>,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::Sender<ClientEvent>,
    subscriptions: BTreeSet<String>,
}

impl ReconnectionClient {
    /// Start a client task.
    ///
    /// Returns the handle, the event stream and the task itself.
    #[must_use]
    pub fn spawn(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
        poller: Option<Arc<dyn Poller>>,
    ) -> (ClientHandle, mpsc::Receiver<ClientEvent>, JoinHandle<()>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(config.event_buffer.max(1));

        let client = Self {
            config,
            connector,
            poller,
            commands: command_rx,
            events: event_tx,
            subscriptions: BTreeSet::new(),
        };
        let task = tokio::spawn(client.run());

        (ClientHandle { commands: command_tx }, event_rx, task)
    }

    async fn run(mut self) {
        let mut attempt: u32 = 0;

        loop {
            let connected = self.connector.connect().await;
            let lost = match connected {
                Ok(session) => {
                    attempt = 0;
                    info!(transport = self.connector.name(), "Connected");
                    self.emit(ClientEvent::Connected).await;

                    match self.drive(session).await {
                        Exit::Shutdown => {
                            info!("Client shut down");
                            return;
                        }
                        Exit::Lost(e) => {
                            warn!(error = %e, "Connection lost");
                            self.emit(ClientEvent::Disconnected {
                                reason: e.to_string(),
                            })
                            .await;
                            e
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Connection attempt failed");
                    e
                }
            };

            if lost.is_auth_failure() {
                warn!("Credentials rejected, not reconnecting");
                return self.go_offline().await;
            }

            attempt += 1;
            let Some(delay) = self.config.backoff.delay(attempt) else {
                warn!(attempts = attempt - 1, "Max reconnection attempts reached");
                return self.go_offline().await;
            };

            info!(
                attempt,
                max = self.config.backoff.max_attempts,
                delay_ms = delay.as_millis() as u64,
                "Reconnecting"
            );
            self.emit(ClientEvent::Reconnecting { attempt, delay }).await;

            if !self.idle(delay).await {
                return;
            }
        }
    }

    /// Pump one session until it ends.
    async fn drive(&mut self, session: Session) -> Exit {
        let Session {
            mut sink,
            mut stream,
        } = session;

        for channel in &self.subscriptions {
            if let Err(e) = sink.send(&ClientFrame::subscribe(channel.as_str())).await {
                return Exit::Lost(e);
            }
        }
        if !self.subscriptions.is_empty() {
            debug!(channels = self.subscriptions.len(), "Restored subscriptions");
        }

        let mut heartbeat = self.config.heartbeat_interval.map(|period| {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });

        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    let frame = match command {
                        Some(Command::Subscribe(channel)) => {
                            self.subscriptions.insert(channel.clone());
                            ClientFrame::subscribe(channel)
                        }
                        Some(Command::Unsubscribe(channel)) => {
                            self.subscriptions.remove(&channel);
                            ClientFrame::unsubscribe(channel)
                        }
                        Some(Command::Message { channel, data }) => ClientFrame::message(channel, data),
                        Some(Command::Shutdown) | None => {
                            let _ = sink.close().await;
                            return Exit::Shutdown;
                        }
                    };
                    if let Err(e) = sink.send(&frame).await {
                        return Exit::Lost(e);
                    }
                }
                incoming = stream.recv() => match incoming {
                    Ok(frame) => self.emit(ClientEvent::Frame(frame)).await,
                    Err(ClientError::Protocol(e)) => {
                        warn!(error = %e, "Ignoring undecodable frame");
                    }
                    Err(e) => return Exit::Lost(e),
                },
                _ = tick(&mut heartbeat) => {
                    let frame = ClientFrame::Heartbeat {
                        timestamp: Some(unix_millis()),
                    };
                    if let Err(e) = sink.send(&frame).await {
                        return Exit::Lost(e);
                    }
                }
            }
        }
    }

    /// Wait out a backoff delay while still tracking subscription changes.
    ///
    /// Returns `false` on shutdown.
    async fn idle(&mut self, delay: Duration) -> bool {
        let deadline = tokio::time::sleep(delay);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                () = &mut deadline => return true,
                command = self.commands.recv() => {
                    if !self.apply_offline(command) {
                        return false;
                    }
                }
            }
        }
    }

    async fn go_offline(mut self) {
        self.emit(ClientEvent::Offline).await;

        let Some(poller) = self.poller.clone() else {
            info!("Offline, no polling fallback configured");
            return;
        };

        info!(interval_ms = self.config.poll_interval.as_millis() as u64, "Falling back to polling");
        let mut ticker = interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => match poller.poll().await {
                    Ok(snapshot) => self.emit(ClientEvent::Polled(snapshot)).await,
                    Err(e) if e.is_auth_failure() => {
                        warn!("Polling rejected, stopping");
                        return;
                    }
                    Err(e) => warn!(error = %e, "Poll failed"),
                },
                command = self.commands.recv() => {
                    if !self.apply_offline(command) {
                        return;
                    }
                }
            }
        }
    }

    /// Apply a command while no session is open. Returns `false` on shutdown.
    fn apply_offline(&mut self, command: Option<Command>) -> bool {
        match command {
            Some(Command::Subscribe(channel)) => {
                self.subscriptions.insert(channel);
            }
            Some(Command::Unsubscribe(channel)) => {
                self.subscriptions.remove(&channel);
            }
            Some(Command::Message { channel, .. }) => {
                debug!(channel = %channel, "Dropping message while disconnected");
            }
            Some(Command::Shutdown) | None => return false,
        }
        true
    }

    async fn emit(&self, event: ClientEvent) {
        if self.events.send(event).await.is_err() {
            debug!("Event receiver dropped");
        }
    }
}

async fn tick(ticker: &mut Option<tokio::time::Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}
