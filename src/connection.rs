// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Recovering AMQP Connection
//!
//! [`Connection`] owns the dial lifecycle of one broker endpoint and every
//! [`Channel`] opened on it. A background task watches the close notification
//! of the live protocol connection; when it fires the connection enters
//! [`ConnectionState::Reconnecting`], redials with the configured backoff, opens
//! a fresh protocol channel for every owned [`Channel`] and replays their
//! recorded topology before going back to [`ConnectionState::Connected`].
//!
//! Each owned channel is watched as well: a channel closed by the broker while
//! the connection stays up is reopened on the live connection and replayed
//! the same way.
//!
//! The watcher keeps the connection alive. Dropping every [`Connection`]
//! handle does not stop recovery of the channels opened on it; only
//! [`Connection::close`] does.
//!
//! ```text
//! Connected --close notification--> Reconnecting --redial + replay--> Connected
//!     |                                  |
//!     +------------ close() -------------+-----> Closed
//! ```

use crate::{
    backoff::{BackoffPolicy, FixedBackoff},
    channel::Channel,
    driver::LapinDialer,
    errors::AmqpError,
    protocol::{Dialer, ProtocolChannel, ProtocolConnection},
};
use parking_lot::RwLock;
use std::{
    sync::{Arc, Weak},
    time::Duration,
};
use tokio::{
    select,
    sync::{mpsc::UnboundedReceiver, watch, Mutex},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const DEFAULT_RECOVERY_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_CONNECTION_NAME: &str = "amqpx";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Reconnecting,
    /// Terminal.
    Closed,
}

/// Tuning of a [`Connection`].
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub(crate) connection_name: Option<String>,
    pub(crate) recovery_backoff: Arc<dyn BackoffPolicy>,
    pub(crate) recovery_max_attempts: u32,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            connection_name: None,
            recovery_backoff: Arc::new(FixedBackoff::constant(DEFAULT_RECOVERY_INTERVAL)),
            recovery_max_attempts: 0,
        }
    }
}

impl ConnectionOptions {
    /// Name announced to the broker and used in logs.
    pub fn with_connection_name(mut self, name: &str) -> Self {
        self.connection_name = Some(name.to_owned());
        self
    }

    /// Wait between two failed redials. Defaults to a constant 5s.
    pub fn with_recovery_backoff(mut self, backoff: Arc<dyn BackoffPolicy>) -> Self {
        self.recovery_backoff = backoff;
        self
    }

    /// Number of redials after which the connection is given up and closed.
    /// `0` retries forever, which is the default.
    pub fn with_recovery_max_attempts(mut self, attempts: u32) -> Self {
        self.recovery_max_attempts = attempts;
        self
    }
}

/// A broker connection that survives broker restarts and network failures.
///
/// Cloning is cheap; clones share the same connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    name: String,
    url: String,
    dialer: Arc<dyn Dialer>,
    options: ConnectionOptions,
    raw: RwLock<Arc<dyn ProtocolConnection>>,
    /// Shared by `channel()` and the reconnect loop.
    channels: Mutex<Vec<Channel>>,
    state: watch::Sender<ConnectionState>,
    shutdown: CancellationToken,
}

impl Connection {
    /// Dials `url` with the `lapin` driver.
    ///
    /// A failing initial dial is returned as is; recovery only starts once a
    /// first connection was established.
    pub async fn dial(url: &str, options: ConnectionOptions) -> Result<Connection, AmqpError> {
        let dialer = Arc::new(LapinDialer::new(options.connection_name.clone()));

        Self::dial_with(dialer, url, options).await
    }

    /// Dials `url` with a custom [`Dialer`].
    pub async fn dial_with(
        dialer: Arc<dyn Dialer>,
        url: &str,
        options: ConnectionOptions,
    ) -> Result<Connection, AmqpError> {
        let name = options
            .connection_name
            .clone()
            .unwrap_or_else(|| DEFAULT_CONNECTION_NAME.to_owned());

        let raw = match dialer.dial(url).await {
            Ok(raw) => raw,
            Err(err) => {
                error!(error = err.to_string(), name, "failure to connect");
                return Err(err);
            }
        };
        let notify = raw.notify_close();

        let (state, _) = watch::channel(ConnectionState::Connected);
        let inner = Arc::new(ConnectionInner {
            name,
            url: url.to_owned(),
            dialer,
            options,
            raw: RwLock::new(raw),
            channels: Mutex::new(Vec::new()),
            state,
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(watch_connection(inner.clone(), notify));

        info!(name = inner.name, "amqp connection established");

        Ok(Connection { inner })
    }

    /// Opens a new recovering channel, waiting out a reconnect in progress.
    pub async fn channel(&self) -> Result<Channel, AmqpError> {
        self.wait_connected().await?;

        let mut channels = self.inner.channels.lock().await;
        if self.is_closed() {
            return Err(AmqpError::ConnectionClosed);
        }

        let connection = self.inner.raw.read().clone();
        let raw = connection.create_channel().await?;
        let notify = raw.notify_close();
        let channel = Channel::new(raw.clone(), self.inner.state.subscribe());
        channels.push(channel.clone());

        tokio::spawn(watch_channel(
            self.inner.clone(),
            channel.clone(),
            Arc::downgrade(&raw),
            notify,
        ));

        debug!(name = self.inner.name, "channel opened");
        Ok(channel)
    }

    /// Closes the connection and every channel opened on it. Repeated calls are
    /// no-ops; a reconnect in progress is abandoned.
    pub async fn close(&self) -> Result<(), AmqpError> {
        self.inner.teardown().await
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Subscribes to state transitions.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    async fn wait_connected(&self) -> Result<(), AmqpError> {
        let mut state = self.inner.state.subscribe();
        let settled = state
            .wait_for(|state| *state != ConnectionState::Reconnecting)
            .await
            .map(|state| *state);

        match settled {
            Ok(ConnectionState::Connected) => Ok(()),
            _ => Err(AmqpError::ConnectionClosed),
        }
    }
}

/// Reconnects on every close notification of the live protocol connection.
/// Owns the connection until it is closed.
async fn watch_connection(
    connection: Arc<ConnectionInner>,
    mut notify: UnboundedReceiver<AmqpError>,
) {
    loop {
        let reason = select! {
            _ = connection.shutdown.cancelled() => return,
            reason = notify.recv() => reason,
        };

        if connection.shutdown.is_cancelled() {
            return;
        }

        let reason = reason
            .map(|err| err.to_string())
            .unwrap_or_else(|| "close notification dropped".to_owned());
        warn!(
            name = connection.name,
            reason, "amqp connection lost, reconnecting"
        );

        connection.state.send_if_modified(|state| match state {
            ConnectionState::Connected => {
                *state = ConnectionState::Reconnecting;
                true
            }
            _ => false,
        });

        for channel in connection.channels.lock().await.iter() {
            channel.interrupt();
        }

        match connection.reconnect().await {
            Some(next) => notify = next,
            None => return,
        }
    }
}

/// Reopens `channel` whenever the broker closes the protocol channel `raw`
/// it runs on. Returns once the channel or the connection is closed. A
/// reconnect moving the channel elsewhere ends it as well, as the reconnect
/// spawns its own watcher.
async fn watch_channel(
    connection: Arc<ConnectionInner>,
    channel: Channel,
    mut raw: Weak<dyn ProtocolChannel>,
    mut notify: UnboundedReceiver<AmqpError>,
) {
    loop {
        let reason = select! {
            _ = connection.shutdown.cancelled() => return,
            _ = channel.closed() => return,
            reason = notify.recv() => reason,
        };

        let Some(reason) = reason else {
            return;
        };
        if channel.is_closed() || !channel.runs_on(&raw) {
            return;
        }

        warn!(
            name = connection.name,
            reason = reason.to_string(),
            "amqp channel closed by the broker, reopening"
        );
        channel.interrupt();

        match connection.reopen(&channel, &raw).await {
            Some((next, next_notify)) => {
                raw = next;
                notify = next_notify;
            }
            None => return,
        }
    }
}

impl ConnectionInner {
    /// Redials until success, shutdown, or exhaustion of the attempts budget.
    async fn reconnect(self: &Arc<Self>) -> Option<UnboundedReceiver<AmqpError>> {
        let mut attempt: u32 = 0;

        loop {
            if self.shutdown.is_cancelled() {
                return None;
            }

            match self.redial().await {
                Ok(notify) => {
                    let recovered = self.state.send_if_modified(|state| match state {
                        ConnectionState::Reconnecting => {
                            *state = ConnectionState::Connected;
                            true
                        }
                        _ => false,
                    });

                    if !recovered {
                        let raw = self.raw.read().clone();
                        let _ = raw.close().await;
                        return None;
                    }

                    info!(name = self.name, attempt, "amqp connection recovered");
                    return Some(notify);
                }
                Err(err) => {
                    let max = self.options.recovery_max_attempts;
                    if max > 0 && attempt + 1 >= max {
                        error!(
                            error = err.to_string(),
                            name = self.name,
                            attempts = attempt + 1,
                            "giving up reconnecting"
                        );
                        let _ = self.teardown().await;
                        return None;
                    }

                    let delay = self.options.recovery_backoff.delay(attempt + 1);
                    warn!(
                        error = err.to_string(),
                        name = self.name,
                        attempt,
                        ?delay,
                        "failure to reconnect, retrying"
                    );

                    select! {
                        _ = self.shutdown.cancelled() => return None,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// Dials a new connection, opens one protocol channel per owned channel
    /// and replays their topology. Failing to open a channel fails the whole
    /// redial.
    async fn redial(self: &Arc<Self>) -> Result<UnboundedReceiver<AmqpError>, AmqpError> {
        let raw = self.dialer.dial(&self.url).await?;
        let notify = raw.notify_close();

        let mut channels = self.channels.lock().await;
        channels.retain(|channel| !channel.is_closed());

        let mut fresh = Vec::with_capacity(channels.len());
        for _ in channels.iter() {
            match raw.create_channel().await {
                Ok(channel) => fresh.push(channel),
                Err(err) => {
                    let _ = raw.close().await;
                    return Err(err);
                }
            }
        }

        *self.raw.write() = raw;

        for (channel, raw) in channels.iter().zip(fresh) {
            let channel_notify = raw.notify_close();
            let report = channel.recover(raw.clone()).await;
            if report.failed > 0 {
                warn!(
                    name = self.name,
                    failed = report.failed,
                    "channel partially recovered"
                );
            }

            tokio::spawn(watch_channel(
                self.clone(),
                channel.clone(),
                Arc::downgrade(&raw),
                channel_notify,
            ));
        }

        Ok(notify)
    }

    /// Opens a protocol channel on the live connection for `channel`, whose
    /// protocol channel `dead` was closed by the broker, and replays its
    /// topology. Retries with the recovery backoff; gives up once the
    /// connection is no longer connected or the channel moved on, leaving it
    /// to the reconnect.
    async fn reopen(
        &self,
        channel: &Channel,
        dead: &Weak<dyn ProtocolChannel>,
    ) -> Option<(Weak<dyn ProtocolChannel>, UnboundedReceiver<AmqpError>)> {
        let mut attempt: u32 = 0;

        loop {
            attempt = attempt.saturating_add(1);
            let delay = self.options.recovery_backoff.delay(attempt);
            select! {
                _ = self.shutdown.cancelled() => return None,
                _ = channel.closed() => return None,
                _ = tokio::time::sleep(delay) => {}
            }

            let _channels = self.channels.lock().await;
            if *self.state.borrow() != ConnectionState::Connected
                || channel.is_closed()
                || !channel.runs_on(dead)
            {
                return None;
            }

            let raw = self.raw.read().clone();
            match raw.create_channel().await {
                Ok(raw) => {
                    let notify = raw.notify_close();
                    let report = channel.recover(raw.clone()).await;
                    info!(
                        name = self.name,
                        attempt,
                        replayed = report.replayed,
                        failed = report.failed,
                        "amqp channel reopened"
                    );
                    return Some((Arc::downgrade(&raw), notify));
                }
                Err(err) => {
                    warn!(
                        error = err.to_string(),
                        name = self.name,
                        attempt,
                        "failure to reopen channel, retrying"
                    );
                }
            }
        }
    }

    async fn teardown(&self) -> Result<(), AmqpError> {
        let first = self.state.send_if_modified(|state| match state {
            ConnectionState::Closed => false,
            _ => {
                *state = ConnectionState::Closed;
                true
            }
        });
        self.shutdown.cancel();

        if !first {
            return Ok(());
        }

        let channels = std::mem::take(&mut *self.channels.lock().await);
        for channel in channels {
            if let Err(err) = channel.close().await {
                debug!(error = err.to_string(), "error closing channel");
            }
        }

        let raw = self.raw.read().clone();
        let result = match raw.is_closed() {
            true => Ok(()),
            false => raw.close().await,
        };

        info!(name = self.name, "amqp connection closed");
        result
    }
}
