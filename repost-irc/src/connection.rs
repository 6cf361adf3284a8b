//! Self-healing IRC session.
//!
//! A [`connect`] call starts one lifecycle task per network. That task plays
//! both the Keeper (dial, start a generation, queue registration) and the
//! Cleaner (react to a failure signal, stop the generation, close the
//! socket), so generation transitions are serialized without a lock.
//!
//! ## Generations
//!
//! Each successful dial starts a new generation with its own numeric token
//! and its own [`CancellationToken`]. Two role tasks run per generation:
//!
//! - **Sender** owns the write half and the outbound queue receiver. It
//!   writes registration first, then queued messages in submission order.
//! - **Receiver** owns the read half. It decodes each line and publishes it
//!   to the inbound stream in arrival order.
//!
//! Either role raises the shared failure signal, tagged with its generation,
//! on an I/O error, a malformed line, a read timeout or a panic inside the
//! role. Signals for an older
//! generation, or raised while no generation is live, are ignored.
//!
//! Teardown cancels the generation and waits for both roles to return
//! before the next dial, so two generations never overlap. The outbound
//! receiver moves into the Sender and comes back when it exits; whatever is
//! still queued at that point is dropped.

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::FutureExt;
use tokio::io::{AsyncBufRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backoff::{Backoff, ReconnectConfig, ServerPool};
use crate::error::{Error, Result};
use crate::event::{ConnectionState, Event};
use crate::message::Message;
use crate::transport::{self, LineReader, LineWriter};

/// A peer that stays silent this long is treated as dead.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(30);

const OUTBOUND_CAPACITY: usize = 256;
const INBOUND_CAPACITY: usize = 4096;
const EVENT_CAPACITY: usize = 64;

/// Configuration for one logical network session.
#[derive(Debug, Clone)]
pub struct ConnectConfig {
    /// Network name, attached to every inbound message as `context["network"]`.
    pub network: String,
    /// Candidate servers (host:port), tried in order.
    pub servers: Vec<String>,
    /// Desired nickname.
    pub nick: String,
    /// Username (ident).
    pub user: String,
    /// Real name.
    pub realname: String,
    pub read_timeout: Duration,
    pub dial_timeout: Duration,
    pub reconnect: ReconnectConfig,
}

impl ConnectConfig {
    pub fn new(
        network: impl Into<String>,
        servers: Vec<String>,
        nick: impl Into<String>,
        user: impl Into<String>,
        realname: impl Into<String>,
    ) -> Self {
        Self {
            network: network.into(),
            servers,
            nick: nick.into(),
            user: user.into(),
            realname: realname.into(),
            read_timeout: DEFAULT_READ_TIMEOUT,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            reconnect: ReconnectConfig::default(),
        }
    }
}

/// Failure signal. `generation: None` means "whichever generation is live"
/// and is what collaborators send to force a reconnect.
#[derive(Debug)]
struct Failure {
    generation: Option<u64>,
    reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Status {
    state: ConnectionState,
    generation: Option<u64>,
}

/// A handle to a running connection. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    network: String,
    outbound: mpsc::Sender<Message>,
    failures: mpsc::UnboundedSender<Failure>,
    status: watch::Receiver<Status>,
    events: broadcast::Sender<Event>,
}

impl ConnectionHandle {
    pub fn network(&self) -> &str {
        &self.network
    }

    /// Queue a message for the current generation.
    ///
    /// Accepted while disconnected too; it goes out after the next
    /// registration unless the generation it lands in is torn down first.
    /// A message that would not serialize to exactly one line is rejected
    /// with [`Error::Malformed`] and never queued.
    pub async fn send(&self, msg: Message) -> Result<()> {
        msg.validate()?;
        self.outbound.send(msg).await.map_err(|_| Error::Closed)?;
        Ok(())
    }

    /// Parse and queue a raw protocol line.
    pub async fn send_raw(&self, line: &str) -> Result<()> {
        self.send(Message::parse(line)?).await
    }

    pub async fn privmsg(&self, target: &str, text: &str) -> Result<()> {
        self.send(Message::privmsg(target, text)).await
    }

    /// Force a teardown of the live generation and a fresh connection.
    /// A no-op when nothing is connected.
    pub fn reconnect(&self, reason: &str) {
        let _ = self.failures.send(Failure {
            generation: None,
            reason: reason.to_string(),
        });
    }

    pub fn state(&self) -> ConnectionState {
        self.status.borrow().state
    }

    /// Token of the live generation, if any.
    pub fn generation(&self) -> Option<u64> {
        self.status.borrow().generation
    }

    /// Wait until the lifecycle reaches `state`.
    pub async fn wait_for(&self, state: ConnectionState) -> Result<()> {
        let mut status = self.status.clone();
        status
            .wait_for(|s| s.state == state)
            .await
            .map_err(|_| Error::Closed)?;
        Ok(())
    }

    /// Subscribe to lifecycle events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }
}

/// Messages received from the server, across all generations, in arrival order.
#[derive(Debug)]
pub struct Inbound {
    rx: mpsc::Receiver<Message>,
}

impl Inbound {
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }
}

impl futures::Stream for Inbound {
    type Item = Message;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Message>> {
        self.rx.poll_recv(cx)
    }
}

/// Start the connection lifecycle.
///
/// Returns immediately; the first dial happens on the spawned lifecycle
/// task. The returned event receiver sees every event from the first
/// `Dialing` on. Must be called from within a tokio runtime.
///
/// Fails only when the configuration can never work (no servers, no nick).
pub fn connect(
    config: ConnectConfig,
) -> Result<(ConnectionHandle, Inbound, broadcast::Receiver<Event>)> {
    if config.network.is_empty() {
        return Err(Error::InvalidIdentity("network name must not be empty"));
    }
    if config.nick.is_empty() {
        return Err(Error::InvalidIdentity("nick must not be empty"));
    }
    if Message::nick(&config.nick).validate().is_err() || config.nick.contains(' ') {
        return Err(Error::InvalidIdentity("nick must be a single word without line breaks"));
    }
    if Message::user(&config.user, &config.realname).validate().is_err() {
        return Err(Error::InvalidIdentity(
            "user must be a single word and realname must not contain line breaks",
        ));
    }
    let pool = ServerPool::new(&config.network, config.servers.clone())?;

    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
    let (failure_tx, failure_rx) = mpsc::unbounded_channel();
    let (status_tx, status_rx) = watch::channel(Status {
        state: ConnectionState::Disconnected,
        generation: None,
    });
    let (event_tx, event_rx) = broadcast::channel(EVENT_CAPACITY);

    let handle = ConnectionHandle {
        network: config.network.clone(),
        outbound: outbound_tx,
        failures: failure_tx.clone(),
        status: status_rx,
        events: event_tx.clone(),
    };

    let lifecycle = Lifecycle {
        backoff: Backoff::new(config.reconnect.clone()),
        config,
        pool,
        outbound: Some(outbound_rx),
        inbound: inbound_tx,
        failure_tx,
        failures: failure_rx,
        status: status_tx,
        events: event_tx,
        generation: 0,
        active: None,
    };
    tokio::spawn(lifecycle.run());

    Ok((handle, Inbound { rx: inbound_rx }, event_rx))
}

/// The live generation's handles.
struct Generation {
    id: u64,
    cancel: CancellationToken,
    sender: JoinHandle<mpsc::Receiver<Message>>,
    receiver: JoinHandle<()>,
}

/// Single owner of generation state.
struct Lifecycle {
    config: ConnectConfig,
    pool: ServerPool,
    backoff: Backoff,
    /// `None` while a Sender owns it.
    outbound: Option<mpsc::Receiver<Message>>,
    inbound: mpsc::Sender<Message>,
    failure_tx: mpsc::UnboundedSender<Failure>,
    failures: mpsc::UnboundedReceiver<Failure>,
    status: watch::Sender<Status>,
    events: broadcast::Sender<Event>,
    /// Last token handed out.
    generation: u64,
    active: Option<Generation>,
}

impl Lifecycle {
    async fn run(mut self) {
        tracing::info!(network = %self.config.network, "Spawned connection lifecycle");
        loop {
            if !self.keep().await {
                break;
            }
            let reason = self.wait_for_failure().await;
            self.clean(reason).await;
            let delay = self.backoff.next_delay();
            tracing::info!(
                network = %self.config.network,
                delay_ms = delay.as_millis() as u64,
                "Disconnected, will reconnect"
            );
            self.idle(delay).await;
        }
    }

    /// Keeper: dial until a generation is live. Returns false if the
    /// outbound queue has been lost and no generation can be started.
    async fn keep(&mut self) -> bool {
        let mut attempt = 0u32;
        loop {
            attempt = attempt.saturating_add(1);
            let server = self.pool.next_server().to_string();
            self.set_status(ConnectionState::Connecting, None);
            self.emit(Event::Dialing {
                server: server.clone(),
                attempt,
            });
            tracing::info!(network = %self.config.network, %server, attempt, "Dialing");

            match transport::dial(&server, self.config.dial_timeout).await {
                Ok((reader, writer)) => {
                    self.backoff.reset();
                    return self.start_generation(server, reader, writer);
                }
                Err(e) => {
                    let retry_in = self.backoff.next_delay();
                    tracing::warn!(
                        network = %self.config.network,
                        %server,
                        attempt,
                        error = %e,
                        retry_ms = retry_in.as_millis() as u64,
                        "Dial failed, retrying"
                    );
                    self.set_status(ConnectionState::Disconnected, None);
                    self.emit(Event::DialFailed {
                        server,
                        error: e.to_string(),
                        retry_in,
                    });
                    self.idle(retry_in).await;
                }
            }
        }
    }

    fn start_generation<R, W>(
        &mut self,
        server: String,
        reader: LineReader<R>,
        writer: LineWriter<W>,
    ) -> bool
    where
        R: AsyncBufRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let Some(outbound) = self.outbound.take() else {
            tracing::error!(network = %self.config.network, "Outbound queue lost");
            return false;
        };
        // Anything raised before this point targets no generation.
        self.discard_signals();

        self.generation += 1;
        let id = self.generation;
        let cancel = CancellationToken::new();
        let ctx = RoleContext {
            network: self.config.network.clone(),
            generation: id,
            cancel: cancel.clone(),
            failures: self.failure_tx.clone(),
        };

        let registration = vec![
            Message::nick(&self.config.nick),
            Message::user(&self.config.user, &self.config.realname),
        ];
        let sender = tokio::spawn(run_sender(ctx.clone(), writer, registration, outbound));
        let receiver = tokio::spawn(run_receiver(
            ctx,
            reader,
            self.inbound.clone(),
            server.clone(),
            self.config.read_timeout,
        ));

        self.active = Some(Generation {
            id,
            cancel,
            sender,
            receiver,
        });
        self.set_status(ConnectionState::Connected, Some(id));
        self.emit(Event::Connected {
            server: server.clone(),
            generation: id,
        });
        tracing::info!(network = %self.config.network, %server, generation = id, "Connected");
        true
    }

    /// Wait for a failure signal aimed at the live generation.
    async fn wait_for_failure(&mut self) -> String {
        let Some(live) = self.active.as_ref().map(|g| g.id) else {
            return String::new();
        };
        loop {
            let Some(failure) = self.failures.recv().await else {
                // Unreachable while we hold `failure_tx`.
                return "failure channel closed".to_string();
            };
            match failure.generation {
                Some(generation) if generation != live => {
                    tracing::trace!(
                        network = %self.config.network,
                        generation,
                        live,
                        reason = %failure.reason,
                        "Ignoring failure signal from stale generation"
                    );
                }
                _ => return failure.reason,
            }
        }
    }

    /// Cleaner: stop both roles, close the socket, drop what was still queued.
    async fn clean(&mut self, reason: String) {
        let Some(generation) = self.active.take() else {
            return;
        };
        let id = generation.id;
        tracing::info!(network = %self.config.network, generation = id, %reason, "Cleaning up");
        self.set_status(ConnectionState::Draining, Some(id));
        self.emit(Event::Draining {
            generation: id,
            reason,
        });

        generation.cancel.cancel();
        // Both roles must be gone before the next generation starts; their
        // socket halves drop with them.
        if let Err(e) = generation.receiver.await {
            tracing::error!(network = %self.config.network, generation = id, error = %e, "Receiver task failed");
        }
        let mut dropped = 0;
        match generation.sender.await {
            Ok(mut outbound) => {
                dropped = discard_queued(&mut outbound);
                self.outbound = Some(outbound);
            }
            Err(e) => {
                tracing::error!(network = %self.config.network, generation = id, error = %e, "Sender task failed");
            }
        }
        if dropped > 0 {
            tracing::warn!(
                network = %self.config.network,
                generation = id,
                dropped,
                "Dropped queued outbound messages"
            );
        }

        self.set_status(ConnectionState::Disconnected, None);
        self.emit(Event::Disconnected {
            generation: id,
            dropped,
        });
    }

    /// Sleep, treating any failure signal that arrives meanwhile as a no-op.
    async fn idle(&mut self, delay: Duration) {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return,
                Some(failure) = self.failures.recv() => {
                    tracing::trace!(
                        network = %self.config.network,
                        reason = %failure.reason,
                        "No live generation, ignoring failure signal"
                    );
                }
            }
        }
    }

    fn discard_signals(&mut self) {
        while let Ok(failure) = self.failures.try_recv() {
            tracing::trace!(
                network = %self.config.network,
                reason = %failure.reason,
                "No live generation, ignoring failure signal"
            );
        }
    }

    fn set_status(&self, state: ConnectionState, generation: Option<u64>) {
        self.status.send_replace(Status { state, generation });
    }

    fn emit(&self, event: Event) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

fn discard_queued(outbound: &mut mpsc::Receiver<Message>) -> usize {
    let mut dropped = 0;
    while outbound.try_recv().is_ok() {
        dropped += 1;
    }
    dropped
}

/// What a role task knows about its generation.
#[derive(Clone)]
struct RoleContext {
    network: String,
    generation: u64,
    cancel: CancellationToken,
    failures: mpsc::UnboundedSender<Failure>,
}

impl RoleContext {
    /// Raise the failure signal, unless this generation is already stopping.
    fn fail(&self, reason: String) {
        if self.cancel.is_cancelled() {
            return;
        }
        let _ = self.failures.send(Failure {
            generation: Some(self.generation),
            reason,
        });
    }
}

/// Sender role. Returns the outbound receiver when it stops, including
/// after a panic, which is turned into a failure signal.
async fn run_sender<W: AsyncWrite + Unpin>(
    ctx: RoleContext,
    writer: LineWriter<W>,
    registration: Vec<Message>,
    mut outbound: mpsc::Receiver<Message>,
) -> mpsc::Receiver<Message> {
    tracing::debug!(network = %ctx.network, generation = ctx.generation, "Spawned sender");
    let sent = AssertUnwindSafe(send_loop(&ctx, writer, registration, &mut outbound))
        .catch_unwind()
        .await;
    if sent.is_err() {
        tracing::error!(network = %ctx.network, generation = ctx.generation, "Sender panicked");
        ctx.fail("sender panicked".to_string());
    }
    tracing::debug!(network = %ctx.network, generation = ctx.generation, "Closing sender");
    outbound
}

async fn send_loop<W: AsyncWrite + Unpin>(
    ctx: &RoleContext,
    mut writer: LineWriter<W>,
    registration: Vec<Message>,
    outbound: &mut mpsc::Receiver<Message>,
) {
    let mut pending: VecDeque<Message> = registration.into();

    loop {
        let msg = match pending.pop_front() {
            Some(msg) if !ctx.cancel.is_cancelled() => msg,
            Some(_) => break,
            None => {
                tokio::select! {
                    biased;
                    _ = ctx.cancel.cancelled() => break,
                    msg = outbound.recv() => match msg {
                        Some(msg) => msg,
                        None => {
                            // Every handle is gone; nothing more will be queued.
                            ctx.cancel.cancelled().await;
                            break;
                        }
                    },
                }
            }
        };

        let written = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => break,
            written = writer.write_message(&msg) => written,
        };
        match written {
            Ok(()) => tracing::debug!(network = %ctx.network, "--> {msg}"),
            Err(e) => {
                tracing::warn!(
                    network = %ctx.network,
                    generation = ctx.generation,
                    error = %e,
                    "Error writing message"
                );
                ctx.fail(format!("write failed: {e}"));
                break;
            }
        }
    }
}

/// Receiver role. A panic is turned into a failure signal.
async fn run_receiver<R: AsyncBufRead + Unpin>(
    ctx: RoleContext,
    reader: LineReader<R>,
    inbound: mpsc::Sender<Message>,
    server: String,
    read_timeout: Duration,
) {
    tracing::debug!(network = %ctx.network, generation = ctx.generation, "Spawned receiver");
    let received = AssertUnwindSafe(receive_loop(&ctx, reader, inbound, server, read_timeout))
        .catch_unwind()
        .await;
    if received.is_err() {
        tracing::error!(network = %ctx.network, generation = ctx.generation, "Receiver panicked");
        ctx.fail("receiver panicked".to_string());
    }
    tracing::debug!(network = %ctx.network, generation = ctx.generation, "Closing receiver");
}

async fn receive_loop<R: AsyncBufRead + Unpin>(
    ctx: &RoleContext,
    mut reader: LineReader<R>,
    inbound: mpsc::Sender<Message>,
    server: String,
    read_timeout: Duration,
) {

    loop {
        let read = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => break,
            read = tokio::time::timeout(read_timeout, reader.read_message()) => read,
        };
        let mut msg = match read {
            Ok(Ok(msg)) => msg,
            Ok(Err(e)) => {
                tracing::warn!(
                    network = %ctx.network,
                    generation = ctx.generation,
                    error = %e,
                    "Error reading message"
                );
                ctx.fail(e.to_string());
                break;
            }
            Err(_) => {
                let e = Error::ReadTimeout(read_timeout);
                tracing::warn!(
                    network = %ctx.network,
                    generation = ctx.generation,
                    error = %e,
                    "Read timed out"
                );
                ctx.fail(e.to_string());
                break;
            }
        };
        tracing::debug!(network = %ctx.network, "<-- {msg}");

        msg.context.insert("network".to_string(), ctx.network.clone());
        msg.context.insert("server".to_string(), server.clone());

        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => break,
            published = inbound.send(msg) => {
                if published.is_err() {
                    tracing::trace!(network = %ctx.network, "Inbound stream dropped, discarding message");
                }
            }
        }
    }
}
