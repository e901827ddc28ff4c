//! Reliable request/response layer over the datagram endpoint.
//!
//! Three workers cooperate over shared per-peer state:
//!
//! - the **input** worker polls the endpoint, decodes datagrams and feeds
//!   them to the handler mailbox (undecodable packets are logged and
//!   dropped);
//! - the **handler** worker runs the per-envelope state machine: sequence
//!   dedup, cached-response replay, response matching, ping answering;
//! - the **bumper** worker wakes on a fixed interval and advances every
//!   retry and silence timer, retransmitting, pinging quiet peers, and
//!   tearing down peers that stopped answering.
//!
//! Requests surface to the transport's user as [`ReceivedReq`] handles; a
//! submitted request returns a [`SentReq`] whose response arrives on a
//! one-shot channel keyed by sequence number.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex as StdMutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{oneshot, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use nf_proto::{
    Address, Envelope, Message, MessageBody, MessageStep, MessageTag, MessageType,
};

use crate::cooldown::{BinaryExpConfig, BinaryExpCooldown, CooldownTick, LinearConfig, LinearCooldown};
use crate::endpoint::DatagramEndpoint;
use crate::mailbox::{mailbox, MailboxReceiver, MailboxSender};
use crate::workers::WorkerRegistry;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Tunables for one transport instance.
#[derive(Debug, Clone)]
pub struct Config {
    /// Transmission attempts per request before the pending is abandoned.
    pub max_req_attempts: u64,
    /// Cached responses retained per connection (FIFO eviction).
    pub max_cached_responses: usize,
    /// Bumper wake interval.
    pub bump_interval: Duration,
    /// Input worker poll timeout, which bounds how quickly the input worker
    /// notices shutdown.
    pub poll_timeout: Duration,
    /// Retransmission backoff per pending request.
    pub retry: BinaryExpConfig,
    /// Silence schedule per connection: `Cycled` pings the peer, `Died`
    /// abandons it.
    pub silence: LinearConfig,
    /// Bump ticks a closing connection lingers so late retransmits still
    /// hit the response cache.
    pub disconnect_linger_ticks: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_req_attempts: 10,
            max_cached_responses: 25,
            bump_interval: Duration::from_micros(500),
            poll_timeout: Duration::from_millis(10),
            retry: BinaryExpConfig::default(),
            silence: LinearConfig {
                ticks_per_attempt: 500,
                max_ticks: 4000,
                start_delay: 1000,
            },
            disconnect_linger_ticks: 64,
        }
    }
}

impl Config {
    pub fn with_max_req_attempts(mut self, value: u64) -> Self {
        self.max_req_attempts = value;
        self
    }

    pub fn with_max_cached_responses(mut self, value: usize) -> Self {
        self.max_cached_responses = value;
        self
    }

    pub fn with_bump_interval(mut self, value: Duration) -> Self {
        self.bump_interval = value;
        self
    }

    pub fn with_poll_timeout(mut self, value: Duration) -> Self {
        self.poll_timeout = value;
        self
    }

    pub fn with_retry(mut self, value: BinaryExpConfig) -> Self {
        self.retry = value;
        self
    }

    pub fn with_silence(mut self, value: LinearConfig) -> Self {
        self.silence = value;
        self
    }

    pub fn with_disconnect_linger_ticks(mut self, value: u64) -> Self {
        self.disconnect_linger_ticks = value;
        self
    }

    fn report(&self) {
        info!(
            max_req_attempts = self.max_req_attempts,
            max_cached_responses = self.max_cached_responses,
            bump_interval_us = self.bump_interval.as_micros() as u64,
            "reliable transport configured"
        );
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The request was abandoned before a matching response arrived.
    #[error("request was abandoned without a response")]
    MissedResponse,
    /// The transport was shut down.
    #[error("transport is disconnected")]
    Disconnected,
    #[error("expected a request body, got {0}")]
    ExpectedRequest(MessageTag),
    #[error("expected a response body, got {0}")]
    ExpectedResponse(MessageTag),
    #[error(transparent)]
    Endpoint(#[from] crate::endpoint::EndpointError),
}

// ---------------------------------------------------------------------------
// Per-connection state
// ---------------------------------------------------------------------------

/// A request in flight, retained until answered, failed, or cancelled.
struct PendingOutbound {
    request: Envelope,
    attempts_remaining: u64,
    cooldown: BinaryExpCooldown,
    callback: oneshot::Sender<Result<Envelope, TransportError>>,
}

/// State for one remote peer.
struct Connection {
    received_seqns: crate::seqn_set::SequenceSet,
    cached_responses: HashMap<u64, Envelope>,
    cache_queue: VecDeque<u64>,
    pending: HashMap<u64, PendingOutbound>,
    /// Any traffic from the peer resets this; `Cycled` sends a ping,
    /// `Died` marks the peer for forceful teardown.
    silence: LinearCooldown,
    established: bool,
    /// Countdown to removal after a graceful disconnect exchange.
    closing: Option<u64>,
}

impl Connection {
    fn new(config: &Config) -> Self {
        Connection {
            received_seqns: crate::seqn_set::SequenceSet::new(),
            cached_responses: HashMap::new(),
            cache_queue: VecDeque::new(),
            pending: HashMap::new(),
            silence: config.silence.start(),
            established: false,
            closing: None,
        }
    }

    fn cache_response(&mut self, envelope: Envelope, cap: usize) {
        while self.cache_queue.len() >= cap.max(1) {
            if let Some(oldest) = self.cache_queue.pop_front() {
                self.cached_responses.remove(&oldest);
            }
        }
        self.cache_queue.push_back(envelope.seqn());
        self.cached_responses.insert(envelope.seqn(), envelope);
    }

    /// Fail every pending request with `MissedResponse`.
    fn fail_pendings(&mut self) {
        for (_, pending) in self.pending.drain() {
            let _ = pending.callback.send(Err(TransportError::MissedResponse));
        }
    }
}

struct Inner {
    connections: BTreeMap<Address, Connection>,
}

struct Shared {
    udp: DatagramEndpoint,
    config: Config,
    inner: Mutex<Inner>,
    /// Sender side of the surfaced-request mailbox.  Taken (and thereby
    /// disconnected) by `stop_receiving`, or at the latest by the bumper's
    /// final teardown.
    surface_tx: StdMutex<Option<MailboxSender<ReceivedReq>>>,
    shutdown: AtomicBool,
    /// (interval, extra bump count) requested by `disconnect_timeout`.
    linger: StdMutex<Option<(Duration, u32)>>,
}

impl Shared {
    fn surface(&self, req: ReceivedReq) {
        let sender = self.surface_tx.lock().unwrap().clone();
        if let Some(sender) = sender {
            let _ = sender.send(req);
        }
    }
}

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

/// A submitted request waiting for its response.
pub struct SentReq {
    remote: Address,
    seqn: u64,
    response: oneshot::Receiver<Result<Envelope, TransportError>>,
}

impl SentReq {
    pub fn remote(&self) -> Address {
        self.remote
    }

    pub fn seqn(&self) -> u64 {
        self.seqn
    }

    /// Resolve to the response whose seqn matches this request, or fail
    /// with [`TransportError::MissedResponse`] once the transport gives up.
    pub async fn await_response(self) -> Result<Envelope, TransportError> {
        match self.response.await {
            Ok(result) => result,
            Err(_sender_dropped) => Err(TransportError::MissedResponse),
        }
    }
}

/// A surfaced request that the transport's user must service.
pub struct ReceivedReq {
    shared: Arc<Shared>,
    envelope: Envelope,
    synthetic: bool,
}

impl ReceivedReq {
    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    /// True for requests the transport fabricated itself (forceful
    /// disconnects); responding to those is a no-op.
    pub fn is_synthetic(&self) -> bool {
        self.synthetic
    }

    /// Build the response (copied seqn, fresh timestamp), cache it for
    /// duplicate-request replay, and transmit one copy.
    pub async fn send_resp(self, body: MessageBody) -> Result<(), TransportError> {
        if body.step() != MessageStep::Resp {
            return Err(TransportError::ExpectedResponse(body.tag()));
        }
        if self.synthetic {
            return Ok(());
        }

        let message = Message::response(self.envelope.seqn(), body);
        let envelope = Envelope::new(self.envelope.remote, message);
        let graceful_close = envelope.tag().r#type == MessageType::Disconnect;

        let mut inner = self.shared.inner.lock().await;
        if let Some(conn) = inner.connections.get_mut(&envelope.remote) {
            conn.cache_response(envelope.clone(), self.shared.config.max_cached_responses);
            if graceful_close {
                conn.closing = Some(self.shared.config.disconnect_linger_ticks);
            }
        }
        self.shared.udp.send(&envelope).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// The connection-oriented reliable request/response transport.
///
/// Cloning yields another handle to the same transport; all clones share
/// the connection table and the surfaced-request mailbox.
#[derive(Clone)]
pub struct ReliableTransport {
    shared: Arc<Shared>,
    registry: Arc<WorkerRegistry>,
    surface_rx: MailboxReceiver<ReceivedReq>,
}

impl ReliableTransport {
    /// Spawn the input, handler, and bumper workers around `udp`.
    pub fn start(udp: DatagramEndpoint, config: Config) -> Self {
        config.report();

        let (handler_tx, handler_rx) = mailbox::<Envelope>();
        let (surface_tx, surface_rx) = mailbox::<ReceivedReq>();

        let shared = Arc::new(Shared {
            udp,
            config,
            inner: Mutex::new(Inner { connections: BTreeMap::new() }),
            surface_tx: StdMutex::new(Some(surface_tx)),
            shutdown: AtomicBool::new(false),
            linger: StdMutex::new(None),
        });

        let registry = Arc::new(WorkerRegistry::new());
        registry.spawn("transport-input", input_worker(shared.clone(), handler_tx));
        registry.spawn("transport-handler", handler_worker(shared.clone(), handler_rx));
        registry.spawn("transport-bumper", bumper_worker(shared.clone()));

        ReliableTransport { shared, registry, surface_rx }
    }

    pub fn local_addr(&self) -> Result<Address, TransportError> {
        Ok(self.shared.udp.local_addr()?)
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// Submit a request.  The transport assigns the sequence number,
    /// transmits one copy, and keeps retransmitting on the retry cooldown
    /// until a response arrives or attempts run out.
    pub async fn send_req(
        &self,
        remote: Address,
        body: MessageBody,
    ) -> Result<SentReq, TransportError> {
        if body.step() != MessageStep::Req {
            return Err(TransportError::ExpectedRequest(body.tag()));
        }
        if self.shared.shutdown.load(Ordering::Acquire) {
            return Err(TransportError::Disconnected);
        }

        let message = Message::request(body);
        let seqn = message.header.seqn;
        let envelope = Envelope::new(remote, message);
        let (callback, response) = oneshot::channel();

        {
            let mut inner = self.shared.inner.lock().await;
            let conn = inner
                .connections
                .entry(remote)
                .or_insert_with(|| Connection::new(&self.shared.config));
            conn.pending.insert(
                seqn,
                PendingOutbound {
                    request: envelope.clone(),
                    attempts_remaining: self.shared.config.max_req_attempts,
                    cooldown: self.shared.config.retry.start(),
                    callback,
                },
            );
            self.shared.udp.send(&envelope).await?;
        }

        Ok(SentReq { remote, seqn, response })
    }

    /// Await the next request that needs servicing.
    pub async fn receive_req(&self) -> Result<ReceivedReq, TransportError> {
        self.surface_rx
            .recv()
            .await
            .map_err(|_| TransportError::Disconnected)
    }

    /// Disconnect the surfaced-request mailbox: `receive_req` callers
    /// drain whatever is already queued and then fail with
    /// [`TransportError::Disconnected`], and nothing new surfaces.
    /// Sending stays enabled until [`disconnect_timeout`].
    ///
    /// Call this before [`disconnect_timeout`] so downstream workers wind
    /// down while the transport is still flushing retransmissions.
    ///
    /// [`disconnect_timeout`]: Self::disconnect_timeout
    pub fn stop_receiving(&self) {
        self.shared.surface_tx.lock().unwrap().take();
    }

    /// Disable send/receive, let the bumper flush outstanding retries for
    /// `count` more intervals of `interval_nanos`, then tear everything
    /// down and join the workers.
    pub async fn disconnect_timeout(&self, interval_nanos: u64, count: u32) {
        {
            let mut linger = self.shared.linger.lock().unwrap();
            *linger = Some((Duration::from_nanos(interval_nanos), count));
        }
        self.shared.shutdown.store(true, Ordering::Release);
        self.registry.join_all().await;
    }
}

// ---------------------------------------------------------------------------
// Workers
// ---------------------------------------------------------------------------

async fn input_worker(shared: Arc<Shared>, handler_tx: MailboxSender<Envelope>) {
    loop {
        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }
        match shared.udp.recv_timeout(shared.config.poll_timeout).await {
            Ok(None) => {
                if !handler_tx.is_connected() {
                    break;
                }
            }
            Ok(Some(envelope)) => {
                if handler_tx.send(envelope).is_err() {
                    break;
                }
            }
            Err(err) if err.is_wire_noise() => {
                debug!(error = %err, "dropping undecodable datagram");
            }
            Err(err) => {
                warn!(error = %err, "datagram receive failed");
            }
        }
    }
}

async fn handler_worker(shared: Arc<Shared>, handler_rx: MailboxReceiver<Envelope>) {
    while let Ok(envelope) = handler_rx.recv().await {
        handle(&shared, envelope).await;
    }
}

/// Per-envelope state machine.
async fn handle(shared: &Arc<Shared>, envelope: Envelope) {
    let remote = envelope.remote;
    let seqn = envelope.seqn();
    let tag = envelope.tag();

    let mut inner = shared.inner.lock().await;

    if !inner.connections.contains_key(&remote) {
        let opens_connection = tag.step == MessageStep::Req
            && matches!(tag.r#type, MessageType::Connect | MessageType::ServerConn);
        if !opens_connection {
            debug!(%remote, %tag, "dropping traffic from unknown peer");
            return;
        }
        inner
            .connections
            .insert(remote, Connection::new(&shared.config));
    }
    let Some(conn) = inner.connections.get_mut(&remote) else {
        return;
    };

    // Any traffic is proof of life.
    conn.silence.reset();

    match tag.step {
        MessageStep::Req => {
            if conn.received_seqns.contains(seqn) {
                // Duplicate: replay the cached response if we still have it;
                // otherwise stay quiet and let the peer retransmit later.
                if let Some(cached) = conn.cached_responses.get(&seqn) {
                    let cached = cached.clone();
                    let _ = shared.udp.send(&cached).await;
                }
                return;
            }
            conn.received_seqns.add(seqn);

            match tag.r#type {
                MessageType::Ping => {
                    // Answered entirely inside the transport.
                    let resp = Envelope::new(
                        remote,
                        Message::response(seqn, MessageBody::PingResp),
                    );
                    conn.cache_response(resp.clone(), shared.config.max_cached_responses);
                    let _ = shared.udp.send(&resp).await;
                }
                MessageType::Connect if conn.established => {
                    debug!(%remote, seqn, "ignoring stale re-connect");
                }
                _ => {
                    drop(inner);
                    shared.surface(ReceivedReq {
                        shared: shared.clone(),
                        envelope,
                        synthetic: false,
                    });
                }
            }
        }
        MessageStep::Resp => {
            let Some(pending) = conn.pending.remove(&seqn) else {
                debug!(%remote, seqn, "dropping stale response");
                return;
            };
            if tag.r#type == MessageType::Connect {
                conn.established = true;
            }
            let _ = pending.callback.send(Ok(envelope));
        }
    }
}

async fn bumper_worker(shared: Arc<Shared>) {
    let mut interval = shared.config.bump_interval;
    let mut remaining: Option<u32> = None;
    let mut last_bump = Duration::ZERO;

    loop {
        // Sleep compensation: if the last bump took d, sleep interval - d.
        tokio::time::sleep(interval.saturating_sub(last_bump)).await;
        let started = Instant::now();
        bump(&shared).await;
        last_bump = started.elapsed();

        if remaining.is_none() && shared.shutdown.load(Ordering::Acquire) {
            let linger = shared.linger.lock().unwrap().take();
            let (linger_interval, count) =
                linger.unwrap_or((shared.config.bump_interval, 0));
            interval = linger_interval;
            remaining = Some(count);
        }
        if let Some(count) = &mut remaining {
            if *count == 0 {
                final_teardown(&shared).await;
                break;
            }
            *count -= 1;
        }
    }
}

/// Advance every connection's timers and perform the deferred actions.
async fn bump(shared: &Arc<Shared>) {
    let mut inner = shared.inner.lock().await;

    // (address, surface a synthetic disconnect upstream)
    let mut dead: Vec<(Address, bool)> = Vec::new();

    for (addr, conn) in inner.connections.iter_mut() {
        let mut expired: Vec<u64> = Vec::new();
        let mut teardown = false;

        for (&seqn, pending) in conn.pending.iter_mut() {
            match pending.cooldown.tick() {
                CooldownTick::Idle => {}
                CooldownTick::Cycled => {
                    pending.attempts_remaining = pending.attempts_remaining.saturating_sub(1);
                    if pending.attempts_remaining == 0 {
                        expired.push(seqn);
                        let req_type = pending.request.tag().r#type;
                        if matches!(req_type, MessageType::Connect | MessageType::Disconnect) {
                            teardown = true;
                        }
                    } else {
                        let _ = shared.udp.send(&pending.request).await;
                    }
                }
                CooldownTick::Died => expired.push(seqn),
            }
        }
        for seqn in expired {
            if let Some(pending) = conn.pending.remove(&seqn) {
                let _ = pending.callback.send(Err(TransportError::MissedResponse));
            }
        }

        match conn.silence.tick() {
            CooldownTick::Idle => {}
            CooldownTick::Cycled => {
                // Fire-and-forget liveness probe; any answer resets the
                // silence schedule when it comes through handle().
                let ping = Envelope::new(*addr, Message::request(MessageBody::PingReq));
                let _ = shared.udp.send(&ping).await;
            }
            CooldownTick::Died => teardown = true,
        }

        if teardown {
            dead.push((*addr, true));
        } else if let Some(ticks) = &mut conn.closing {
            if *ticks == 0 {
                dead.push((*addr, false));
            } else {
                *ticks -= 1;
            }
        }
    }

    for (addr, forceful) in dead {
        if let Some(mut conn) = inner.connections.remove(&addr) {
            conn.fail_pendings();
        }
        if forceful {
            debug!(remote = %addr, "peer abandoned, surfacing forceful disconnect");
            shared.surface(ReceivedReq {
                shared: shared.clone(),
                envelope: Envelope::new(addr, Message::request(MessageBody::DisconnectReq)),
                synthetic: true,
            });
        } else {
            debug!(remote = %addr, "closing connection after disconnect linger");
        }
    }
}

/// Fail whatever is still pending, drop the connection table, and
/// disconnect the surfaced-request mailbox.
async fn final_teardown(shared: &Arc<Shared>) {
    let mut inner = shared.inner.lock().await;
    for (_, conn) in inner.connections.iter_mut() {
        conn.fail_pendings();
    }
    inner.connections.clear();
    drop(inner);
    shared.surface_tx.lock().unwrap().take();
    debug!("transport torn down");
}
