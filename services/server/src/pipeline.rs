//! Staged workers between the transport and the profile store.
//!
//! - **router**: pulls surfaced requests off the transport and dispatches
//!   them by tag: profile operations one way, publishes the other, junk
//!   answered with `Resp/Error{Bad}`.
//! - **profile-ops**: connect/disconnect/follow against the store, each
//!   answered with the tag-matched response or the mapped error.
//! - **delivery**: services publishes (which fan wakes out per follower)
//!   and drains each woken follower's pending queue into `Req/Deliver`
//!   sends.  Delivery responses are awaited off-worker; a peer that never
//!   answers is handled by the transport's retry and teardown path.
//! - **persistence**: parks on the store's dirty flag and writes
//!   snapshots.
//!
//! Shutdown cascades: once the transport's `stop_receiving` disconnects
//! the surfaced-request mailbox, the router drains, exits, and drops its
//! mailbox senders, which stops the downstream workers in order while the
//! transport is still flushing its retransmissions.

use std::sync::Arc;

use tracing::{debug, info, warn};

use nf_proto::{ErrorKind, MessageBody, MessageType, Username};
use nf_transport::{
    mailbox, MailboxReceiver, MailboxSender, ReceivedReq, ReliableTransport, WorkerRegistry,
};

use crate::store::{ProfileStore, StoreError};

/// Wires the transport to the store and spawns the pipeline workers into
/// `registry`.
pub struct Pipeline;

impl Pipeline {
    pub fn start(
        registry: &WorkerRegistry,
        transport: ReliableTransport,
        store: Arc<ProfileStore>,
    ) -> Self {
        let (profile_ops_tx, profile_ops_rx) = mailbox::<ReceivedReq>();
        let (publish_tx, publish_rx) = mailbox::<ReceivedReq>();
        let (wake_tx, wake_rx) = mailbox::<Username>();

        registry.spawn("router", router(transport.clone(), profile_ops_tx, publish_tx));
        registry.spawn("profile-ops", profile_ops(store.clone(), profile_ops_rx));
        registry.spawn(
            "delivery",
            delivery(store.clone(), transport, publish_rx, wake_tx, wake_rx),
        );
        registry.spawn("persistence", persistence(store));

        Pipeline
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

async fn router(
    transport: ReliableTransport,
    profile_ops_tx: MailboxSender<ReceivedReq>,
    publish_tx: MailboxSender<ReceivedReq>,
) {
    while let Ok(req) = transport.receive_req().await {
        let remote = req.envelope().remote;
        match req.envelope().tag().r#type {
            MessageType::Connect | MessageType::Disconnect | MessageType::Follow => {
                let _ = profile_ops_tx.send(req);
            }
            MessageType::Notify => {
                let _ = publish_tx.send(req);
            }
            MessageType::Error => {
                warn!(%remote, "received an error request, dropping");
            }
            other => {
                warn!(%remote, r#type = ?other, "unserviceable request");
                let resp = MessageBody::ErrorResp { kind: ErrorKind::Bad };
                if let Err(err) = req.send_resp(resp).await {
                    warn!(%remote, %err, "failed to answer unserviceable request");
                }
            }
        }
    }
    debug!("router finished");
}

// ---------------------------------------------------------------------------
// Profile operations
// ---------------------------------------------------------------------------

async fn profile_ops(store: Arc<ProfileStore>, requests: MailboxReceiver<ReceivedReq>) {
    while let Ok(req) = requests.recv().await {
        let remote = req.envelope().remote;
        let timestamp = req.envelope().message.header.timestamp;

        let outcome: Result<MessageBody, StoreError> = match &req.envelope().message.body {
            MessageBody::ConnectReq { username } => {
                store.connect(remote, username, timestamp).map(|()| {
                    info!(client = %remote, %username, timestamp, "client connected");
                    MessageBody::ConnectResp
                })
            }
            MessageBody::DisconnectReq => {
                let removed = store.disconnect(remote, timestamp);
                info!(
                    client = %remote,
                    removed,
                    synthetic = req.is_synthetic(),
                    "client disconnected"
                );
                Ok(MessageBody::DisconnectResp)
            }
            MessageBody::FollowReq { username } => {
                store.follow(remote, username, timestamp).map(|()| {
                    info!(client = %remote, followed = %username, "follow registered");
                    MessageBody::FollowResp
                })
            }
            other => {
                warn!(client = %remote, tag = %other.tag(), "misrouted request");
                Ok(MessageBody::ErrorResp { kind: ErrorKind::Bad })
            }
        };

        let body = outcome.unwrap_or_else(|err| {
            warn!(client = %remote, %err, "profile operation refused");
            MessageBody::ErrorResp { kind: err.kind() }
        });
        if let Err(err) = req.send_resp(body).await {
            warn!(client = %remote, %err, "failed to send profile-op response");
        }
    }
    debug!("profile-ops finished");
}

// ---------------------------------------------------------------------------
// Delivery fan-out
// ---------------------------------------------------------------------------

async fn delivery(
    store: Arc<ProfileStore>,
    transport: ReliableTransport,
    publishes: MailboxReceiver<ReceivedReq>,
    wake_tx: MailboxSender<Username>,
    wake_rx: MailboxReceiver<Username>,
) {
    loop {
        tokio::select! {
            publish = publishes.recv() => {
                let Ok(req) = publish else { break };
                handle_publish(&store, &wake_tx, req).await;
            }
            woken = wake_rx.recv() => {
                // The delivery worker owns a wake sender itself, so this
                // only disconnects once the whole pipeline unwinds.
                let Ok(username) = woken else { break };
                drain_follower(&store, &transport, &username).await;
            }
        }
    }
    debug!("delivery finished");
}

async fn handle_publish(
    store: &Arc<ProfileStore>,
    wake_tx: &MailboxSender<Username>,
    req: ReceivedReq,
) {
    let remote = req.envelope().remote;
    let timestamp = req.envelope().message.header.timestamp;

    let body = match &req.envelope().message.body {
        MessageBody::NotifyReq { message } => {
            match store.notify(remote, message.clone(), wake_tx, timestamp) {
                Ok(()) => {
                    info!(client = %remote, message = %message, "notification published");
                    MessageBody::NotifyResp
                }
                Err(err) => {
                    warn!(client = %remote, %err, "publish refused");
                    MessageBody::ErrorResp { kind: err.kind() }
                }
            }
        }
        other => {
            warn!(client = %remote, tag = %other.tag(), "misrouted request");
            MessageBody::ErrorResp { kind: ErrorKind::Bad }
        }
    };
    if let Err(err) = req.send_resp(body).await {
        warn!(client = %remote, %err, "failed to send publish response");
    }
}

/// Drain `username`'s pending queue completely; consecutive wakes for the
/// same follower coalesce into whoever drains first.
async fn drain_follower(
    store: &Arc<ProfileStore>,
    transport: &ReliableTransport,
    username: &Username,
) {
    while let Some(pending) = store.consume_one_pending(username) {
        let body = MessageBody::DeliverReq {
            sender: pending.sender.clone(),
            message: pending.message.clone(),
            sent_at: pending.sent_at,
        };
        for receiver in pending.receivers {
            match transport.send_req(receiver, body.clone()).await {
                Ok(sent) => {
                    // Do not block the fan-out on the response; the
                    // transport retries and, failing that, tears the
                    // session down with a synthesized disconnect.
                    tokio::spawn(async move {
                        match sent.await_response().await {
                            Ok(resp) => {
                                if let Err(err) =
                                    resp.message.body.expect_resp(MessageType::Deliver)
                                {
                                    warn!(client = %receiver, %err, "bad delivery ack");
                                }
                            }
                            Err(err) => {
                                warn!(client = %receiver, %err, "notification delivery failed");
                            }
                        }
                    });
                }
                Err(err) => {
                    warn!(client = %receiver, %err, "could not submit delivery");
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

async fn persistence(store: Arc<ProfileStore>) {
    while store.persist_if_dirty().await {}
    debug!("persistence finished");
}
