//! A client session: one reliable transport talking to one server.
//!
//! Every operation is a request/response exchange; `Resp/Error` answers
//! surface as [`ClientError::Refused`] carrying the error kind.  Incoming
//! `Req/Deliver` messages are acknowledged and handed to the caller as
//! [`Delivery`] values.

use tracing::{debug, warn};

use nf_proto::{
    Address, ErrorKind, MessageBody, MessageType, NotifMessage, RespError, Username,
};
use nf_transport::{Config, DatagramEndpoint, ReliableTransport, TransportError};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("could not open a socket: {0}")]
    Bind(#[from] std::io::Error),
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// The server answered, but with an error.
    #[error("server refused the request: {0}")]
    Refused(ErrorKind),
    #[error("unexpected response: {0}")]
    Protocol(RespError),
    /// The transport gave up on the server (forceful disconnect).
    #[error("connection to the server was lost")]
    ConnectionLost,
}

impl From<RespError> for ClientError {
    fn from(err: RespError) -> Self {
        match err {
            RespError::Error(kind) => ClientError::Refused(kind),
            other => ClientError::Protocol(other),
        }
    }
}

/// One notification delivered to this session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub sender: Username,
    pub message: NotifMessage,
    pub sent_at: i64,
}

/// An established session with the server.
pub struct ClientSession {
    transport: ReliableTransport,
    server: Address,
    username: Username,
}

impl ClientSession {
    /// Bind an ephemeral socket and perform the connect exchange.
    pub async fn connect(
        username: Username,
        server: Address,
        config: Config,
    ) -> Result<Self, ClientError> {
        let udp = DatagramEndpoint::bind_ephemeral().await?;
        let transport = ReliableTransport::start(udp, config);

        let outcome: Result<(), ClientError> = async {
            let sent = transport
                .send_req(server, MessageBody::ConnectReq { username: username.clone() })
                .await?;
            let resp = sent.await_response().await?;
            resp.message.body.expect_resp(MessageType::Connect)?;
            Ok(())
        }
        .await;
        if let Err(err) = outcome {
            // Tear the fresh transport down instead of leaking its workers.
            transport.stop_receiving();
            let linger = transport.config().bump_interval.as_nanos() as u64;
            transport.disconnect_timeout(linger, 1).await;
            return Err(err);
        }

        debug!(%username, %server, "session established");
        Ok(ClientSession { transport, server, username })
    }

    pub fn username(&self) -> &Username {
        &self.username
    }

    pub fn local_addr(&self) -> Result<Address, ClientError> {
        Ok(self.transport.local_addr()?)
    }

    /// Start following `username`'s notifications.
    pub async fn follow(&self, username: &Username) -> Result<(), ClientError> {
        let sent = self
            .transport
            .send_req(self.server, MessageBody::FollowReq { username: username.clone() })
            .await?;
        let resp = sent.await_response().await?;
        resp.message.body.expect_resp(MessageType::Follow)?;
        Ok(())
    }

    /// Publish a notification to every follower of this profile.
    pub async fn notify(&self, message: NotifMessage) -> Result<(), ClientError> {
        let sent = self
            .transport
            .send_req(self.server, MessageBody::NotifyReq { message })
            .await?;
        let resp = sent.await_response().await?;
        resp.message.body.expect_resp(MessageType::Notify)?;
        Ok(())
    }

    /// Await the next delivered notification, acknowledging it.
    ///
    /// Fails with [`ClientError::ConnectionLost`] if the transport gives
    /// the server up for dead.
    pub async fn next_delivery(&self) -> Result<Delivery, ClientError> {
        loop {
            let req = self.transport.receive_req().await?;
            match req.envelope().message.body.clone() {
                MessageBody::DeliverReq { sender, message, sent_at } => {
                    let delivery = Delivery { sender, message, sent_at };
                    req.send_resp(MessageBody::DeliverResp).await?;
                    return Ok(delivery);
                }
                MessageBody::DisconnectReq => {
                    // Synthesized by our own transport when the server
                    // stopped answering.
                    req.send_resp(MessageBody::DisconnectResp).await?;
                    return Err(ClientError::ConnectionLost);
                }
                other => {
                    warn!(tag = %other.tag(), "unserviceable request from server");
                    let resp = MessageBody::ErrorResp { kind: ErrorKind::Bad };
                    req.send_resp(resp).await?;
                }
            }
        }
    }

    /// Perform the disconnect exchange and tear the transport down.
    pub async fn disconnect(self) -> Result<(), ClientError> {
        let sent = self
            .transport
            .send_req(self.server, MessageBody::DisconnectReq)
            .await?;
        let resp = sent.await_response().await?;
        resp.message.body.expect_resp(MessageType::Disconnect)?;

        self.transport.stop_receiving();
        self.transport
            .disconnect_timeout(self.transport.config().bump_interval.as_nanos() as u64, 4)
            .await;
        Ok(())
    }
}
