// nf-transport: reliable request/response transport over unreliable,
// unordered datagrams.
//
// The reliability layer lives in `reliable`; the supporting pieces
// (sequence-number dedup, retry timers, mailboxes, worker tracking, the
// datagram endpoint) each get their own module and are reusable on both
// the client and server side of a connection.

pub mod cooldown;
pub mod endpoint;
pub mod mailbox;
pub mod reliable;
pub mod seqn_set;
pub mod workers;

pub use cooldown::{BinaryExpConfig, BinaryExpCooldown, CooldownTick, LinearConfig, LinearCooldown};
pub use endpoint::{DatagramEndpoint, EndpointError};
#[cfg(feature = "test-support")]
pub use endpoint::FaultPlan;
pub use mailbox::{mailbox, MailboxReceiver, MailboxSender, ReceiversDisconnected, SendersDisconnected};
pub use reliable::{Config, ReceivedReq, ReliableTransport, SentReq, TransportError};
pub use seqn_set::SequenceSet;
pub use workers::WorkerRegistry;
