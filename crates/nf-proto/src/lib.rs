// nf-proto: shared protocol types and the plaintext wire codec.
//
// Everything that crosses a datagram boundary (and the persisted server
// snapshot, which reuses the same codec) is defined here.  The message
// taxonomy is closed: there is no extension point, and decoding rejects
// any tag combination outside the table in `message`.

pub mod address;
pub mod message;
pub mod notif;
pub mod username;
pub mod wire;

pub use address::{Address, InvalidIpv4, InvalidUdpPort};
pub use message::{
    Envelope, ErrorKind, Message, MessageBody, MessageHeader, MessageStep, MessageTag,
    MessageType, RespError, WIRE_MAGIC,
};
pub use notif::{InvalidNotifMessage, NotifMessage};
pub use username::{InvalidUsername, Username};
pub use wire::{WireDecode, WireEncode, WireError, WireReader, WireWriter};
