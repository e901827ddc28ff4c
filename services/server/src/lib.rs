// server: the profile/notification engine behind the reliable transport.
//
// `store` owns the durable state, `pipeline` wires the transport to the
// store through three staged workers, `config` reads the environment.

pub mod config;
pub mod pipeline;
pub mod store;

pub use config::ServerConfig;
pub use pipeline::Pipeline;
pub use store::{PendingNotif, ProfileStore, StoreError, MAX_SESSIONS_PER_PROFILE};
