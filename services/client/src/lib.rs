// client: programmatic session against a notification feed server.

pub mod session;

pub use session::{ClientError, ClientSession, Delivery};
