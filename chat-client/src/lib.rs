//! Client side of the chat relay: a local SQLite replica of the caller's
//! chats and a tracker for the requests currently streaming into it.

pub mod api;
pub mod error;
pub mod replica;
pub mod tracker;

pub use api::RelayClient;
pub use error::ClientError;
pub use replica::{ActiveRequest, Replica};
pub use tracker::{RequestHandle, RequestOutcome, Tracker};
