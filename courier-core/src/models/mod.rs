pub mod id;
pub mod message;

pub use id::ClientToken;
pub use message::{OutboundMessage, Recipient};
