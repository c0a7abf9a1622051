//! Inbound source implementations

mod channel;

pub use channel::{ChannelProvider, LinkSender};
