//! `ChannelTransport` adapters.

pub mod loopback;

pub use loopback::{LoopbackTransport, SentMessage};
