//! `courier-core`: shared gateway primitives.
//!
//! This crate contains **pure** types shared by the dispatch engine, the event
//! bus and the HTTP surface: identifiers, the error taxonomy, outbound message
//! content and delivery statuses. No IO lives here.

pub mod delivery;
pub mod error;
pub mod id;
pub mod message;

pub use delivery::DeliveryStatus;
pub use error::{GatewayError, GatewayResult};
pub use id::{MessageId, SessionId, TenantId};
pub use message::{InboundMessage, MediaSource, MessageContent, OutboundMessage};
