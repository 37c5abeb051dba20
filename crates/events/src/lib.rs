//! Gateway notifications and the pub/sub mechanics that carry them.

pub mod bus;
pub mod in_memory_bus;
pub mod notification;
pub mod tenant;

pub use bus::{EventBus, Subscription};
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
pub use notification::{Notification, NotificationKind};
pub use tenant::TenantScoped;
