//! Ports to the outside world: the channel provider and the data store.

pub mod data_store;
pub mod transport;

pub use data_store::{DataStore, DataStoreError};
pub use transport::{ChannelTransport, TransportError};
