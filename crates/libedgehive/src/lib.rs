pub mod bus;
pub mod channel;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod priority;
pub mod socket;
pub mod tls;

pub use bus::Bus;
pub use channel::{ChannelContext, Mailbox};
pub use config::{BusConfig, effective_timeout};
pub use dispatcher::{Dispatcher, Module, ModuleDescriptor};
pub use error::{BusError, Result};
pub use priority::{BusSink, ChannelSink, DataItem, DataSink, PriorityConfig, PriorityDispatcher};
pub use socket::{PeerConfig, PeerHandle, SocketConfig, SocketContext, Transport};
pub use tls::TlsSettings;
