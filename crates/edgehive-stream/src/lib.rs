pub mod connection;
pub mod dialer;
pub mod endpoint;
pub mod error;
pub mod session;
pub mod store;

pub use connection::{EdgedConnection, EdgedVideoConnection};
pub use dialer::{DialerConfig, TunnelDialer, TunnelStream};
pub use endpoint::{EndpointConfig, StreamRuleEndpoint};
pub use error::{Result, StreamError};
pub use session::{SessionConfig, TunnelSession, TunnelWriter};
pub use store::{EndpointUrl, UrlStore};
