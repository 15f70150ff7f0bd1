//! Client for live query servers.
//!
//! Each subscription holds its own socket and walks the connect → subscribe
//! → unsubscribe handshake one step per [`SubscriptionSession::pump`]. Change
//! notifications (`create`, `update`, `enter`, `leave`, `delete`) are decoded
//! at the boundary and handed to an [`EventHandler`], or to typed
//! [`LiveQueryCallbacks`] through [`TypedCallbacks`].
//!
//! Hosts usually go through a [`SubscriptionRegistry`]: it assigns request
//! ids, keys sessions by name, ticks them with [`SubscriptionRegistry::pump_all`]
//! (or a spawned pump loop) and tears them down on pause or quit.

pub mod codec;
pub mod config;
pub mod error;
pub mod handler;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod transport;

pub use codec::{Codec, JsonCodec};
pub use config::{ClientConfig, ReconnectPolicy, TeardownConfig, load_config};
pub use error::{LiveQueryError, Result, TransportError};
pub use handler::{ChannelHandler, EventHandler, HandlerEvent, LiveQueryCallbacks, TypedCallbacks};
pub use protocol::{ClientRequest, ErrorEvent, EventKind, InboundEvent, LiveQuery, ObjectEvent};
pub use registry::{SessionHandle, SubscriptionRegistry};
pub use session::{ConnectionState, HandshakeFlags, SubscriptionSession};
pub use transport::{Transport, TransportFactory, TransportState};
