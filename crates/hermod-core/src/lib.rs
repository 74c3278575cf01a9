// hermod-core: the networking and routing fabric shared by every node.
//
// A node hosts one Server (TCP or WebSocket edge), keeps a pool of outbound
// Clients per dependency service, discovers peers through a Naming backend,
// and routes logic packets between them through the Container.

pub mod channel;
pub mod channels;
pub mod client;
pub mod clients;
pub mod conn;
pub mod container;
pub mod dispatcher;
pub mod naming;
pub mod router;
pub mod selector;
pub mod server;
pub mod storage;

use std::time::Duration;

pub use channel::{Agent, Channel, ChannelError, MessageListener};
pub use channels::ChannelMap;
pub use client::{Client, ClientError, ClientOptions, DialContext, Dialer, TcpDialer};
pub use clients::ClientMap;
pub use conn::{ConnError, FrameReader, FrameWriter, FramedConn};
pub use container::{Container, ContainerError};
pub use dispatcher::Dispatcher;
pub use naming::{Naming, NamingError, ServiceDescriptor, WatchCallback};
pub use router::{Context, Handler, Router, RouterError};
pub use selector::{HashSelector, Selector};
pub use server::{Acceptor, Protocol, Server, ServerError, StateListener};
pub use storage::{MemoryStorage, SessionStorage, StorageError};

/// Absent traffic past this window, a channel's read loop gives up.
pub const DEFAULT_READ_WAIT: Duration = Duration::from_secs(3 * 60);
/// Per-frame write deadline.
pub const DEFAULT_WRITE_WAIT: Duration = Duration::from_secs(10);
/// Handshake budget granted to the acceptor for a fresh connection.
pub const DEFAULT_LOGIN_WAIT: Duration = Duration::from_secs(10);
/// Interval between outbound client Pings. Must stay below the peer's read
/// wait or idle links get reaped.
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(55);
