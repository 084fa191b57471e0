pub mod config;
pub mod endpoint;
pub mod error;
pub mod link;
pub mod memory;
pub mod message;
pub mod mux;
pub mod zmq;

pub use config::LinkConfig;
pub use endpoint::Endpoint;
pub use error::TransportError;
pub use link::{Link, LinkEvent, PeerId};
pub use memory::{MemoryHub, MemoryLink};
pub use message::{Message, ProtocolId};
pub use mux::ProtocolMux;
pub use zmq::{ZmqCoordinatorLink, ZmqExecutorLink};
