//! Encrypted transport: the record layer and the connection manager

pub mod connection;
pub mod record;
pub mod server;


pub use connection::{ConnectionCommand, ConnectionState};
pub use record::{MAX_CHUNK_SIZE, RecordError, RecordLayer};
pub use server::{
    CharacteristicEvent, ConnectionId, ConnectionRegistry, HapServer, ServerConfig, ServerContext,
    ServerEvent,
};
