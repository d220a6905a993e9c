pub mod hub;
pub mod manager;
pub mod transport;

pub use hub::{ConnectionHub, ConnectionLease};
pub use manager::ConnectionConfig;
pub use transport::WsConnector;
