pub mod auth;
pub mod connection;
pub mod error;
pub mod router;
pub mod server;
pub mod transport;

pub use auth::{Authenticator, InsecureAuth, JwtAuth, UpgradeRequest};
pub use connection::{Connection, ConnectionId};
pub use error::SendError;
pub use router::{route, HandlerError, Route, RouteHandler};
pub use server::{Server, ServerConfig, ServerHandle};
pub use transport::{Transport, TransportError};
