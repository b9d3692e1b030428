//! Method-name route table types.
//!
//! Handlers receive the registry, the originating connection and the
//! decoded frame. They may send through the registry but must not block
//! indefinitely: dispatch runs inline on the connection's processing loop.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use courier_core::Frame;

use crate::connection::Connection;
use crate::error::SendError;
use crate::server::Server;

/// Failure surfaced by a route handler; stringified into an Err frame for
/// the client.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self(message.to_string())
    }
}

impl From<SendError> for HandlerError {
    fn from(err: SendError) -> Self {
        Self(err.to_string())
    }
}

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send>>;

pub type RouteHandler =
    Arc<dyn Fn(Arc<Server>, Arc<Connection>, Frame) -> HandlerFuture + Send + Sync>;

/// One method-name → handler binding.
pub struct Route {
    pub method: String,
    pub handler: RouteHandler,
}

/// Bind an async handler function to a method name.
pub fn route<F, Fut>(method: impl Into<String>, handler: F) -> Route
where
    F: Fn(Arc<Server>, Arc<Connection>, Frame) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Route {
        method: method.into(),
        handler: Arc::new(move |server, conn, frame| Box::pin(handler(server, conn, frame))),
    }
}
