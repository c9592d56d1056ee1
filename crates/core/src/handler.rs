//! The MessageHandler trait — what a subscription binds a topic pattern to.

use crate::error::HandlerError;
use crate::message::Message;
use async_trait::async_trait;
use std::future::Future;

/// A consumer of delivered messages.
///
/// Handlers report failure through [`HandlerError`]; the bus decides whether
/// to retry or dead-letter. Plain async closures implement this trait via
/// the blanket impl below, so tests and small collaborators never need a
/// named type.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: Message) -> Result<(), HandlerError>;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, message: Message) -> Result<(), HandlerError> {
        (self)(message).await
    }
}
