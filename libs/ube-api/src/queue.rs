use futures::future::BoxFuture;

use crate::context::Context;
use crate::error::Error;
use crate::message::Message;

/// Outbound channel. Messages carry `{id, body}`.
pub trait Publisher: Send + Sync {
    fn publish_events<'a>(&'a self, ctx: &'a Context, messages: &'a [Message]) -> BoxFuture<'a, Result<(), Error>>;
}

/// Inbound source acknowledgment. Messages carry `{id, reference}`.
pub trait Acker: Send + Sync {
    fn ack_messages<'a>(&'a self, ctx: &'a Context, messages: &'a [Message]) -> BoxFuture<'a, Result<(), Error>>;
}

/// Retry channel: publishes the redelivery, acknowledges the original.
/// May target a different channel than the inbound source.
pub trait Republisher: Publisher + Acker {}

impl<T: Publisher + Acker + ?Sized> Republisher for T {}
