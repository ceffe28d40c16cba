// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Consumer
//!
//! Processing of a single delivery: decrypt when the headers say so, decode the content,
//! and hand both to the application handler together with an [`AckOrNack`] bound to the
//! channel that delivered the message. Content that cannot be decrypted or decoded is
//! reported as an event and nacked; it never stops the subscription.

use crate::{
    encryption::decrypt_message,
    errors::AmqpError,
    message::{Content, Message},
    otel,
    session::{ChannelSession, NackOptions},
    subscriber::{report, SubscriptionDefinition, SubscriptionEvent},
};
use async_trait::async_trait;
use opentelemetry::{
    global::BoxedTracer,
    trace::{Span, Status},
    Context,
};
use std::{borrow::Cow, fmt::Display};
use tokio::sync::mpsc::Sender;
use tracing::{debug, error, warn};

/// Application callback receiving subscribed messages.
///
/// Calls are never concurrent within one subscription: the next message is handed over
/// once `handle` returns.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, ctx: &Context, message: Message, content: Content, ack_or_nack: AckOrNack);
}

/// Acknowledgement decision for one message.
///
/// Routes to the channel that delivered the message even if the subscription has moved to
/// another channel since, and keeps working during the deferred close grace period.
pub struct AckOrNack {
    session: ChannelSession,
    message: Message,
}

impl AckOrNack {
    pub(crate) fn new(session: ChannelSession, message: Message) -> AckOrNack {
        AckOrNack { session, message }
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    /// Acknowledges the message on the channel that delivered it.
    ///
    /// # Returns
    /// `Ok(())` once the broker was told, or `ChannelClosed` when that channel is gone and
    /// the broker will redeliver the message
    pub async fn ack(self) -> Result<(), AmqpError> {
        self.session.ack(&self.message).await
    }

    /// Rejects the message on the channel that delivered it.
    ///
    /// # Parameters
    /// * `options` - Whether the broker should requeue the message
    ///
    /// # Returns
    /// `Ok(())` once the broker was told, or `ChannelClosed` when that channel is gone
    pub async fn nack(self, options: NackOptions) -> Result<(), AmqpError> {
        self.session.nack(&self.message, options).await
    }

    /// Acks on `Ok`, nacks with `options` on `Err`.
    pub async fn ack_or_nack<E: Display>(
        self,
        result: Result<(), E>,
        options: NackOptions,
    ) -> Result<(), AmqpError> {
        match result {
            Ok(()) => self.ack().await,
            Err(err) => {
                warn!(
                    error = err.to_string(),
                    "nacking message: {} with requeue: {}", self.message.id, options.requeue
                );
                self.nack(options).await
            }
        }
    }
}

/// Consumes one delivery.
pub(crate) async fn consume(
    tracer: &BoxedTracer,
    message: Message,
    def: &SubscriptionDefinition,
    session: &ChannelSession,
    handler: &dyn MessageHandler,
    events: &Sender<SubscriptionEvent>,
) -> Result<(), AmqpError> {
    if session.is_cancelled() {
        debug!(
            "subscription: {} is cancelled, returning message: {} to the queue",
            def.name, message.id
        );
        return session.nack(&message, NackOptions::requeue()).await;
    }

    let (ctx, mut span) = otel::new_span(&message.headers, tracer, &def.name);

    debug!(
        "received: {} - queue: {} - exchange: {}",
        message.id, message.queue, message.exchange
    );

    let content = decrypt_message(&message, &def.encryption).and_then(|decrypted| {
        match decrypted {
            Some(decrypted) => {
                Content::decode(decrypted.content_type.as_deref(), &decrypted.payload)
            }
            None => Content::decode(message.content_type.as_deref(), &message.payload),
        }
    });

    let content = match content {
        Ok(content) => content,
        Err(err) => {
            error!(error = err.to_string(), "invalid content, removing message from queue");
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from("invalid content"),
            });

            let nacked = session.nack(&message, NackOptions::default()).await;
            report(
                events,
                &def.name,
                SubscriptionEvent::InvalidContent {
                    message: Box::new(message),
                    error: err,
                },
            );
            return nacked;
        }
    };

    let ack_or_nack = AckOrNack::new(session.clone(), message.clone());
    handler.handle(&ctx, message, content, ack_or_nack).await;
    span.set_status(Status::Ok);

    Ok(())
}
