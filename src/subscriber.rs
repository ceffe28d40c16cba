// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Subscriber
//!
//! Subscribes handlers to configured queues. Every subscription owns a
//! [`ChannelSession`]: the first consumer channel is opened on it when subscribing, and
//! whenever the delivery stream ends without the subscription having been cancelled the
//! subscriber closes the session's current channel, waits for the retry delay and opens
//! a fresh channel on the same session. The delay doubles with every failed attempt up to
//! the configured maximum. Messages delivered before the switch can still be acked or
//! nacked through their [`AckOrNack`](crate::AckOrNack).

use crate::{
    channel::{ChannelProvider, DeliveryStream},
    config::{RetryPolicy, SessionConfig, DEFAULT_DEFER_CLOSE_MILLIS},
    consumer::{consume, MessageHandler},
    encryption::EncryptionSpec,
    errors::AmqpError,
    message::Message,
    session::ChannelSession,
};
use futures_util::StreamExt;
use opentelemetry::global;
use serde::Deserialize;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::sync::{
    mpsc::{self, error::TrySendError},
    oneshot,
};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Default delay before resubscribing after the delivery stream ended.
pub const DEFAULT_RETRY_DELAY_MILLIS: u64 = 1_000;
/// Default cap of the resubscribe delay.
pub const DEFAULT_MAX_RETRY_DELAY_MILLIS: u64 = 60_000;
/// Events kept for a subscription until the application reads them.
pub const EVENT_BUFFER: usize = 64;

fn default_defer_close_millis() -> u64 {
    DEFAULT_DEFER_CLOSE_MILLIS
}

fn default_retry_delay_millis() -> u64 {
    DEFAULT_RETRY_DELAY_MILLIS
}

fn default_max_retry_delay_millis() -> u64 {
    DEFAULT_MAX_RETRY_DELAY_MILLIS
}

/// Definition of a named subscription.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SubscriptionDefinition {
    pub name: String,
    pub queue: String,
    #[serde(default)]
    pub prefetch: Option<u16>,
    #[serde(default = "default_defer_close_millis")]
    pub defer_close_millis: u64,
    #[serde(default = "default_retry_delay_millis")]
    pub retry_delay_millis: u64,
    #[serde(default = "default_max_retry_delay_millis")]
    pub max_retry_delay_millis: u64,
    /// Profiles able to decrypt received messages, by profile name.
    #[serde(default)]
    pub encryption: HashMap<String, EncryptionSpec>,
}

impl SubscriptionDefinition {
    /// Creates a subscription definition with default timings.
    ///
    /// # Parameters
    /// * `name` - Name the subscription is subscribed by
    /// * `queue` - Queue to consume from
    ///
    /// # Returns
    /// A definition to refine with the builder methods
    pub fn new(name: &str, queue: &str) -> SubscriptionDefinition {
        SubscriptionDefinition {
            name: name.to_owned(),
            queue: queue.to_owned(),
            prefetch: None,
            defer_close_millis: DEFAULT_DEFER_CLOSE_MILLIS,
            retry_delay_millis: DEFAULT_RETRY_DELAY_MILLIS,
            max_retry_delay_millis: DEFAULT_MAX_RETRY_DELAY_MILLIS,
            encryption: HashMap::default(),
        }
    }

    /// Limits the unacknowledged messages the broker hands to the consumer.
    pub fn prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = Some(prefetch);
        self
    }

    /// How long a superseded channel stays open for late acknowledgements.
    pub fn defer_close(mut self, defer: Duration) -> Self {
        self.defer_close_millis = defer.as_millis() as u64;
        self
    }

    /// Delay before the first resubscribe attempt.
    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay_millis = delay.as_millis() as u64;
        self
    }

    /// Cap of the doubling resubscribe delay.
    pub fn max_retry_delay(mut self, delay: Duration) -> Self {
        self.max_retry_delay_millis = delay.as_millis() as u64;
        self
    }

    /// Adds a profile able to decrypt received messages.
    pub fn encryption(mut self, spec: EncryptionSpec) -> Self {
        self.encryption.insert(spec.name.clone(), spec);
        self
    }

    /// Configuration of the session backing the subscription. Resubscribing never gives
    /// up, so the retry policy only shapes the delays.
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig::new(&self.name)
            .defer_close(Duration::from_millis(self.defer_close_millis))
            .retry(RetryPolicy::exponential(
                u32::MAX,
                Duration::from_millis(self.retry_delay_millis),
                Duration::from_millis(self.max_retry_delay_millis),
            ))
    }
}

/// Non-fatal problems reported by a running subscription.
#[derive(Debug, Clone)]
pub enum SubscriptionEvent {
    /// The message could not be decrypted or decoded; it was nacked without requeue.
    InvalidContent {
        message: Box<Message>,
        error: AmqpError,
    },
    /// The consumer or a resubscribe attempt failed.
    Error(AmqpError),
}

/// Handle on a running subscription.
pub struct Subscription {
    name: String,
    session: ChannelSession,
    events: mpsc::Receiver<SubscriptionEvent>,
}

impl Subscription {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn session(&self) -> &ChannelSession {
        &self.session
    }

    /// Stops the subscription. Messages already handed to the handler can still be
    /// acknowledged until their channel's deferred close fires.
    pub async fn cancel(&self) -> Result<(), AmqpError> {
        debug!("cancelling subscription: {}", self.name);
        self.session.cancel().await
    }

    /// Next event reported by the subscription, or `None` once it has stopped.
    ///
    /// Up to [`EVENT_BUFFER`] events are kept; later ones are logged and dropped until
    /// the application catches up.
    pub async fn next_event(&mut self) -> Option<SubscriptionEvent> {
        self.events.recv().await
    }
}

/// Subscribes handlers to the subscriptions registered on it.
pub struct Subscriber {
    provider: Arc<dyn ChannelProvider>,
    subscriptions: HashMap<String, SubscriptionDefinition>,
}

impl Subscriber {
    /// Creates a subscriber consuming through channels of `provider`.
    pub fn new(provider: Arc<dyn ChannelProvider>) -> Subscriber {
        Subscriber {
            provider,
            subscriptions: HashMap::default(),
        }
    }

    /// Registers a subscription definition.
    pub fn register(mut self, def: SubscriptionDefinition) -> Self {
        self.subscriptions.insert(def.name.clone(), def);
        self
    }

    /// Starts consuming the subscription `name`, handing every message to `handler`.
    ///
    /// # Parameters
    /// * `name` - Registered subscription name
    /// * `handler` - Callback receiving every decoded message
    ///
    /// # Returns
    /// The running [`Subscription`]. Fails when the subscription is unknown or the first
    /// consumer cannot be created; later failures are retried and reported as events.
    pub async fn subscribe(
        &self,
        name: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Subscription, AmqpError> {
        let Some(def) = self.subscriptions.get(name).cloned() else {
            error!("unknown subscription: {}", name);
            return Err(AmqpError::UnknownSubscription(name.to_owned()));
        };

        let session = ChannelSession::new(&def.session_config());
        let deliveries = attach(self.provider.as_ref(), &def, &session).await?;

        let (sender, events) = mpsc::channel(EVENT_BUFFER);
        tokio::spawn(run(
            self.provider.clone(),
            def,
            session.clone(),
            handler,
            sender,
            deliveries,
        ));

        Ok(Subscription {
            name: name.to_owned(),
            session,
            events,
        })
    }
}

/// Opens a consumer on a fresh channel and registers the channel on the session.
async fn attach(
    provider: &dyn ChannelProvider,
    def: &SubscriptionDefinition,
    session: &ChannelSession,
) -> Result<DeliveryStream, AmqpError> {
    let channel = provider.consumer_channel().await?;
    let tag = format!("{}-{}", def.name, Uuid::new_v4());

    let deliveries = match channel.consume(&def.queue, &tag, def.prefetch).await {
        Ok(deliveries) => deliveries,
        Err(err) => {
            if let Err(err) = channel.close().await {
                warn!(error = err.to_string(), "failure to close unused channel");
            }
            return Err(err);
        }
    };

    if let Err(err) = session.open(channel.clone(), &tag).await {
        warn!(
            error = err.to_string(),
            "subscription: {} was cancelled while subscribing", def.name
        );
        if let Err(err) = channel.cancel(&tag).await {
            warn!(error = err.to_string(), "failure to cancel consumer: {}", tag);
        }
        if let Err(err) = channel.close().await {
            warn!(error = err.to_string(), "failure to close unused channel");
        }
        return Err(err);
    }

    debug!("subscribed: {} to queue: {}", tag, def.queue);
    Ok(deliveries)
}

/// Hands an event to the subscription's owner without waiting for room in the queue.
pub(crate) fn report(events: &mpsc::Sender<SubscriptionEvent>, name: &str, event: SubscriptionEvent) {
    match events.try_send(event) {
        Ok(()) => {}
        Err(TrySendError::Full(SubscriptionEvent::InvalidContent { message, error })) => {
            warn!(
                error = error.to_string(),
                "event queue of subscription: {} is full, dropping invalid content event of: {}",
                name,
                message.id
            );
        }
        Err(TrySendError::Full(SubscriptionEvent::Error(error))) => {
            warn!(
                error = error.to_string(),
                "event queue of subscription: {} is full, dropping error event", name
            );
        }
        Err(TrySendError::Closed(_)) => {
            debug!("nobody listening for events of subscription: {}", name);
        }
    }
}

async fn run(
    provider: Arc<dyn ChannelProvider>,
    def: SubscriptionDefinition,
    session: ChannelSession,
    handler: Arc<dyn MessageHandler>,
    events: mpsc::Sender<SubscriptionEvent>,
    mut deliveries: DeliveryStream,
) {
    let tracer = global::tracer("amqp consumer");
    let mut failures = 0u32;

    loop {
        while let Some(result) = deliveries.next().await {
            match result {
                Ok(message) => {
                    if let Err(err) =
                        consume(&tracer, message, &def, &session, handler.as_ref(), &events).await
                    {
                        error!(error = err.to_string(), "error consume msg");
                    }
                }
                Err(err) => {
                    error!(error = err.to_string(), "errors consume msg");
                    report(&events, &def.name, SubscriptionEvent::Error(err));
                }
            }
        }

        if session.is_cancelled() {
            debug!("subscription: {} stopped", def.name);
            return;
        }

        warn!("deliveries of subscription: {} ended, resubscribing", def.name);
        if let Err(err) = session.close().await {
            warn!(error = err.to_string(), "failure to close the current channel");
        }

        failures = failures.saturating_add(1);
        let delay = session.config().retry.delay(failures);
        debug!("resubscribing: {} in {:?}", def.name, delay);

        let (wake, wait) = oneshot::channel();
        session.schedule(delay, async move {
            let _ = wake.send(());
        });
        if wait.await.is_err() {
            debug!("resubscribe of: {} aborted", def.name);
            return;
        }

        deliveries = match attach(provider.as_ref(), &def, &session).await {
            Ok(deliveries) => {
                failures = 0;
                deliveries
            }
            Err(AmqpError::SessionCancelled(_)) => return,
            Err(err) => {
                error!(error = err.to_string(), "failure to resubscribe");
                report(&events, &def.name, SubscriptionEvent::Error(err));
                futures_util::stream::empty().boxed()
            }
        };
    }
}
