// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! This module defines the seam between the session layer and the broker client:
//! [`AmqpChannel`] exposes the channel primitives the sessions and pipelines need, and
//! [`ChannelProvider`] hands out channels on connect and reconnect. Both are implemented
//! on top of lapin by [`LapinChannel`] and [`LapinChannelPool`].
//!
//! Sessions only ever borrow channels. A channel closes either through the session's
//! cancel/doom/close protocol or because the broker or the connection went away, in which
//! case every observer registered with [`AmqpChannel::on_close`] is notified once.
//!
//! lapin only reports a server-side close of a single channel through the channel's own
//! error handler. Connection failures are reported on the connection, and a graceful
//! connection close is not reported at all. [`LapinChannelPool`] therefore fans
//! connection errors out to every channel it created, and [`LapinChannel`] notifies its
//! observers as soon as it finds itself disconnected.

use crate::{config::AmqpSettings, errors::AmqpError, message::Message};
use async_trait::async_trait;
use futures_util::{
    stream::{self, BoxStream},
    StreamExt,
};
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions,
    },
    publisher_confirm::Confirmation,
    types::{FieldTable, LongString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::{
    future::Future,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    task::Poll,
};
use tracing::{debug, error, warn};

/// Callback fired once when a channel closes or errors.
pub type ChannelObserver = Box<dyn FnOnce() + Send + 'static>;

/// Stream of messages delivered to a consumer.
pub type DeliveryStream = BoxStream<'static, Result<Message, AmqpError>>;

/// Per-publish options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishOptions {
    /// Ask the broker to return the message if it cannot be routed to any queue.
    pub mandatory: bool,
}

/// How a publish was resolved by the channel.
#[derive(Debug)]
pub enum PublishOutcome {
    /// Written to a normal channel.
    Flushed,
    /// Acknowledged by the broker on a confirm channel.
    Confirmed,
    /// Published with the mandatory flag but not routed to any queue.
    Returned(Box<Message>),
}

/// Channel primitives used by sessions and pipelines.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AmqpChannel: Send + Sync {
    /// Diagnostic identifier of the channel.
    fn id(&self) -> String;

    /// Registers a callback fired once when the channel closes or errors.
    ///
    /// The callback runs straight away when the channel is already gone.
    fn on_close(&self, observer: ChannelObserver);

    /// Publishes a message.
    ///
    /// # Parameters
    /// * `exchange` - Target exchange, empty for the default exchange
    /// * `routing_key` - Routing key, or the queue name on the default exchange
    /// * `options` - Per-publish flags
    /// * `payload` - Encoded message body
    /// * `properties` - AMQP properties, headers included
    ///
    /// # Returns
    /// How the publish was resolved, or an error when it could not be written or the
    /// broker nacked it
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        options: PublishOptions,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<PublishOutcome, AmqpError>;

    /// Starts a consumer on `queue` registered under `consumer_tag`.
    ///
    /// # Parameters
    /// * `queue` - Queue to consume from
    /// * `consumer_tag` - Tag identifying the consumer, and the session entry, on the broker
    /// * `prefetch` - Optional QoS prefetch count applied before consuming
    ///
    /// # Returns
    /// The stream of deliveries. It ends when the consumer is cancelled or the channel
    /// goes away.
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: Option<u16>,
    ) -> Result<DeliveryStream, AmqpError>;

    /// Cancels the broker-side consumer registered with `consumer_tag`.
    ///
    /// # Returns
    /// `CancelConsumerError` when the broker refused or the channel is gone
    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError>;

    /// Acknowledges a delivery received on this channel.
    ///
    /// # Parameters
    /// * `delivery_tag` - Channel-scoped tag of the delivery
    ///
    /// # Returns
    /// `ChannelClosed` when the channel is no longer open, since delivery tags do not
    /// survive their channel
    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    /// Rejects a delivery received on this channel.
    ///
    /// # Parameters
    /// * `delivery_tag` - Channel-scoped tag of the delivery
    /// * `requeue` - Whether the broker should put the message back on its queue
    ///
    /// # Returns
    /// `ChannelClosed` when the channel is no longer open
    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;

    /// Closes the channel and fires its close observers. Closing a channel that is
    /// already gone succeeds.
    async fn close(&self) -> Result<(), AmqpError>;
}

/// Supplies channels to sessions and pipelines.
///
/// Confirm and normal publisher channels are distinct pooled resources; consumer channels
/// are dedicated to the session that requested them.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChannelProvider: Send + Sync {
    /// Borrows a pooled publisher channel, in confirm mode when `confirm` is set.
    async fn publisher_channel(&self, confirm: bool) -> Result<Arc<dyn AmqpChannel>, AmqpError>;

    /// Creates a channel owned by one consumer.
    async fn consumer_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError>;
}

/// Converts a lapin delivery into a [`Message`].
pub(crate) fn message_from_delivery(delivery: &Delivery, consumer_tag: &str, queue: &str) -> Message {
    let props = &delivery.properties;

    Message {
        id: props
            .message_id()
            .as_ref()
            .map(|id| id.as_str().to_owned())
            .unwrap_or_default(),
        content_type: props.content_type().as_ref().map(|ct| ct.as_str().to_owned()),
        headers: props.headers().clone().unwrap_or_default(),
        payload: delivery.data.clone(),
        consumer_tag: consumer_tag.to_owned(),
        delivery_tag: delivery.delivery_tag,
        exchange: delivery.exchange.as_str().to_owned(),
        routing_key: delivery.routing_key.as_str().to_owned(),
        queue: queue.to_owned(),
        redelivered: delivery.redelivered,
    }
}

#[derive(Default)]
struct NotifierState {
    closed: bool,
    observers: Vec<ChannelObserver>,
}

/// Close observers of one channel. Fires at most once; observers registered afterwards
/// run immediately.
#[derive(Default)]
pub(crate) struct CloseNotifier {
    state: Mutex<NotifierState>,
}

impl CloseNotifier {
    fn state(&self) -> MutexGuard<'_, NotifierState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn register(&self, observer: ChannelObserver) {
        let mut state = self.state();
        if !state.closed {
            state.observers.push(observer);
            return;
        }
        drop(state);
        observer();
    }

    pub(crate) fn notify(&self) {
        let pending = {
            let mut state = self.state();
            if state.closed {
                return;
            }
            state.closed = true;
            std::mem::take(&mut state.observers)
        };

        for observer in pending {
            observer();
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state().closed
    }
}

/// Notifiers of the channels created on one connection.
#[derive(Default)]
pub(crate) struct NotifierRegistry {
    notifiers: Mutex<Vec<Weak<CloseNotifier>>>,
}

impl NotifierRegistry {
    pub(crate) fn track(&self, notifier: &Arc<CloseNotifier>) {
        let mut notifiers = self.notifiers.lock().unwrap_or_else(PoisonError::into_inner);
        notifiers.retain(|tracked| tracked.strong_count() > 0);
        notifiers.push(Arc::downgrade(notifier));
    }

    /// Notifies every tracked channel that is still alive.
    pub(crate) fn notify_all(&self) {
        let live: Vec<Arc<CloseNotifier>> = self
            .notifiers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .filter_map(|tracked| tracked.upgrade())
            .collect();

        for notifier in live {
            notifier.notify();
        }
    }
}

/// lapin implementation of [`AmqpChannel`].
pub struct LapinChannel {
    channel: Channel,
    confirm: bool,
    notifier: Arc<CloseNotifier>,
}

impl LapinChannel {
    /// Wraps a lapin channel.
    ///
    /// # Parameters
    /// * `channel` - An open lapin channel
    /// * `confirm` - Whether confirm mode was selected on the channel
    ///
    /// # Returns
    /// The shared channel, with its observers wired to lapin's channel error handler
    pub fn new(channel: Channel, confirm: bool) -> Arc<LapinChannel> {
        let notifier: Arc<CloseNotifier> = Arc::default();

        let on_error = notifier.clone();
        let id = channel.id();
        channel.on_error(move |err| {
            warn!(error = err.to_string(), "channel {} errored", id);
            on_error.notify();
        });

        Arc::new(LapinChannel {
            channel,
            confirm,
            notifier,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.channel.status().connected()
    }

    /// Whether the channel can still be used. Notifies the observers once it cannot.
    fn alive(&self) -> bool {
        if self.is_connected() {
            return true;
        }
        if !self.notifier.is_closed() {
            debug!("channel {} is no longer connected", self.channel.id());
        }
        self.notifier.notify();
        false
    }
}

#[async_trait]
impl AmqpChannel for LapinChannel {
    fn id(&self) -> String {
        self.channel.id().to_string()
    }

    fn on_close(&self, observer: ChannelObserver) {
        self.alive();
        self.notifier.register(observer);
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        options: PublishOptions,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<PublishOutcome, AmqpError> {
        if !self.alive() {
            return Err(AmqpError::ChannelError("channel closed".to_owned()));
        }

        let message_id = properties
            .message_id()
            .as_ref()
            .map(|id| id.as_str().to_owned())
            .unwrap_or_default();

        let confirm = match self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: options.mandatory,
                },
                payload,
                properties,
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                self.alive();
                Err(AmqpError::PublishingError)
            }
            Ok(c) => Ok(c),
        }?;

        if !self.confirm {
            return Ok(PublishOutcome::Flushed);
        }

        match confirm.await {
            Ok(Confirmation::Ack(None)) | Ok(Confirmation::NotRequested) => {
                Ok(PublishOutcome::Confirmed)
            }
            Ok(Confirmation::Ack(Some(returned))) => Ok(PublishOutcome::Returned(Box::new(
                message_from_delivery(&returned.delivery, "", ""),
            ))),
            Ok(Confirmation::Nack(_)) => {
                warn!("message {} was nacked by the broker", message_id);
                Err(AmqpError::PublishNacked(message_id))
            }
            Err(err) => {
                error!(error = err.to_string(), "error awaiting publisher confirm");
                self.alive();
                Err(AmqpError::ChannelError(err.to_string()))
            }
        }
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: Option<u16>,
    ) -> Result<DeliveryStream, AmqpError> {
        if let Some(prefetch) = prefetch {
            if let Err(err) = self
                .channel
                .basic_qos(prefetch, BasicQosOptions { global: false })
                .await
            {
                error!(error = err.to_string(), "failure to configure qos");
                return Err(AmqpError::QoSDeclarationError(queue.to_owned()));
            }
        }

        let consumer = match self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "failure to create the consumer");
                Err(AmqpError::ConsumerDeclarationError)
            }
            Ok(c) => Ok(c),
        }?;

        let tag = consumer_tag.to_owned();
        let queue = queue.to_owned();

        // A consumer cancelled by us ends its stream on a connected channel; anything
        // else means the channel went away.
        let channel = self.channel.clone();
        let notifier = self.notifier.clone();
        let ended = stream::poll_fn(move |_| {
            if !channel.status().connected() {
                debug!("deliveries of channel {} ended, channel is gone", channel.id());
                notifier.notify();
            }
            Poll::<Option<Result<Message, AmqpError>>>::Ready(None)
        });

        Ok(consumer
            .map(move |result| match result {
                Ok(delivery) => Ok(message_from_delivery(&delivery, &tag, &queue)),
                Err(err) => Err(AmqpError::ConsumerError(err.to_string())),
            })
            .chain(ended)
            .boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        if !self.alive() {
            return Err(AmqpError::CancelConsumerError(consumer_tag.to_owned()));
        }

        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to cancel consumer");
                self.alive();
                AmqpError::CancelConsumerError(consumer_tag.to_owned())
            })
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        if !self.alive() {
            return Err(AmqpError::ChannelClosed("ack"));
        }

        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                if self.alive() {
                    AmqpError::AckMessageError
                } else {
                    AmqpError::ChannelClosed("ack")
                }
            })
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        if !self.alive() {
            return Err(AmqpError::ChannelClosed("nack"));
        }

        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling nack msg");
                if self.alive() {
                    AmqpError::NackMessageError
                } else {
                    AmqpError::ChannelClosed("nack")
                }
            })
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if !self.alive() {
            return Ok(());
        }

        let result = self.channel.close(200, "OK").await;
        self.notifier.notify();

        result.map_err(|err| {
            error!(error = err.to_string(), "error closing the channel");
            AmqpError::ChannelError(err.to_string())
        })
    }
}

/// A connection together with the channels created on it.
struct Link {
    connection: Connection,
    channels: Arc<NotifierRegistry>,
}

impl Link {
    async fn open(settings: &AmqpSettings) -> Result<Link, AmqpError> {
        debug!("creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(settings.connection_name.clone()));

        let connection = match Connection::connect(&settings.uri(), options).await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError)
            }
        }?;
        debug!("amqp connected");

        let channels: Arc<NotifierRegistry> = Arc::default();
        let on_error = channels.clone();
        connection.on_error(move |err| {
            error!(error = err.to_string(), "amqp connection failed");
            on_error.notify_all();
        });

        Ok(Link {
            connection,
            channels,
        })
    }

    fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }
}

/// Returns the connection held in `slot`, connecting first when the slot is empty or the
/// held connection is no longer alive. A failed connect leaves the slot untouched.
pub(crate) async fn ensure_connected<'s, C, F, Fut>(
    slot: &'s mut Option<C>,
    alive: impl Fn(&C) -> bool,
    connect: F,
) -> Result<&'s C, AmqpError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<C, AmqpError>>,
{
    if !slot.as_ref().is_some_and(&alive) {
        if slot.is_some() {
            warn!("amqp connection lost, reconnecting");
        }
        *slot = Some(connect().await?);
    }

    slot.as_ref().ok_or(AmqpError::ConnectionError)
}

/// lapin backed [`ChannelProvider`].
///
/// One normal and one confirm publisher channel are shared and recreated on demand once
/// they disconnect; consumer channels are created fresh for every request. The
/// connection itself is re-established on the next request after it drops.
pub struct LapinChannelPool {
    settings: AmqpSettings,
    link: tokio::sync::Mutex<Option<Link>>,
    normal: tokio::sync::Mutex<Option<Arc<LapinChannel>>>,
    confirm: tokio::sync::Mutex<Option<Arc<LapinChannel>>>,
}

impl LapinChannelPool {
    /// Connects to RabbitMQ with the given settings.
    ///
    /// # Parameters
    /// * `settings` - Connection details; kept for reconnecting
    ///
    /// # Returns
    /// The shared pool, or `AmqpError::ConnectionError` when the first connect fails
    ///
    /// # Example
    /// ```no_run
    /// # async fn run() -> Result<(), warren::errors::AmqpError> {
    /// let pool = warren::channel::LapinChannelPool::connect(&Default::default()).await?;
    /// # Ok(()) }
    /// ```
    pub async fn connect(settings: &AmqpSettings) -> Result<Arc<LapinChannelPool>, AmqpError> {
        let link = Link::open(settings).await?;

        Ok(Arc::new(LapinChannelPool {
            settings: settings.clone(),
            link: tokio::sync::Mutex::new(Some(link)),
            normal: tokio::sync::Mutex::default(),
            confirm: tokio::sync::Mutex::default(),
        }))
    }

    async fn create_channel(&self, confirm: bool) -> Result<Arc<LapinChannel>, AmqpError> {
        let mut slot = self.link.lock().await;

        if let Some(stale) = slot.as_ref().filter(|link| !link.is_connected()) {
            stale.channels.notify_all();
        }
        let link = ensure_connected(&mut *slot, Link::is_connected, || {
            Link::open(&self.settings)
        })
        .await?;

        debug!("creating amqp channel...");
        let channel = match link.connection.create_channel().await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError(err.to_string()))
            }
        }?;

        if confirm {
            if let Err(err) = channel
                .confirm_select(ConfirmSelectOptions { nowait: false })
                .await
            {
                error!(error = err.to_string(), "error enabling publisher confirms");
                return Err(AmqpError::ChannelError(err.to_string()));
            }
        }

        debug!("channel {} created", channel.id());
        let channel = LapinChannel::new(channel, confirm);
        link.channels.track(&channel.notifier);
        Ok(channel)
    }
}

#[async_trait]
impl ChannelProvider for LapinChannelPool {
    async fn publisher_channel(&self, confirm: bool) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        let slot = if confirm { &self.confirm } else { &self.normal };
        let mut pooled = slot.lock().await;

        if let Some(channel) = pooled.as_ref() {
            if channel.is_connected() {
                return Ok(channel.clone() as Arc<dyn AmqpChannel>);
            }
            debug!("discarding disconnected channel {}", channel.id());
        }

        let channel = self.create_channel(confirm).await?;
        *pooled = Some(channel.clone());
        Ok(channel as Arc<dyn AmqpChannel>)
    }

    async fn consumer_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        let channel = self.create_channel(false).await?;
        Ok(channel as Arc<dyn AmqpChannel>)
    }
}
