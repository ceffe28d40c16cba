// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Publisher
//!
//! Publishes messages to configured publications. Each publish runs the pipeline:
//!
//! 1. assign the message id (caller supplied or a random UUID);
//! 2. encode the payload and pick its content type;
//! 3. encrypt it when the publication has an encryption profile;
//! 4. acquire a confirm or normal channel from the provider;
//! 5. publish and resolve the outcome, retrying transient channel failures.
//!
//! Configuration and encryption errors are returned straight away, before any network
//! I/O. Everything after that is reported through the returned [`Publication`] handle,
//! which resolves to exactly one [`PublicationEvent`].

use crate::{
    channel::{ChannelProvider, PublishOptions, PublishOutcome},
    config::RetryPolicy,
    encryption::{encrypt_payload, EncryptionSpec},
    errors::AmqpError,
    message::{
        long_string, namespace_field, set_namespace_field, Message, Payload,
        BINARY_CONTENT_TYPE, HEADER_ENCRYPTION, HEADER_ORIGINAL_EXCHANGE, HEADER_ORIGINAL_QUEUE,
        HEADER_ORIGINAL_ROUTING_KEY, HEADER_RESTORE_ROUTING_HEADERS,
    },
    otel,
};
use lapin::{
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties,
};
use opentelemetry::Context;
use serde::Deserialize;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, SystemTime},
};
use tokio::{sync::oneshot, time::Instant};
use tracing::{debug, error, warn};
use uuid::Uuid;

fn enabled() -> bool {
    true
}

/// Where a publication sends its messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    Exchange { name: String, routing_key: String },
    Queue(String),
}

/// Definition of a named publication.
///
/// Publications target either an exchange (with an optional routing key) or a queue
/// through the default exchange. `confirm` and `mandatory` both default to `true` so
/// unroutable messages are reported back as [`PublicationEvent::Returned`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PublicationDefinition {
    pub name: String,
    #[serde(default)]
    pub exchange: Option<String>,
    #[serde(default)]
    pub queue: Option<String>,
    #[serde(default)]
    pub routing_key: Option<String>,
    #[serde(default = "enabled")]
    pub confirm: bool,
    #[serde(default = "enabled")]
    pub mandatory: bool,
    #[serde(default)]
    pub encryption: Option<EncryptionSpec>,
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl PublicationDefinition {
    pub fn new(name: &str) -> PublicationDefinition {
        PublicationDefinition {
            name: name.to_owned(),
            exchange: None,
            queue: None,
            routing_key: None,
            confirm: true,
            mandatory: true,
            encryption: None,
            retry: RetryPolicy::default(),
        }
    }

    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange = Some(exchange.to_owned());
        self.queue = None;
        self
    }

    pub fn queue(mut self, queue: &str) -> Self {
        self.queue = Some(queue.to_owned());
        self.exchange = None;
        self
    }

    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = Some(key.to_owned());
        self
    }

    /// Publishes on normal channels, resolving as soon as the message is written.
    ///
    /// Unroutable messages are only reported on confirm channels, so a mandatory
    /// publication without confirms resolves `Success` even when nothing was routed.
    pub fn no_confirm(mut self) -> Self {
        self.confirm = false;
        self
    }

    /// Stops asking the broker to return unroutable messages.
    pub fn not_mandatory(mut self) -> Self {
        self.mandatory = false;
        self
    }

    pub fn encryption(mut self, spec: EncryptionSpec) -> Self {
        self.encryption = Some(spec);
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn destination(&self) -> Destination {
        match (&self.exchange, &self.queue) {
            (_, Some(queue)) => Destination::Queue(queue.clone()),
            (exchange, None) => Destination::Exchange {
                name: exchange.clone().unwrap_or_default(),
                routing_key: self.routing_key.clone().unwrap_or_default(),
            },
        }
    }
}

/// Per-publish overrides of the publication's defaults.
#[derive(Debug, Clone, Default)]
pub struct PublishOverrides {
    pub message_id: Option<String>,
    pub content_type: Option<String>,
    pub routing_key: Option<String>,
    /// Per-message TTL in milliseconds.
    pub expiration: Option<String>,
    pub mandatory: Option<bool>,
    pub headers: FieldTable,
    /// Forwarding only: whether a later hop should reapply the original routing key.
    pub restore_routing_headers: bool,
}

impl PublishOverrides {
    pub fn message_id(mut self, id: &str) -> Self {
        self.message_id = Some(id.to_owned());
        self
    }

    pub fn content_type(mut self, content_type: &str) -> Self {
        self.content_type = Some(content_type.to_owned());
        self
    }

    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = Some(key.to_owned());
        self
    }

    pub fn expiration(mut self, ttl: Duration) -> Self {
        self.expiration = Some(ttl.as_millis().to_string());
        self
    }

    pub fn mandatory(mut self, mandatory: bool) -> Self {
        self.mandatory = Some(mandatory);
        self
    }

    pub fn header(mut self, key: &str, value: AMQPValue) -> Self {
        self.headers.insert(ShortString::from(key), value);
        self
    }

    pub fn restore_routing_headers(mut self) -> Self {
        self.restore_routing_headers = true;
        self
    }
}

/// Outcome of a publication.
#[derive(Debug, Clone)]
pub enum PublicationEvent {
    /// Written (normal channel) or confirmed (confirm channel); carries the message id.
    Success(String),
    /// Failed, after retries when the failure was transient.
    Error(AmqpError),
    /// Published with the mandatory flag but not routed to any queue.
    Returned(Box<Message>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublicationStats {
    pub started_at: SystemTime,
    /// Time from invocation to outcome, retries included. Set once the outcome is known.
    pub duration: Option<Duration>,
}

/// Handle on an in-flight publication.
pub struct Publication {
    name: String,
    message_id: String,
    receiver: Option<oneshot::Receiver<PublicationEvent>>,
    event: Option<PublicationEvent>,
    stats: Arc<Mutex<PublicationStats>>,
}

impl Publication {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn stats(&self) -> PublicationStats {
        *self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Waits for the outcome. Later calls return the same event.
    pub async fn outcome(&mut self) -> PublicationEvent {
        if let Some(receiver) = self.receiver.take() {
            let event = receiver
                .await
                .unwrap_or(PublicationEvent::Error(AmqpError::InternalError));
            self.event = Some(event);
        }

        self.event
            .clone()
            .unwrap_or(PublicationEvent::Error(AmqpError::InternalError))
    }
}

/// A fully prepared message, ready to hand to a channel.
#[derive(Debug, Clone)]
struct PublicationRecord {
    id: String,
    exchange: String,
    routing_key: String,
    confirm: bool,
    mandatory: bool,
    payload: Vec<u8>,
    properties: BasicProperties,
}

/// Publishes to the publications registered on it.
pub struct Publisher {
    provider: Arc<dyn ChannelProvider>,
    publications: HashMap<String, PublicationDefinition>,
}

impl Publisher {
    /// Creates a publisher without publications.
    ///
    /// # Parameters
    /// * `provider` - Source of the pooled publisher channels
    ///
    /// # Returns
    /// A publisher to register publication definitions on
    pub fn new(provider: Arc<dyn ChannelProvider>) -> Publisher {
        Publisher {
            provider,
            publications: HashMap::default(),
        }
    }

    /// Registers a publication definition.
    pub fn register(mut self, def: PublicationDefinition) -> Self {
        self.publications.insert(def.name.clone(), def);
        self
    }

    fn definition(&self, name: &str) -> Result<&PublicationDefinition, AmqpError> {
        self.publications.get(name).ok_or_else(|| {
            error!("unknown publication: {}", name);
            AmqpError::UnknownPublication(name.to_owned())
        })
    }

    /// Publishes `payload` to the publication `name`.
    ///
    /// # Parameters
    /// * `name` - Registered publication name
    /// * `payload` - Text, bytes or JSON; encoded and encrypted per the publication
    /// * `overrides` - Per-message id, routing key, headers and flags
    ///
    /// # Returns
    /// A [`Publication`] whose outcome resolves once the broker accepted, returned or
    /// rejected the message, or an error when the publication is unknown or the payload
    /// cannot be encoded or encrypted
    pub fn publish(
        &self,
        name: &str,
        payload: impl Into<Payload>,
        overrides: PublishOverrides,
    ) -> Result<Publication, AmqpError> {
        let started = Instant::now();
        let started_at = SystemTime::now();
        let def = self.definition(name)?;

        let id = overrides
            .message_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let payload: Payload = payload.into();
        let (body, default_content_type) = payload.encode()?;
        let content_type = overrides
            .content_type
            .clone()
            .unwrap_or_else(|| default_content_type.to_owned());

        let mut headers = overrides.headers.clone();
        otel::inject(&Context::current(), &mut headers);

        let (body, content_type) = match &def.encryption {
            Some(spec) => {
                let (ciphertext, ct) = encrypt_payload(spec, &body, &content_type, &mut headers)?;
                (ciphertext, ct.to_owned())
            }
            None => (body, content_type),
        };

        let (exchange, routing_key) = match def.destination() {
            Destination::Exchange { name, routing_key } => {
                (name, overrides.routing_key.clone().unwrap_or(routing_key))
            }
            Destination::Queue(queue) => (String::new(), queue),
        };

        let record = PublicationRecord {
            properties: properties(&id, &content_type, &overrides, headers),
            id,
            exchange,
            routing_key,
            confirm: def.confirm,
            mandatory: overrides.mandatory.unwrap_or(def.mandatory),
            payload: body,
        };

        Ok(self.start(def, record, started, started_at))
    }

    /// Republishes a received message to the publication `name`.
    ///
    /// The message keeps its id and content type. Its routing key is kept unless the
    /// overrides or the publication supply one, and its provenance (queue, exchange and
    /// routing key) is recorded under the reserved header namespace.
    ///
    /// # Returns
    /// The in-flight [`Publication`], or `UnknownPublication`
    pub fn forward(
        &self,
        name: &str,
        message: &Message,
        overrides: PublishOverrides,
    ) -> Result<Publication, AmqpError> {
        let started = Instant::now();
        let started_at = SystemTime::now();
        let def = self.definition(name)?;

        let mut headers = message.headers.clone();
        for (key, value) in overrides.headers.inner() {
            headers.insert(key.clone(), value.clone());
        }
        set_namespace_field(&mut headers, HEADER_ORIGINAL_QUEUE, long_string(&message.queue));
        set_namespace_field(
            &mut headers,
            HEADER_ORIGINAL_EXCHANGE,
            long_string(&message.exchange),
        );
        set_namespace_field(
            &mut headers,
            HEADER_ORIGINAL_ROUTING_KEY,
            long_string(&message.routing_key),
        );
        set_namespace_field(
            &mut headers,
            HEADER_RESTORE_ROUTING_HEADERS,
            AMQPValue::Boolean(overrides.restore_routing_headers),
        );

        let content_type = overrides
            .content_type
            .clone()
            .or_else(|| message.content_type.clone())
            .unwrap_or_else(|| BINARY_CONTENT_TYPE.to_owned());

        let already_encrypted = namespace_field(&message.headers, HEADER_ENCRYPTION).is_some();
        let (body, content_type) = match &def.encryption {
            Some(spec) if !already_encrypted => {
                let (ciphertext, ct) =
                    encrypt_payload(spec, &message.payload, &content_type, &mut headers)?;
                (ciphertext, ct.to_owned())
            }
            _ => (message.payload.clone(), content_type),
        };

        let (exchange, routing_key) = match def.destination() {
            Destination::Exchange { name, .. } => (
                name,
                overrides
                    .routing_key
                    .clone()
                    .or_else(|| def.routing_key.clone())
                    .unwrap_or_else(|| message.routing_key.clone()),
            ),
            Destination::Queue(queue) => (String::new(), queue),
        };

        debug!(
            "forwarding message: {} from queue: {} to publication: {}",
            message.id, message.queue, name
        );

        let record = PublicationRecord {
            properties: properties(&message.id, &content_type, &overrides, headers),
            id: message.id.clone(),
            exchange,
            routing_key,
            confirm: def.confirm,
            mandatory: overrides.mandatory.unwrap_or(def.mandatory),
            payload: body,
        };

        Ok(self.start(def, record, started, started_at))
    }

    fn start(
        &self,
        def: &PublicationDefinition,
        record: PublicationRecord,
        started: Instant,
        started_at: SystemTime,
    ) -> Publication {
        let (sender, receiver) = oneshot::channel();
        let stats = Arc::new(Mutex::new(PublicationStats {
            started_at,
            duration: None,
        }));

        let publication = Publication {
            name: def.name.clone(),
            message_id: record.id.clone(),
            receiver: Some(receiver),
            event: None,
            stats: stats.clone(),
        };

        let provider = self.provider.clone();
        let retry = def.retry.clone();
        tokio::spawn(async move {
            let event = deliver(provider.as_ref(), &record, &retry).await;

            stats
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .duration = Some(started.elapsed());

            if sender.send(event).is_err() {
                debug!("publication handle for message: {} was dropped", record.id);
            }
        });

        publication
    }
}

fn properties(
    id: &str,
    content_type: &str,
    overrides: &PublishOverrides,
    headers: FieldTable,
) -> BasicProperties {
    let properties = BasicProperties::default()
        .with_message_id(ShortString::from(id.to_owned()))
        .with_content_type(ShortString::from(content_type.to_owned()))
        .with_headers(headers);

    match &overrides.expiration {
        Some(expiration) => properties.with_expiration(ShortString::from(expiration.clone())),
        None => properties,
    }
}

async fn deliver(
    provider: &dyn ChannelProvider,
    record: &PublicationRecord,
    retry: &RetryPolicy,
) -> PublicationEvent {
    let mut attempt = 1;

    loop {
        match publish_once(provider, record).await {
            Ok(PublishOutcome::Flushed) | Ok(PublishOutcome::Confirmed) => {
                debug!("message: {} published", record.id);
                return PublicationEvent::Success(record.id.clone());
            }
            Ok(PublishOutcome::Returned(message)) => {
                warn!("message: {} was returned unrouted", record.id);
                return PublicationEvent::Returned(message);
            }
            Err(err) if err.is_transient() && attempt < retry.max_attempts => {
                let delay = retry.delay(attempt);
                warn!(
                    error = err.to_string(),
                    "publish attempt {} of message: {} failed, retrying in {:?}",
                    attempt,
                    record.id,
                    delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => {
                error!(error = err.to_string(), "error publishing message: {}", record.id);
                return PublicationEvent::Error(err);
            }
        }
    }
}

async fn publish_once(
    provider: &dyn ChannelProvider,
    record: &PublicationRecord,
) -> Result<PublishOutcome, AmqpError> {
    let channel = provider.publisher_channel(record.confirm).await?;

    channel
        .publish(
            &record.exchange,
            &record.routing_key,
            PublishOptions {
                mandatory: record.mandatory,
            },
            &record.payload,
            record.properties.clone(),
        )
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        channel::{AmqpChannel, MockAmqpChannel, MockChannelProvider},
        encryption::{decrypt, encryption_field},
        message::{as_string, JSON_CONTENT_TYPE, TEXT_CONTENT_TYPE},
    };
    use serde_json::json;

    const KEY: &str = "f81db52a3b2c717fe65d9a3b7dd04d2a08793e1a28e3083db3ea08db56e7c315";

    #[derive(Debug, Clone)]
    struct Sent {
        exchange: String,
        routing_key: String,
        mandatory: bool,
        payload: Vec<u8>,
        properties: BasicProperties,
    }

    type Wire = Arc<Mutex<Vec<Sent>>>;

    /// A channel recording what it publishes and answering with `outcomes` in turn.
    fn recording_channel(
        wire: &Wire,
        mut outcomes: Vec<Result<PublishOutcome, AmqpError>>,
    ) -> Arc<dyn AmqpChannel> {
        outcomes.reverse();
        let wire = wire.clone();
        let mut channel = MockAmqpChannel::new();
        channel.expect_id().return_const("1".to_owned());
        channel.expect_publish().returning(
            move |exchange, routing_key, options, payload, properties| {
                wire.lock().unwrap().push(Sent {
                    exchange: exchange.to_owned(),
                    routing_key: routing_key.to_owned(),
                    mandatory: options.mandatory,
                    payload: payload.to_vec(),
                    properties,
                });
                outcomes.pop().unwrap_or(Ok(PublishOutcome::Flushed))
            },
        );
        Arc::new(channel)
    }

    fn provider(channel: Arc<dyn AmqpChannel>, confirm: bool) -> Arc<dyn ChannelProvider> {
        let mut provider = MockChannelProvider::new();
        provider
            .expect_publisher_channel()
            .withf(move |requested| *requested == confirm)
            .returning(move |_| Ok(channel.clone()));
        Arc::new(provider)
    }

    fn publisher(wire: &Wire, def: PublicationDefinition) -> Publisher {
        let confirm = def.confirm;
        Publisher::new(provider(recording_channel(wire, vec![]), confirm)).register(def)
    }

    fn content_type(sent: &Sent) -> Option<String> {
        sent.properties.content_type().as_ref().map(|ct| ct.to_string())
    }

    fn message_id(sent: &Sent) -> Option<String> {
        sent.properties.message_id().as_ref().map(|id| id.to_string())
    }

    fn header(sent: &Sent, key: &str) -> Option<AMQPValue> {
        sent.properties
            .headers()
            .as_ref()
            .and_then(|headers| namespace_field(headers, key).cloned())
    }

    #[tokio::test]
    async fn reports_unknown_publications() {
        let publisher = Publisher::new(Arc::new(MockChannelProvider::new()));

        let result = publisher.publish("does-not-exist", "test message", PublishOverrides::default());
        assert_eq!(
            result.err(),
            Some(AmqpError::UnknownPublication("does-not-exist".to_owned()))
        );
    }

    #[tokio::test]
    async fn publishes_text_to_an_exchange() {
        let wire = Wire::default();
        let publisher = publisher(
            &wire,
            PublicationDefinition::new("p1").exchange("e1").routing_key("rk1"),
        );

        let mut publication = publisher
            .publish("p1", "hello", PublishOverrides::default())
            .unwrap();
        let PublicationEvent::Success(id) = publication.outcome().await else {
            panic!("expected success");
        };

        assert!(Uuid::parse_str(&id).is_ok());
        assert_eq!(id, publication.message_id());

        let sent = wire.lock().unwrap()[0].clone();
        assert_eq!(sent.exchange, "e1");
        assert_eq!(sent.routing_key, "rk1");
        assert!(sent.mandatory);
        assert_eq!(sent.payload, b"hello");
        assert_eq!(content_type(&sent).as_deref(), Some(TEXT_CONTENT_TYPE));
        assert_eq!(message_id(&sent), Some(id));
    }

    #[tokio::test]
    async fn publishes_json_and_bytes() {
        let wire = Wire::default();
        let publisher = publisher(&wire, PublicationDefinition::new("p1").exchange("e1"));

        let mut json = publisher
            .publish(
                "p1",
                json!({ "message": "test message" }),
                PublishOverrides::default(),
            )
            .unwrap();
        json.outcome().await;

        let mut bytes = publisher
            .publish("p1", b"raw".to_vec(), PublishOverrides::default())
            .unwrap();
        bytes.outcome().await;

        let wire = wire.lock().unwrap();
        assert_eq!(content_type(&wire[0]).as_deref(), Some(JSON_CONTENT_TYPE));
        assert_eq!(wire[0].payload, br#"{"message":"test message"}"#);
        assert_eq!(content_type(&wire[1]).as_deref(), Some(BINARY_CONTENT_TYPE));
        assert_eq!(wire[1].payload, b"raw");
    }

    #[tokio::test]
    async fn honours_overrides() {
        let wire = Wire::default();
        let publisher = publisher(&wire, PublicationDefinition::new("p1").queue("q1"));

        let mut publication = publisher
            .publish(
                "p1",
                json!({ "message": "test message" }),
                PublishOverrides::default()
                    .message_id("my-id")
                    .content_type("application/vnd+custom.contentType.v1")
                    .expiration(Duration::from_millis(1)),
            )
            .unwrap();
        assert!(matches!(
            publication.outcome().await,
            PublicationEvent::Success(id) if id == "my-id"
        ));

        let sent = wire.lock().unwrap()[0].clone();
        assert_eq!(sent.exchange, "");
        assert_eq!(sent.routing_key, "q1");
        assert_eq!(
            content_type(&sent).as_deref(),
            Some("application/vnd+custom.contentType.v1")
        );
        assert_eq!(
            sent.properties.expiration().as_ref().map(|e| e.to_string()),
            Some("1".to_owned())
        );
    }

    #[tokio::test]
    async fn uses_confirm_channels_when_configured() {
        let wire = Wire::default();
        let channel = recording_channel(&wire, vec![Ok(PublishOutcome::Confirmed)]);
        let publisher = Publisher::new(provider(channel, true))
            .register(PublicationDefinition::new("p1").exchange("e1"));

        let mut publication = publisher
            .publish("p1", "test message", PublishOverrides::default())
            .unwrap();
        assert!(matches!(
            publication.outcome().await,
            PublicationEvent::Success(_)
        ));
    }

    #[tokio::test]
    async fn reports_unrouted_messages_by_default() {
        let wire = Wire::default();
        let returned = Message {
            id: "m1".to_owned(),
            payload: b"test message".to_vec(),
            ..Message::default()
        };
        let channel = recording_channel(
            &wire,
            vec![Ok(PublishOutcome::Returned(Box::new(returned)))],
        );
        let publisher = Publisher::new(provider(channel, true))
            .register(PublicationDefinition::new("p1").exchange("xx"));

        let mut publication = publisher
            .publish("p1", "test message", PublishOverrides::default())
            .unwrap();
        match publication.outcome().await {
            PublicationEvent::Returned(message) => assert_eq!(message.payload, b"test message"),
            other => panic!("expected a return, got {other:?}"),
        }
        assert!(wire.lock().unwrap()[0].mandatory);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_failures() {
        let wire = Wire::default();
        let channel = recording_channel(
            &wire,
            vec![
                Err(AmqpError::ChannelError("connection reset".to_owned())),
                Ok(PublishOutcome::Flushed),
            ],
        );
        let publisher = Publisher::new(provider(channel, false)).register(
            PublicationDefinition::new("p1")
                .exchange("e1")
                .no_confirm()
                .retry(RetryPolicy::exponential(
                    3,
                    Duration::from_millis(100),
                    Duration::from_secs(1),
                )),
        );

        let mut publication = publisher
            .publish("p1", "test message", PublishOverrides::default())
            .unwrap();
        assert!(matches!(
            publication.outcome().await,
            PublicationEvent::Success(_)
        ));
        assert_eq!(wire.lock().unwrap().len(), 2);
        assert!(publication.stats().duration.unwrap() >= Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn surfaces_errors_once_retries_are_exhausted() {
        let wire = Wire::default();
        let failure = || Err(AmqpError::ChannelError("connection reset".to_owned()));
        let channel = recording_channel(&wire, vec![failure(), failure(), failure()]);
        let publisher = Publisher::new(provider(channel, false)).register(
            PublicationDefinition::new("p1")
                .exchange("e1")
                .no_confirm()
                .retry(RetryPolicy::exponential(
                    2,
                    Duration::from_millis(10),
                    Duration::from_millis(10),
                )),
        );

        let mut publication = publisher
            .publish("p1", "test message", PublishOverrides::default())
            .unwrap();
        assert!(matches!(
            publication.outcome().await,
            PublicationEvent::Error(AmqpError::ChannelError(_))
        ));
        assert_eq!(wire.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn broker_nacks_are_not_retried() {
        let wire = Wire::default();
        let channel = recording_channel(
            &wire,
            vec![Err(AmqpError::PublishNacked("m1".to_owned()))],
        );
        let publisher = Publisher::new(provider(channel, true)).register(
            PublicationDefinition::new("p1")
                .exchange("e1")
                .retry(RetryPolicy::exponential(
                    5,
                    Duration::from_millis(1),
                    Duration::from_millis(1),
                )),
        );

        let mut publication = publisher
            .publish("p1", "test message", PublishOverrides::default())
            .unwrap();
        assert!(matches!(
            publication.outcome().await,
            PublicationEvent::Error(AmqpError::PublishNacked(_))
        ));
        assert_eq!(wire.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn encrypts_payloads() {
        let wire = Wire::default();
        let publisher = publisher(
            &wire,
            PublicationDefinition::new("p1")
                .queue("q1")
                .encryption(EncryptionSpec::new("well-known", KEY)),
        );

        let mut publication = publisher
            .publish("p1", "test message", PublishOverrides::default())
            .unwrap();
        publication.outcome().await;

        let sent = wire.lock().unwrap()[0].clone();
        let headers = sent.properties.headers().clone().unwrap();
        assert_eq!(content_type(&sent).as_deref(), Some(BINARY_CONTENT_TYPE));
        assert_eq!(
            encryption_field(&headers, "name").as_deref(),
            Some("well-known")
        );
        assert_eq!(
            encryption_field(&headers, "originalContentType").as_deref(),
            Some(TEXT_CONTENT_TYPE)
        );

        let iv = encryption_field(&headers, "iv").unwrap();
        assert_eq!(iv.len(), 32);
        let plaintext = decrypt(&EncryptionSpec::new("well-known", KEY), &iv, &sent.payload);
        assert_eq!(plaintext.unwrap(), b"test message");
    }

    #[tokio::test]
    async fn reports_encryption_errors_before_publishing() {
        let mut provider = MockChannelProvider::new();
        provider.expect_publisher_channel().times(0);
        let publisher = Publisher::new(Arc::new(provider)).register(
            PublicationDefinition::new("p1")
                .queue("q1")
                .encryption(EncryptionSpec::new("well-known", "aa")),
        );

        let result = publisher.publish("p1", "test message", PublishOverrides::default());
        assert_eq!(
            result.err(),
            Some(AmqpError::EncryptionError("Invalid key length".to_owned()))
        );
    }

    fn received() -> Message {
        Message {
            id: "original-id".to_owned(),
            content_type: Some(TEXT_CONTENT_TYPE.to_owned()),
            payload: b"test message".to_vec(),
            consumer_tag: "c1".to_owned(),
            delivery_tag: 1,
            exchange: "e1".to_owned(),
            routing_key: "rk1".to_owned(),
            queue: "q1".to_owned(),
            ..Message::default()
        }
    }

    #[tokio::test]
    async fn forwards_with_the_publication_routing_key() {
        let wire = Wire::default();
        let publisher = publisher(
            &wire,
            PublicationDefinition::new("p2").exchange("e2").routing_key("rk2"),
        );

        let mut publication = publisher
            .forward("p2", &received(), PublishOverrides::default())
            .unwrap();
        assert!(matches!(
            publication.outcome().await,
            PublicationEvent::Success(id) if id == "original-id"
        ));

        let sent = wire.lock().unwrap()[0].clone();
        assert_eq!(sent.exchange, "e2");
        assert_eq!(sent.routing_key, "rk2");
        assert_eq!(sent.payload, b"test message");
        assert_eq!(message_id(&sent).as_deref(), Some("original-id"));
        assert_eq!(content_type(&sent).as_deref(), Some(TEXT_CONTENT_TYPE));
        assert_eq!(
            header(&sent, HEADER_ORIGINAL_QUEUE).as_ref().and_then(as_string),
            Some("q1".to_owned())
        );
        assert_eq!(
            header(&sent, HEADER_ORIGINAL_EXCHANGE).as_ref().and_then(as_string),
            Some("e1".to_owned())
        );
        assert_eq!(
            header(&sent, HEADER_ORIGINAL_ROUTING_KEY).as_ref().and_then(as_string),
            Some("rk1".to_owned())
        );
        assert_eq!(
            header(&sent, HEADER_RESTORE_ROUTING_HEADERS),
            Some(AMQPValue::Boolean(false))
        );
    }

    #[tokio::test]
    async fn forwards_keeping_the_original_routing_key() {
        let wire = Wire::default();
        let publisher = publisher(&wire, PublicationDefinition::new("p2").exchange("e2"));

        let mut publication = publisher
            .forward("p2", &received(), PublishOverrides::default())
            .unwrap();
        publication.outcome().await;
        assert_eq!(wire.lock().unwrap()[0].routing_key, "rk1");

        let mut publication = publisher
            .forward(
                "p2",
                &received(),
                PublishOverrides::default()
                    .routing_key("rk3")
                    .restore_routing_headers(),
            )
            .unwrap();
        publication.outcome().await;

        let sent = wire.lock().unwrap()[1].clone();
        assert_eq!(sent.routing_key, "rk3");
        assert_eq!(
            header(&sent, HEADER_RESTORE_ROUTING_HEADERS),
            Some(AMQPValue::Boolean(true))
        );
    }

    #[tokio::test]
    async fn records_duration_once_resolved() {
        let wire = Wire::default();
        let publisher = publisher(&wire, PublicationDefinition::new("p1").exchange("e1"));

        let mut publication = publisher
            .publish("p1", "test message", PublishOverrides::default())
            .unwrap();
        publication.outcome().await;

        let stats = publication.stats();
        assert!(stats.duration.is_some());
        assert!(stats.started_at <= SystemTime::now());
    }

    #[test]
    fn definitions_deserialize_with_defaults() {
        let def: PublicationDefinition =
            serde_json::from_str(r#"{ "name": "p1", "exchange": "e1" }"#).unwrap();
        assert!(def.mandatory);
        assert!(def.confirm);
        assert_eq!(
            def.destination(),
            Destination::Exchange {
                name: "e1".to_owned(),
                routing_key: String::new()
            }
        );
    }
}
