// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Channel Sessions
//!
//! A [`ChannelSession`] is the reconnect-resilient handle behind one logical
//! subscription. Over its lifetime it is backed by one or more physical channels, each
//! registered under the consumer tag it was opened with.
//!
//! Entries live in a tag-keyed map and carry a `doomed` flag:
//!
//! - the *current* channel is the non-doomed entry with the highest sequence index, and is
//!   the only one structural operations (cancel, close) ever target;
//! - acknowledgements are routed by the tag recorded on the message, never through the
//!   current channel, so a message can still be acked or nacked on the channel that
//!   delivered it while that channel is doomed and waiting for its deferred close;
//! - an entry is only removed when its channel reports that it closed or errored.
//!
//! Structural operations run one at a time through a [`SequentialOperationQueue`].
//! Acknowledgements bypass the queue.

use crate::{
    channel::AmqpChannel,
    config::SessionConfig,
    errors::AmqpError,
    message::Message,
    operations::SequentialOperationQueue,
    scheduler::DeferredCloseScheduler,
};
use std::{
    collections::BTreeMap,
    future::Future,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    time::Duration,
};
use tokio::task::AbortHandle;
use tracing::{debug, warn};

/// Options of a negative acknowledgement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NackOptions {
    /// Put the message back on the queue instead of dead-lettering or dropping it.
    pub requeue: bool,
}

impl NackOptions {
    pub fn requeue() -> NackOptions {
        NackOptions { requeue: true }
    }
}

/// A physical channel backing a session.
#[derive(Clone)]
pub struct ChannelEntry {
    pub index: u64,
    pub channel: Arc<dyn AmqpChannel>,
    pub tag: String,
    pub doomed: bool,
}

#[derive(Default)]
struct SessionState {
    next_index: u64,
    cancelled: bool,
    channels: BTreeMap<String, ChannelEntry>,
}

struct SessionInner {
    config: SessionConfig,
    operations: SequentialOperationQueue,
    closer: DeferredCloseScheduler,
    state: Mutex<SessionState>,
    timer: Mutex<Option<AbortHandle>>,
}

impl SessionInner {
    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lookup(&self, tag: &str) -> Option<Arc<dyn AmqpChannel>> {
        self.state()
            .channels
            .get(tag)
            .map(|entry| entry.channel.clone())
    }

    fn current(&self) -> Option<ChannelEntry> {
        self.state()
            .channels
            .values()
            .filter(|entry| !entry.doomed)
            .max_by_key(|entry| entry.index)
            .cloned()
    }

    fn holds(&self, tag: &str, index: u64) -> bool {
        self.state()
            .channels
            .get(tag)
            .is_some_and(|entry| entry.index == index)
    }

    /// Removes the entry of a channel that closed or errored. The index guards against a
    /// late notification removing a newer entry registered under the same tag.
    fn unref(&self, tag: &str, index: u64) {
        let mut state = self.state();
        if state
            .channels
            .get(tag)
            .is_some_and(|entry| entry.index == index)
        {
            if let Some(entry) = state.channels.remove(tag) {
                debug!(
                    "removing channel: {} from session: {}",
                    entry.channel.id(),
                    self.config.name
                );
            }
        }
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        if let Some(timer) = self
            .timer
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            timer.abort();
        }

        // Nobody can acknowledge through a dropped session, so doomed channels do not
        // need the rest of their grace period.
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        let doomed: Vec<Arc<dyn AmqpChannel>> = state
            .channels
            .values()
            .filter(|entry| entry.doomed)
            .map(|entry| entry.channel.clone())
            .collect();

        if state.channels.len() > doomed.len() {
            warn!(
                "session: {} dropped with {} live channels",
                self.config.name,
                state.channels.len() - doomed.len()
            );
        }

        if doomed.is_empty() {
            return;
        }

        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                for channel in doomed {
                    if let Err(err) = channel.close().await {
                        warn!(error = err.to_string(), "failure to close doomed channel");
                    }
                }
            });
        }
    }
}

/// Reconnect-resilient handle over the channels backing one subscription.
///
/// Cloning is cheap; clones share the same session.
#[derive(Clone)]
pub struct ChannelSession {
    inner: Arc<SessionInner>,
}

impl ChannelSession {
    /// Creates a session. The configuration is copied and never changes afterwards.
    pub fn new(config: &SessionConfig) -> ChannelSession {
        ChannelSession {
            inner: Arc::new(SessionInner {
                operations: SequentialOperationQueue::new(&config.name),
                closer: DeferredCloseScheduler::new(config.defer_close_duration()),
                config: config.clone(),
                state: Mutex::default(),
                timer: Mutex::default(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.state().cancelled
    }

    /// Registers a new backing channel under `tag`.
    ///
    /// Fails with [`AmqpError::SessionCancelled`] once the session has been cancelled and
    /// with [`AmqpError::DuplicateConsumerTag`] while another entry holds `tag`. The
    /// entry is removed as soon as the channel reports that it closed or errored.
    pub async fn open(&self, channel: Arc<dyn AmqpChannel>, tag: &str) -> Result<(), AmqpError> {
        self.inner
            .operations
            .push(async move { self.register(channel, tag) })
            .await
    }

    fn register(&self, channel: Arc<dyn AmqpChannel>, tag: &str) -> Result<(), AmqpError> {
        let index = {
            let mut state = self.inner.state();
            if state.cancelled {
                return Err(AmqpError::SessionCancelled(self.name().to_owned()));
            }
            if state.channels.contains_key(tag) {
                return Err(AmqpError::DuplicateConsumerTag(tag.to_owned()));
            }

            let index = state.next_index;
            state.next_index += 1;
            state.channels.insert(
                tag.to_owned(),
                ChannelEntry {
                    index,
                    channel: channel.clone(),
                    tag: tag.to_owned(),
                    doomed: false,
                },
            );
            index
        };

        debug!(
            "opening session: {} consumer: {} on channel: {}",
            self.name(),
            tag,
            channel.id()
        );

        let session: Weak<SessionInner> = Arc::downgrade(&self.inner);
        let tag = tag.to_owned();
        channel.on_close(Box::new(move || {
            if let Some(inner) = session.upgrade() {
                inner.unref(&tag, index);
            }
        }));

        Ok(())
    }

    /// Cancels the session for good, then cancels the consumer on the current channel.
    ///
    /// Every later [`ChannelSession::open`] fails.
    pub async fn cancel(&self) -> Result<(), AmqpError> {
        self.clear_timer();
        self.inner
            .operations
            .push(async move {
                self.inner.state().cancelled = true;
                self.unsafe_close().await
            })
            .await
    }

    /// Cancels the consumer on the current channel without cancelling the session, so a
    /// replacement channel can be opened afterwards.
    pub async fn close(&self) -> Result<(), AmqpError> {
        self.inner
            .operations
            .push(async move { self.unsafe_close().await })
            .await
    }

    /// Cancels the consumer on the current channel and dooms it. Succeeds trivially when
    /// there is no current channel, or when the channel goes away while cancelling.
    ///
    /// Not serialized; callers outside the operation queue must not race it with other
    /// structural operations.
    pub async fn unsafe_close(&self) -> Result<(), AmqpError> {
        let Some(entry) = self.inner.current() else {
            debug!("no current channel on session: {}", self.name());
            return Ok(());
        };

        debug!(
            "cancelling session: {} consumer: {} on channel: {}",
            self.name(),
            entry.tag,
            entry.channel.id()
        );
        if let Err(err) = entry.channel.cancel(&entry.tag).await {
            if self.inner.holds(&entry.tag, entry.index) {
                return Err(err);
            }
            debug!(
                "channel: {} of session: {} went away while cancelling consumer: {}",
                entry.channel.id(),
                self.name(),
                entry.tag
            );
            return Ok(());
        }
        self.doom(&entry.tag);
        Ok(())
    }

    fn doom(&self, tag: &str) {
        {
            let mut state = self.inner.state();
            let Some(entry) = state.channels.get_mut(tag) else {
                return;
            };
            if entry.doomed {
                return;
            }
            entry.doomed = true;
        }

        let session = Arc::downgrade(&self.inner);
        let target = tag.to_owned();
        self.inner.closer.schedule(tag, move || {
            session.upgrade().and_then(|inner| inner.lookup(&target))
        });
    }

    /// Acknowledges `message` on the channel that delivered it.
    ///
    /// # Parameters
    /// * `message` - A message delivered through this session; its consumer tag selects
    ///   the channel
    ///
    /// # Returns
    /// [`AmqpError::ChannelClosed`] when that channel is no longer registered
    pub async fn ack(&self, message: &Message) -> Result<(), AmqpError> {
        let Some(channel) = self.inner.lookup(&message.consumer_tag) else {
            return Err(AmqpError::ChannelClosed("ack"));
        };

        debug!(
            "acknowledging message: {} on channel: {}",
            message.id,
            channel.id()
        );
        channel.ack(message.delivery_tag).await
    }

    /// Negatively acknowledges `message` on the channel that delivered it.
    pub async fn nack(&self, message: &Message, options: NackOptions) -> Result<(), AmqpError> {
        let Some(channel) = self.inner.lookup(&message.consumer_tag) else {
            return Err(AmqpError::ChannelClosed("nack"));
        };

        debug!(
            "not acknowledging message: {} with requeue: {} on channel: {}",
            message.id,
            options.requeue,
            channel.id()
        );
        channel.nack(message.delivery_tag, options.requeue).await
    }

    /// Id of the current channel, if any.
    pub fn current_channel_id(&self) -> Option<String> {
        self.inner.current().map(|entry| entry.channel.id())
    }

    /// Whether an entry, doomed or not, is registered under `tag`.
    pub fn contains(&self, tag: &str) -> bool {
        self.inner.state().channels.contains_key(tag)
    }

    /// Deferred close period when coordinated with an owner using `other`.
    pub fn max_defer_close(&self, other: Duration) -> Duration {
        self.inner.closer.max_defer_close(other)
    }

    /// Runs `task` after `delay`, replacing any task scheduled earlier. The pending task
    /// is dropped when the session is cancelled.
    pub fn schedule<F>(&self, delay: Duration, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            task.await;
        });

        let previous = self
            .inner
            .timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(timer.abort_handle());

        if let Some(previous) = previous {
            previous.abort();
        }
    }

    fn clear_timer(&self) {
        if let Some(timer) = self
            .inner
            .timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            timer.abort();
        }
    }
}
