// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Deferred Channel Close
//!
//! A channel superseded by a reconnect or a cancel may still have delivered messages that
//! the application has not acknowledged yet, and there is no way of telling how many.
//! Instead of closing it straight away the session dooms it and this scheduler closes it
//! once a grace period has elapsed.
//!
//! Timers run as detached tokio tasks: nothing joins them, so they never hold up runtime
//! shutdown. They are aborted when the scheduler is dropped.

use crate::channel::AmqpChannel;
use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use tokio::task::AbortHandle;
use tracing::{debug, warn};

#[derive(Debug)]
pub struct DeferredCloseScheduler {
    defer: Duration,
    pending: Mutex<Vec<AbortHandle>>,
}

impl DeferredCloseScheduler {
    pub fn new(defer: Duration) -> DeferredCloseScheduler {
        DeferredCloseScheduler {
            defer,
            pending: Mutex::new(vec![]),
        }
    }

    /// Grace period when an owner with its own grace period `other` coordinates the
    /// close. Extends, never shortens, the configured one.
    pub fn max_defer_close(&self, other: Duration) -> Duration {
        self.defer.max(other)
    }

    /// Schedules the close of the channel registered under `tag`.
    ///
    /// `lookup` runs when the timer fires; the entry may have vanished in the meantime
    /// (unexpected close or error), in which case nothing is closed.
    pub fn schedule<F>(&self, tag: &str, lookup: F)
    where
        F: FnOnce() -> Option<Arc<dyn AmqpChannel>> + Send + 'static,
    {
        let defer = self.defer;
        let tag = tag.to_owned();
        debug!("deferring close of consumer: {} by {:?}", tag, defer);

        let timer = tokio::spawn(async move {
            tokio::time::sleep(defer).await;

            let Some(channel) = lookup() else {
                debug!("consumer: {} already removed, nothing to close", tag);
                return;
            };

            match channel.close().await {
                Ok(_) => debug!("channel: {} was closed", channel.id()),
                Err(err) => warn!(error = err.to_string(), "failure to close doomed channel"),
            }
        });

        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        pending.retain(|handle| !handle.is_finished());
        pending.push(timer.abort_handle());
    }

    /// Number of timers that have not fired yet.
    pub fn pending(&self) -> usize {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        pending.retain(|handle| !handle.is_finished());
        pending.len()
    }

    /// Aborts every timer that has not fired yet.
    pub fn abort_all(&self) {
        for handle in self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            handle.abort();
        }
    }
}

impl Drop for DeferredCloseScheduler {
    fn drop(&mut self) {
        self.abort_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MockAmqpChannel;

    fn closable(times: usize) -> Arc<dyn AmqpChannel> {
        let mut channel = MockAmqpChannel::new();
        channel.expect_close().times(times).returning(|| Ok(()));
        channel.expect_id().return_const("7".to_owned());
        Arc::new(channel)
    }

    #[tokio::test(start_paused = true)]
    async fn closes_after_the_grace_period() {
        let scheduler = DeferredCloseScheduler::new(Duration::from_millis(100));
        let channel = closable(1);

        let target = channel.clone();
        scheduler.schedule("c1", move || Some(target));
        assert_eq!(scheduler.pending(), 1);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(scheduler.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn skips_vanished_entries() {
        let scheduler = DeferredCloseScheduler::new(Duration::from_millis(100));
        let _channel = closable(0);

        scheduler.schedule("c1", || None);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(scheduler.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_scheduler_aborts_timers() {
        let scheduler = DeferredCloseScheduler::new(Duration::from_millis(100));
        let channel = closable(0);

        let target = channel.clone();
        scheduler.schedule("c1", move || Some(target));
        drop(scheduler);

        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    #[test]
    fn max_defer_close_only_extends() {
        let scheduler = DeferredCloseScheduler::new(Duration::from_millis(500));
        assert_eq!(
            scheduler.max_defer_close(Duration::from_millis(100)),
            Duration::from_millis(500)
        );
        assert_eq!(
            scheduler.max_defer_close(Duration::from_millis(900)),
            Duration::from_millis(900)
        );
    }
}
