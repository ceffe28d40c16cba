// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Sequential Operation Queue
//!
//! A FIFO executor with a concurrency of one. Sessions route their structural operations
//! (open, cancel, close) through it because those mutate session-wide state across await
//! points and must never interleave. Acknowledgements do not go through the queue.

use std::{
    future::Future,
    sync::atomic::{AtomicUsize, Ordering},
};
use tokio::sync::Mutex;
use tracing::debug;

/// Runs one operation at a time, in the order they were pushed.
///
/// Waiters are served in FIFO order because tokio's mutex is fair. The result of every
/// operation is handed back to the caller that pushed it, so a failing operation never
/// affects the next one.
#[derive(Debug)]
pub struct SequentialOperationQueue {
    name: String,
    running: Mutex<()>,
    queued: AtomicUsize,
}

impl SequentialOperationQueue {
    pub fn new(name: &str) -> SequentialOperationQueue {
        SequentialOperationQueue {
            name: name.to_owned(),
            running: Mutex::new(()),
            queued: AtomicUsize::new(0),
        }
    }

    /// Queues `operation` and resolves with its output once it has run.
    pub async fn push<F, T>(&self, operation: F) -> T
    where
        F: Future<Output = T>,
    {
        let queued = self.queued.fetch_add(1, Ordering::SeqCst);
        if queued > 0 {
            debug!("{} operations ahead on queue: {}", queued, self.name);
        }

        let _running = self.running.lock().await;
        let output = operation.await;
        self.queued.fetch_sub(1, Ordering::SeqCst);
        output
    }

    /// Number of operations running or waiting to run.
    pub fn len(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
