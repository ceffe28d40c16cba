// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Resilient publishing and consuming over lapin.

mod consumer;
mod otel;

pub mod channel;
pub mod config;
pub mod encryption;
pub mod errors;
pub mod message;
pub mod operations;
pub mod publisher;
pub mod scheduler;
pub mod session;
pub mod subscriber;

pub use consumer::{AckOrNack, MessageHandler};
