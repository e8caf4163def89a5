// Copyright (c) 2026, The AmqpSync Authors
// MIT License
// All rights reserved.

//! # amqp-sync
//!
//! A synchronization and callback-orchestration layer in front of an
//! asynchronous AMQP client. A [`Client`] exposes every broker operation
//! as a blocking-style call that waits on a per-call completion signal,
//! while fully-asynchronous mode and the low-level `*_async` surface let
//! advanced callers manage their own signals and rely on lifecycle
//! handlers alone.

pub mod amqp;
pub mod broker;
pub mod client;
pub mod errors;
pub mod handlers;
pub mod options;
pub mod signal;

mod channel;

pub use client::{Client, ClientBuilder};
pub use errors::AmqpError;
pub use handlers::EventHandlers;
pub use signal::CompletionSignal;
