//! offsync: an offline-first request caching and background sync engine.
//!
//! The engine sits between an application and the network. Every outgoing
//! request is classified to a (namespace, strategy) route, resolved against
//! a named, versioned cache registry, and streamed back to the caller.
//! Failed mutations are persisted in a durable retry queue and replayed on
//! background triggers; lifecycle and sync events are broadcast to
//! controlling application instances.

pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod net;
pub mod notify;
pub mod queue;
pub mod routes;
pub mod strategy;
