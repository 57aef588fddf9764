//! Queue-to-HTTP relay.
//!
//! Consumes messages from a leased queue one at a time and posts each one to a
//! downstream HTTP service. A message is completed only after the downstream
//! answers with a 2xx status; every other outcome leaves it locked so the
//! broker redelivers it once the lock expires.

pub mod broker;
pub mod envelope;
pub mod fault;
pub mod handler;
pub mod health;
pub mod relay;
pub mod stats;
