//! lagoon-bouncer: an always-on IRC bouncer.
//!
//! Keeps upstream IRC networks connected whether or not any downstream
//! client is attached, and replays each network's log to clients when they
//! bind to it.

pub mod config;
pub mod irc;
pub mod store;
