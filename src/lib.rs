//! # sessionbus
//!
//! `sessionbus` is the message bus between stateless front ends and a pool of
//! workers serving interactive computing sessions. The two sides never talk
//! to each other directly: everything goes through a shared key-value /
//! pub-sub store.
//!
//! ## Core Modules
//!
//! - `bus`: publisher and subscriber instances; work queue, session
//!   lifecycle, message envelopes, attachments, reboot coordination.
//! - `naming`: derivation of every store key and channel name.
//! - `store`: the store primitives the bus relies on, a Redis backend for
//!   buses spanning processes, and an in-process backend.
//! - `config`: loading settings from files and the environment.
//! - `utils`: error types and logging setup.

pub mod bus;
pub mod config;
pub mod naming;
pub mod store;
pub mod utils;

pub use bus::{Bus, BusEvent, Publisher, Subscriber, Subscription};
pub use config::{BusSettings, Settings, StoreSettings};
pub use utils::{BusError, StoreError};
