//! Meteor Execution Engine Library
//!
//! Order execution core for automated trading bots: order book
//! reconciliation, entry pricing, the position ledger, exchange gateways and
//! the worker pool that executes queued order signals.

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod persistence;
