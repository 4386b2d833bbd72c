//! Request/response relay between external agents and Owlbear Rodeo tabs.
//!
//! A tab registers a channel with the relay over SSE or WebSocket. Callers
//! invoke actions on a channel by id; the relay correlates each reply with
//! its request, enforces a per-call timeout, and fails pending calls the
//! moment their channel goes away.

pub mod bus;
pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod executor;
pub mod gateway;
pub mod observability;
pub mod protocol;
pub mod relay;
pub mod tab;
