//! Relay Agent: a personal automation daemon reachable over iMessage and Telegram.

pub mod agent;
pub mod channels;
pub mod config;
pub mod error;
pub mod files;
pub mod identity;
pub mod interpreter;
pub mod safety;
pub mod store;
pub mod tools;
