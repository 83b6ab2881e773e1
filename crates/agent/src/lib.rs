//! Process-level pieces of the agent, shared by the binary and its tests

pub mod api;
pub mod config;
