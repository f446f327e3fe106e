//! MQTT Sampler Library
//!
//! Load-testing building blocks for MQTT: client handles that buffer
//! received messages for a polling sample loop, a registry that tears down
//! every client of a run, and the publisher/subscriber samplers and runner
//! built on top of them.

pub mod buffer;
pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod logging;
pub mod message;
pub mod registry;
pub mod runner;
pub mod sampler;
pub mod util;
