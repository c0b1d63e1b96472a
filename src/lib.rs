#![forbid(unsafe_code)]

// chat-latency library - synchronized round-trip latency measurement against a room-based chat service

pub mod aggregator;
pub mod barrier;
pub mod config;
pub mod orchestrator;
pub mod protocol;
pub mod report;
pub mod session;
pub mod token;
pub mod transport;

#[cfg(test)]
mod testing;
