//! Agent-mode uploading: buffers completed connections and matched
//! signatures, and periodically ships them to a manager over HTTPS
//! (spec.md §4.12).

#![warn(missing_docs)]

pub mod client;
pub mod ring;
pub mod tasks;

pub use client::{AgentClient, AgentClientError, AgentData, AgentRegistration, AgentResponse, AgentStats};
pub use ring::RingBuffer;
pub use tasks::{spawn_data_task, spawn_health_task, AgentState};
