//! Job execution engine for the Foundry self-hosted agent.
//!
//! This crate provides the machinery for running one CI job on a worker
//! host:
//! - A stateful `bash --login` session behind a PTY ([`shell`])
//! - Marker-based command framing and exit-code recovery ([`process`])
//! - A UTF-8-safe, latency-bounded output buffer ([`output_buffer`])
//! - Structured job-event logging with file and HTTP push backends
//!   ([`eventlogger`])
//! - Shell and docker-compose executors behind a common trait
//!   ([`executors`])
//! - The job runner tying it all together ([`job`])
//!
//! The daemon side (control-plane sync loop, registration, configuration)
//! lives in the `foundry-agent` binary crate.

pub mod api;
pub mod environment;
pub mod eventlogger;
pub mod executors;
pub mod job;
pub mod output_buffer;
pub mod process;
pub mod retry;
pub mod shell;
