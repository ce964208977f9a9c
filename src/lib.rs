#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]

//! # deploy-agent
//!
//! Unattended deployment agent. It dials an orchestrator over plain TCP,
//! announces who and where it is, then executes provisioning commands one at a
//! time: wipe the working directory, recreate folders and files, start and
//! stop the deployed application. Connection loss of any kind, including a
//! command that fails, leads to a reconnect with exponential backoff.
//!
//! ## Architecture
//!
//! ```text
//! main.rs          — entry point, logging, signal handling
//! cli.rs           — clap flags, single-dash compatibility
//! config.rs        — TOML + env-var + flag configuration
//! connector.rs     — dial loop, backoff, error-log dedup
//! session.rs       — Client (long-lived state), read/dispatch loop, handlers
//! protocol.rs      — line format, Command enum, state labels
//! workspace.rs     — working directory, path confinement
//! process/
//!   mod.rs         — ProcessControl seam, ProcessManager (zero-or-one child)
//!   platform.rs    — executable layout, forced kill by name
//! ```

pub mod cli;
pub mod config;
pub mod connector;
pub mod process;
pub mod protocol;
pub mod session;
pub mod workspace;

pub use config::Config;
pub use connector::Connector;
pub use process::platform::SystemProcessControl;
pub use session::Client;
