//! Client-side reply threads for timed-debate rooms.
//!
//! [`thread`] holds the engine, [`api`] the remote collaborator it talks to,
//! and [`config`] the settings both are built from.

pub mod api;
pub mod config;
pub mod thread;
pub mod util;
