//! **DGR** (Data Group Replication): keeps a cluster of render processes in
//! lockstep.
//!
//! One master process sends a snapshot of named variables every frame; slave
//! processes apply it before drawing, so every wall, projector or eye renders
//! the same camera pose, animation state and random seeds.
//!
//! # Structure
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`config`] | `DgrConfig`, `Role`, `DGR_*` environment variables |
//! | [`context`] | `Dgr`, the per-process replication context |
//! | [`registry`] | named fixed-size variable table |
//! | [`wire`] | datagram layout, `Frame`, shutdown marker |
//! | [`transport`] | `Transport` trait, UDP and in-memory links |
//! | [`logging`] | `env_logger` setup for binaries |
//!
//! Replication is best-effort UDP: no acknowledgements, no retries. A slave
//! that misses a frame keeps drawing the previous one.

pub mod config;
pub mod context;
pub mod error;
pub mod logging;
pub mod registry;
pub mod transport;
pub mod wire;

pub use config::{DgrConfig, Role};
pub use context::{Dgr, Stats};
pub use error::{DgrError, Result};
pub use wire::{Frame, ProtocolError};
