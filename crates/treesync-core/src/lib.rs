//! treesync Core - Domain types, ports and configuration
//!
//! This crate contains the hexagonal architecture core with:
//! - **Domain types** - `SnapshotEntry`, `Version`, `Mutation`, `TrackingState`
//! - **Port definitions** - Traits for adapters: `TreeWalker`, `SnapshotStore`,
//!   `DiffReader`, `SyncSource`, `SyncDestination`, `RemoteLister`, `RemoteFileIo`
//! - **Configuration** - YAML-backed `Config` with validation and a builder
//! - **Logging** - `tracing-subscriber` bootstrap driven by the configuration
//!
//! # Architecture
//!
//! The domain module contains plain data and invariants with no I/O.
//! Ports define trait interfaces that the `treesync-cache` and
//! `treesync-sync` crates implement or consume.

pub mod config;
pub mod domain;
pub mod logging;
pub mod ports;
