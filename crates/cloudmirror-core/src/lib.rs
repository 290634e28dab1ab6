//! CloudMirror Core - Domain model and port definitions
//!
//! This crate contains the hexagonal architecture core with:
//! - **Domain entities** - `Entry`, `EntryGraph`, `SyncState` and validated newtypes
//! - **Port definitions** - Traits for adapters: `IRemoteStorageService`, `ISnapshotStore`
//! - **Configuration** - YAML configuration with validation
//!
//! # Architecture
//!
//! The domain module is pure: no I/O, no async. Ports define the trait
//! interfaces that the remote and sync crates drive and that adapters
//! implement.

pub mod config;
pub mod domain;
pub mod ports;
