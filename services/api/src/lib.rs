//! Course Generation API Library Crate
//!
//! Configuration, the Postgres course store, HTTP adapters for video search
//! and speech synthesis, REST handlers, the progress WebSocket and routing.
//! The `api` binary is a thin wrapper around this library.

pub mod config;
pub mod db;
pub mod external;
pub mod handlers;
pub mod models;
pub mod router;
pub mod state;
pub mod ws;
