//! Graph Collab Server
//!
//! Room authorization, connection multiplexing and CRDT-to-relational
//! projection for collaborative graph documents:
//! - Auth gateway in front of every room, admin control plane beside it
//! - Three channels per document (sync, sharing, permissions)
//! - Automerge documents persisted to sled and projected into relational rows
//! - Reversible history recorded after every projection

pub mod admin;
pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod history;
pub mod projection;
pub mod room;
pub mod server;
pub mod storage;
pub mod sync;

pub use config::ServerConfig;
pub use error::{ServiceError, ServiceResult};
pub use server::{router, AppState};
