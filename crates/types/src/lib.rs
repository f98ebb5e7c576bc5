//! Tradenet shared types
//!
//! Peer addressing, transport identifiers and the capability/load records
//! exchanged while two nodes perform their connection handshake.

pub mod address;
pub mod capability;
pub mod time_service;

pub use address::*;
pub use capability::*;
pub use time_service::*;
