//! LoRaWAN join server: answers roaming JoinReqs from network servers with
//! a Join-Accept and session keys wrapped for the requesting server.

pub mod config;
pub mod error;
pub mod interop;
pub mod lorawan;
pub mod registry;
pub mod server;
