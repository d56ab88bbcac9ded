//! Backend Interfaces join procedure: messages, checks and the handler

pub mod answer;
pub mod context;
pub mod freshness;
pub mod handler;
pub mod messages;

pub use answer::Peer;
pub use context::RequestContext;
pub use handler::{JoinOutcome, JoinServer, JoinState};
