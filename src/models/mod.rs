//! Domain models.

pub mod active_session;
pub mod conversation;
pub mod identity;
pub mod message;
pub mod observation;
pub mod session;
