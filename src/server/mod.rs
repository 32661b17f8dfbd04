//! Listener and process-wide runtime pieces.

pub mod access_log;
pub mod listener;
pub mod spawn;
