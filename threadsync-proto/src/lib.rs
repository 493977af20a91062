//! Shared data model for the `threadsync` conversation engine.

pub mod message;
pub mod page;
pub mod record;
