//! Replication between the Local Store and the cloud.

mod coordinator;
mod resolver;

pub use coordinator::*;
pub use resolver::*;
