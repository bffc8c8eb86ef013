//! Data models for the fleet sync engine.
//!
//! Syncable entities share the bookkeeping in [`sync`]; invite, session and
//! preference types describe the device and tenant state around them.

mod financial;
mod invite;
mod reference;
mod session;
mod sync;

pub use financial::*;
pub use invite::*;
pub use reference::*;
pub use session::*;
pub use sync::*;
