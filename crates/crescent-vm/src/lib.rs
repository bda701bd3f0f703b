//! Crescent VM: the interpreter state, embedding API, and dispatch loop.

pub mod arith;
pub mod callinfo;
pub mod coerce;
pub mod compare;
pub mod dispatch;
pub mod error;
pub mod state;

pub use callinfo::MULTRET;
pub use error::LuaError;
pub use state::{CFunction, State};
