// Core modules implementing counters, persistence, recipes, and the wire protocol.
pub mod error;
pub mod protocol;
pub mod recipe;
pub mod store;
