//! keywarp: a context-aware key remapper.
//!
//! The engine lives in [`stage`]; everything else is host plumbing
//! around it: focus tracking, output dispatch, action execution and the
//! simulation front end.

pub mod exec;
pub mod focus;
pub mod host;
pub mod lib_main;
pub mod output;
pub mod sim;
pub mod stage;

pub use host::Host;
pub use stage::{MatchKeySequence, MatchResult, Stage};
