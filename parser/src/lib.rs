//! A parser for the configuration language of keywarp, a context-aware
//! key remapper.

pub mod cfg;
pub mod keys;
pub mod sequence;
