//! Built-in taglibs.

pub mod core;
