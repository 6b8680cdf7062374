//! Utility modules

pub mod system;
