//! Foundation module - Core utilities and types
//!
//! This module provides fundamental utilities used throughout the engine:
//! - Math types and 2D transforms
//! - Logging utilities

pub mod math;
pub mod logging;
