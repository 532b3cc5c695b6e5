//! Core module - Contains the fundamental data structures and utilities
//!
//! This module provides:
//! - Table model and schema (model)
//! - CSV decoding with schema application and type inference (table)
//! - SQL template rendering
//! - Configuration loading
//! - Cache artifact paths and key validation
//! - Rendering functions for different output formats
//! - Common utilities

pub mod config;
pub mod model;
pub mod paths;
pub mod render;
pub mod table;
pub mod template;
pub mod util;
