//! Backends module - External tool integrations
//!
//! Provides:
//! - process: shell command execution
//! - psql: psql command line construction
//! - doctor: Dependency checking

pub mod doctor;
pub mod process;
pub mod psql;
