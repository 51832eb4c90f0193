#![allow(unused_assignments)] // thiserror/miette proc macros trigger false positives

pub mod apply;
pub mod cli;
pub mod config;
pub mod constraints;
pub mod detect;
pub mod domain_state;
pub mod error;
pub mod intent;
pub mod lifecycle;
pub mod locked;
pub mod logging;
pub mod model;
pub mod params;
pub mod placeholder;
pub mod registry;
pub mod schema;
pub mod score;
pub mod session;
pub mod snapshot;
pub mod workers;
