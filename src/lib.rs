#![deny(clippy::disallowed_methods)]

pub mod cli;
pub mod config;
pub mod fs;
pub mod helper;
pub mod rundir;
pub mod service;
pub mod types;

use shadow_rs::shadow;

shadow!(build);
