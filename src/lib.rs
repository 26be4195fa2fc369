pub mod config;
pub mod dispatcher;
pub mod error;
pub mod git;
pub mod hooks;
pub mod ledger;
pub mod manager;
pub mod manifest;
pub mod model;
pub mod planner;
pub mod registry;
pub mod runtime;

pub use error::{Error, Result};
