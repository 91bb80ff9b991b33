pub mod commands;
pub mod config;
pub mod distribution;
pub mod engine;
pub mod error;
pub mod governance;
pub mod membership;
pub mod model;
pub mod purchase;
pub mod registry;
pub mod returns;
pub mod shares;
pub mod store;

pub use engine::ClusterEngine;
pub use error::{ClusterError, ErrorKind, Result};
