pub mod config;
pub mod db;
pub mod error;
pub mod mapping;
pub mod models;
pub mod paths;
pub mod permissions;
pub mod remote;
pub mod store;
pub mod validate;

pub use crate::error::{Error, Result};
pub use crate::models::*;
