pub mod api_connection;
pub mod cli;
pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod nutrition_lookup;
pub mod search;

pub use error::{Result, SearchError};
