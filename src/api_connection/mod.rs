pub mod connection;
pub mod endpoints;

pub use connection::{ApiConnectionError, JsonClient};
pub use endpoints::Provider;
