// Bearer Session - Library root

pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod http_client;
pub mod transport;

#[cfg(test)]
mod test_support;

pub use client::SessionClient;
pub use error::{AuthError, Result};
pub use http_client::{PendingRequest, RequestDispatcher};
