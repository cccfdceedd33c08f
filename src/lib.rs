pub mod types;
pub mod error;
pub mod events;
pub mod data;
pub mod broker;
pub mod connection;
pub mod requests;
pub mod config;
pub mod utils;
pub mod client;

pub use types::*;
pub use error::{Result, TwsError};
pub use client::{ConnectionGuard, TwsClient};
