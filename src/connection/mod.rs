pub mod manager;

pub use manager::ConnectionManager;
