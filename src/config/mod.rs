pub mod loader;

pub use loader::{load_config, load_config_or_default, validate_config, write_default_config};
