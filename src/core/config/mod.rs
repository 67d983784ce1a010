pub mod data;
pub mod io;

pub use data::{Config, ResolvedConfig, TimeoutConfig};
pub use io::ConfigError;
