pub mod error;
pub mod resolver;
pub mod types;

pub use error::{ConfigError, ConfigResult};
pub use resolver::{ConfigResolver, ResolvedConfig, Settings};
