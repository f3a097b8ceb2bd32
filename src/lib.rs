pub mod config;
pub mod driver;
pub mod error;
pub mod fetcher;
pub mod node;
pub mod task;

pub use config::{ClientConfig, ExecContext};
pub use driver::{Driver, DriverHandle, DriverRegistry};
pub use error::{DriverError, Result};
