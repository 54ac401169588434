//! Shared utilities for vtytousb
//!
//! Error type, logging setup, run-mode selection and filesystem paths used
//! by the gateway server.

pub mod error;
pub mod logging;
pub mod mode;
pub mod paths;

pub use error::{GatewayError, Result};
pub use logging::{init_logging, init_logging_with_config, LogConfig, LogOutput};
pub use mode::RunMode;
pub use paths::{
    app_config_file, bridge_config_file, data_dir, device_dir, ensure_all_dirs, log_dir,
    serials_dir, ssh_key_file,
};
