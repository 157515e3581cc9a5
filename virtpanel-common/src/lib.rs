//! # virtpanel Common
//!
//! Shared utilities for the virtpanel components.
//!
//! ```rust,ignore
//! use virtpanel_common::{init_logging, LogFormat};
//!
//! init_logging("info").unwrap();
//! ```

pub mod logging;

pub use logging::{init_logging, init_logging_json, init_logging_with, LogFormat};
