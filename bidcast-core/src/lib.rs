pub mod config;
pub mod error;
pub mod logging;
pub mod replay;
pub mod rooms;

pub use error::{Error, Result};
