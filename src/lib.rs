pub mod config;
pub mod deploy;
pub mod errors;
pub mod logging;

pub use hostdeck_common as common;
