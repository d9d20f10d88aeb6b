//! CLI command implementations.
//!
//! | Module   | Commands handled |
//! |----------|------------------|
//! | `serve`  | `Serve`          |
//! | `deploy` | `Deploy`         |
//! | `config` | `Config`         |

pub mod config;
pub mod deploy;
pub mod serve;

pub use config::cmd_config;
pub use deploy::cmd_deploy;
pub use serve::cmd_serve;
