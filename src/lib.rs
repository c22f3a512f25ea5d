pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod folder;
pub mod post;
pub mod selection;
pub mod transfer;
pub mod util;

pub use error::AttemptError;
pub use error::SessionError;
