//! `tracing` setup shared by every binary of the gateway.

mod args;
mod init;

pub use self::{
    args::{LogFormat, LogLevel, LoggingArgs},
    init::init_logger,
};
