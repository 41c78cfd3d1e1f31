#![forbid(unsafe_code)]

mod args;
mod error;
mod subcommand;

use error_stack::Result;

use self::{args::Args, error::GatewayError};

fn main() -> Result<(), GatewayError> {
    let Args { subcommand } = Args::parse_args();
    subcommand.execute()
}
