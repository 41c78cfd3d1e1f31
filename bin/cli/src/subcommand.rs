mod completions;
mod server;

use std::{future::Future, time::Duration};

use error_stack::{ensure, Result};
use tokio::time::sleep;

pub use self::{
    completions::{completions, CompletionsArgs},
    server::{server, ServerArgs},
};
use crate::error::{GatewayError, HealthcheckError};

/// Subcommand for the program.
#[derive(Debug, clap::Subcommand)]
pub enum Subcommand {
    /// Run the gateway webserver.
    Server(ServerArgs),
    /// Generate a completion script for the given shell and outputs it to
    /// stdout.
    Completions(CompletionsArgs),
}

fn block_on(future: impl Future<Output = Result<(), GatewayError>>) -> Result<(), GatewayError> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to create runtime")
        .block_on(future)
}

impl Subcommand {
    pub(crate) fn execute(self) -> Result<(), GatewayError> {
        match self {
            Self::Server(args) => block_on(server(args)),
            Self::Completions(ref args) => {
                completions(args);
                Ok(())
            }
        }
    }
}

/// Polls `func` until it reports healthy, fails immediately without `wait`,
/// and gives up after `wait_timeout`.
pub async fn wait_healthcheck<F, Ret>(
    func: F,
    wait: bool,
    wait_timeout: Option<Duration>,
) -> Result<(), HealthcheckError>
where
    F: Fn() -> Ret + Send,
    Ret: Future<Output = Result<(), HealthcheckError>> + Send,
{
    let expected_end_time = wait_timeout.map(|timeout| std::time::Instant::now() + timeout);

    loop {
        if func().await.is_ok() {
            return Ok(());
        }
        ensure!(wait, HealthcheckError::NotHealthy);
        if let Some(end_time) = expected_end_time {
            if std::time::Instant::now() > end_time {
                return Err(HealthcheckError::Timeout.into());
            }
        }
        sleep(Duration::from_secs(1)).await;
    }
}
