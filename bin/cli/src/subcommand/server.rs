use std::{fmt, sync::Arc, time::Duration};

use aggregator::{
    logging::{init_logger, LoggingArgs},
    service::{AggregatorConfig, AggregatorService},
    signaling::{SignalingConfig, SignalingSessions},
};
use aggregator_api::rest::{rest_api_router, RestRouterDependencies};
use clap::Parser;
use error_stack::{Report, Result, ResultExt};
use reqwest::Client;
use tokio::{net::TcpListener, time::timeout};

use crate::{
    error::{GatewayError, HealthcheckError},
    subcommand::wait_healthcheck,
};

#[derive(Clone, Debug, Parser)]
pub struct ApiAddress {
    /// The host the gateway is listening at.
    #[clap(long, default_value = "0.0.0.0")]
    pub api_host: String,

    /// The port the gateway is listening at.
    #[clap(long, default_value_t = 8080, env = "SERVER_PORT")]
    pub api_port: u16,
}

impl fmt::Display for ApiAddress {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "{}:{}", self.api_host, self.api_port)
    }
}

#[derive(Debug, Parser)]
pub struct ServerArgs {
    #[clap(flatten)]
    pub log_config: LoggingArgs,

    /// The address the gateway is listening at.
    #[clap(flatten)]
    pub api_address: ApiAddress,

    /// Upper bound in milliseconds on the callback-waiting deadline;
    /// client-requested timeouts above it are clamped.
    #[clap(long, default_value_t = 27_000, env = "AGGREGATOR_TIMEOUT_MAX_MS")]
    pub timeout_max_ms: u64,

    /// The callback URL handed to the backends. Defaults to the gateway's
    /// own listen address.
    #[clap(long, env = "AGGREGATOR_CALLBACK_URL")]
    pub callback_url: Option<String>,

    /// Comma-separated list of backend resource endpoints.
    #[clap(long, env = "RESOURCE_URLS", value_delimiter = ',')]
    pub resource_urls: Vec<String>,

    /// Lifetime of a signaling session in seconds.
    #[clap(long, default_value_t = 300)]
    pub signaling_ttl_seconds: u64,

    /// Runs the healthcheck for the gateway server.
    #[clap(long, default_value_t = false)]
    pub healthcheck: bool,

    /// Waits for the gateway to become healthy instead of failing at once.
    #[clap(long, default_value_t = false, requires = "healthcheck")]
    pub wait: bool,

    /// Timeout in seconds for `--wait`.
    #[clap(long, requires = "wait")]
    pub timeout: Option<u64>,
}

pub async fn server(args: ServerArgs) -> Result<(), GatewayError> {
    if args.healthcheck {
        return wait_healthcheck(
            || healthcheck(args.api_address.clone()),
            args.wait,
            args.timeout.map(Duration::from_secs),
        )
        .await
        .change_context(GatewayError);
    }

    let _log_guard =
        init_logger(&args.log_config).expect("should be able to initialize the logger");

    if args.resource_urls.is_empty() {
        return Err(Report::new(GatewayError)
            .attach_printable("`RESOURCE_URLS` must list at least one backend resource"));
    }

    let callback_url = args.callback_url.unwrap_or_else(|| {
        format!(
            "http://{}/aggregate/callback",
            ApiAddress {
                api_host: "127.0.0.1".to_owned(),
                api_port: args.api_address.api_port,
            }
        )
    });

    let aggregator = AggregatorService::new(AggregatorConfig {
        callback_url,
        backend_urls: args.resource_urls,
        max_deadline: Duration::from_millis(args.timeout_max_ms),
    });
    let signaling = Arc::new(SignalingSessions::new(SignalingConfig {
        ttl: Duration::from_secs(args.signaling_ttl_seconds),
        ..SignalingConfig::default()
    }));

    let router = rest_api_router(RestRouterDependencies {
        aggregator: aggregator.clone(),
        signaling: Arc::clone(&signaling),
    });

    tracing::info!("Listening on {}", args.api_address);
    let listener = TcpListener::bind((args.api_address.api_host.as_str(), args.api_address.api_port))
        .await
        .change_context(GatewayError)?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(error) = tokio::signal::ctrl_c().await {
                tracing::error!(%error, "could not install the shutdown signal handler");
            }
        })
        .await
        .change_context(GatewayError)?;

    // Flush in-flight work: pending deadlines are cancelled and live streams
    // close without a summary.
    aggregator.shutdown();
    signaling.shutdown();
    tracing::info!("gateway shut down");

    Ok(())
}

pub async fn healthcheck(address: ApiAddress) -> Result<(), HealthcheckError> {
    let request_url = format!("http://{address}/api-doc/openapi.json");

    timeout(
        Duration::from_secs(10),
        Client::new().head(&request_url).send(),
    )
    .await
    .change_context(HealthcheckError::Timeout)?
    .change_context(HealthcheckError::NotHealthy)?;

    Ok(())
}
