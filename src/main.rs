use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::LinesStream;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use admission::config::AdmissionConfig;
use admission::middleware::{AdmissionOutcome, AdmissionService, StatusResponse};
use admission::ratelimit::{RequestDescriptor, RuntimeClock};

/// Reads request descriptors as JSON lines on stdin and writes one
/// admission decision per line on stdout.
#[derive(Parser, Debug)]
#[command(name = "admission", version, about)]
struct Args {
    /// YAML configuration file; rate limiting is disabled without one
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// One line of output.
#[derive(Debug, Serialize)]
struct Decision {
    route: String,
    admitted: bool,
    status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    limiter: Option<String>,
    body: StatusResponse,
}

impl Decision {
    fn from_outcome(route: String, outcome: &AdmissionOutcome) -> Self {
        match outcome {
            AdmissionOutcome::Admitted(_) => Self {
                route,
                admitted: true,
                status: 200,
                retry_after: None,
                limiter: None,
                body: StatusResponse::new(200, "Request admitted"),
            },
            AdmissionOutcome::Rejected(response) => Self {
                route,
                admitted: false,
                status: response.status,
                retry_after: response.retry_after,
                limiter: response.limiter.clone(),
                body: response.body.clone(),
            },
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    info!("Starting admission control");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = AdmissionConfig::load_or_disabled(args.config.as_deref());
    let service = Arc::new(AdmissionService::from_config(&config, RuntimeClock::shared()));

    let sweeper = (config.sweep_interval_seconds > 0).then(|| {
        spawn_sweeper(
            Arc::clone(&service),
            Duration::from_secs(config.sweep_interval_seconds),
        )
    });

    let driven = run_driver(
        &service,
        BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
        shutdown_signal(),
    )
    .await;

    if let Some(sweeper) = sweeper {
        sweeper.abort();
    }

    info!("Admission control stopped");
    driven
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.with_target(false).with_thread_ids(true).init(),
    }
}

/// Answer each input line in order until the input closes or `shutdown`
/// completes.
///
/// A line is fully decided and written before the next one is read.
async fn run_driver<R, W, S>(
    service: &AdmissionService,
    input: R,
    mut output: W,
    shutdown: S,
) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
    S: Future<Output = ()>,
{
    let mut lines = LinesStream::new(input.lines());
    tokio::pin!(shutdown);

    loop {
        let line = tokio::select! {
            biased;
            _ = &mut shutdown => return Ok(()),
            line = lines.next() => match line {
                Some(Ok(line)) => line,
                Some(Err(err)) => return Err(err.into()),
                None => {
                    info!("Input closed");
                    return Ok(());
                }
            },
        };
        if line.trim().is_empty() {
            continue;
        }

        let rendered = tokio::select! {
            biased;
            _ = &mut shutdown => return Ok(()),
            rendered = decide(service, &line) => rendered,
        };
        output.write_all(rendered.as_bytes()).await?;
        output.write_all(b"\n").await?;
        output.flush().await?;
    }
}

/// Evaluate one input line and render the decision.
async fn decide(service: &AdmissionService, line: &str) -> String {
    let rendered = match serde_json::from_str::<RequestDescriptor>(line) {
        Ok(request) => {
            let outcome = service.check(&request).await;
            serde_json::to_string(&Decision::from_outcome(request.route.clone(), &outcome))
        }
        Err(err) => {
            warn!(error = %err, "Ignoring malformed request descriptor");
            serde_json::to_string(&StatusResponse::new(400, err.to_string()))
        }
    };
    rendered.unwrap_or_else(|err| format!(r#"{{"status":500,"message":"{}"}}"#, err))
}

/// Periodically drop expired limiter state.
fn spawn_sweeper(service: Arc<AdmissionService>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.tick().await;
        loop {
            interval.tick().await;
            let purged = service.purge_expired();
            debug!(purged, "Swept expired limiter state");
        }
    })
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(error = %err, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use admission::config::ChainStageConfig;
    use admission::ratelimit::{LimiterConfig, ManualClock};
    use serde_json::Value;

    fn service(permit_limit: u64) -> AdmissionService {
        let mut config = AdmissionConfig::default();
        config.chain.push(ChainStageConfig {
            name: "global".to_string(),
            limiter: LimiterConfig::fixed_window(permit_limit, 60.0),
        });
        AdmissionService::from_config(&config, Arc::new(ManualClock::default()))
    }

    async fn drive(service: &AdmissionService, input: &str) -> Vec<Value> {
        let mut output = Vec::new();
        run_driver(
            service,
            input.as_bytes(),
            &mut output,
            std::future::pending::<()>(),
        )
        .await
        .unwrap();
        String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_decisions_follow_input_order() {
        let service = service(2);
        let input = [
            r#"{"route": "/api/a", "remote_addr": "10.0.0.1"}"#,
            r#"{"route": "/api/b", "remote_addr": "10.0.0.1"}"#,
            "",
            r#"{"route": "/api/c", "remote_addr": "10.0.0.1"}"#,
            r#"{"route": "/api/d", "remote_addr": "10.0.0.1"}"#,
        ]
        .join("\n");

        let decisions = drive(&service, &input).await;
        let routes: Vec<_> = decisions.iter().map(|d| d["route"].as_str().unwrap()).collect();
        assert_eq!(routes, ["/api/a", "/api/b", "/api/c", "/api/d"]);
        let admitted: Vec<_> = decisions.iter().map(|d| d["admitted"].as_bool().unwrap()).collect();
        assert_eq!(admitted, [true, true, false, false]);
        assert_eq!(decisions[2]["status"], 429);
        assert_eq!(decisions[2]["limiter"], "global");
    }

    #[tokio::test]
    async fn test_malformed_line_does_not_stop_the_driver() {
        let service = service(10);
        let input = "not json\n{\"route\": \"/api/a\"}\n";

        let decisions = drive(&service, input).await;
        assert_eq!(decisions.len(), 2);
        assert_eq!(decisions[0]["status"], 400);
        assert_eq!(decisions[1]["admitted"], true);
    }

    #[tokio::test]
    async fn test_shutdown_stops_reading() {
        let service = service(10);
        let mut output = Vec::new();
        let input = r#"{"route": "/api/a"}"#;

        run_driver(&service, input.as_bytes(), &mut output, async {})
            .await
            .unwrap();
        assert!(output.is_empty());
    }
}
