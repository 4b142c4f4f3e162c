use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context as _;
use clap::{ArgAction, Parser};
use relay_core::{SessionConfig, serve};
use relay_mcp::{LineSink, LineSource};
use tokio::io::BufReader;
use tokio::sync::mpsc;
use tracing::{info, warn};
use url::Url;

mod http;
mod upstream;

use upstream::{CommandSpec, HttpTransport, start_with_retry};

#[derive(Debug, Parser)]
#[command(
    name = "mcp-relay",
    version,
    about = "Capability-aware MCP relay between stdio and HTTP",
    after_help = "Examples:\n  \
        mcp-relay http://localhost:8080/mcp\n  \
        mcp-relay http://localhost:8080/sse\n  \
        mcp-relay -H Authorization 'Bearer TOKEN' http://localhost:8080/mcp\n  \
        mcp-relay --http-addr 127.0.0.1:8080 -e KEY VALUE -- your-command --arg1 value1\n  \
        mcp-relay --allow-origin '*' your-command"
)]
struct Args {
    /// Upstream to relay to. An `http(s)://` URL is reached over HTTP (see
    /// `--transport`) and served on stdio; anything else is spawned as a
    /// command and served over HTTP.
    #[arg(env = "MCP_RELAY_UPSTREAM")]
    command_or_url: String,

    /// Extra arguments for the spawned command.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,

    /// Environment variable for the spawned command. Repeatable.
    #[arg(
        short = 'e',
        long = "env",
        num_args = 2,
        value_names = ["KEY", "VALUE"],
        action = ArgAction::Append
    )]
    env: Vec<String>,

    /// Pass the whole current environment to the spawned command.
    #[arg(long, default_value_t = false)]
    pass_environment: bool,

    /// Header sent to an HTTP upstream. Repeatable.
    #[arg(
        short = 'H',
        long = "header",
        num_args = 2,
        value_names = ["KEY", "VALUE"],
        action = ArgAction::Append
    )]
    headers: Vec<String>,

    /// Protocol spoken to an HTTP upstream.
    #[arg(
        long,
        env = "MCP_RELAY_TRANSPORT",
        value_enum,
        default_value_t = HttpTransport::Auto
    )]
    transport: HttpTransport,

    /// Bearer token for an HTTP upstream.
    #[arg(long, env = "API_ACCESS_TOKEN", hide_env_values = true)]
    api_access_token: Option<String>,

    /// Listen address for the downstream HTTP server (command mode).
    #[arg(long, env = "MCP_RELAY_HTTP_ADDR", default_value = "127.0.0.1:0")]
    http_addr: SocketAddr,

    /// HTTP path for the downstream MCP endpoint.
    #[arg(long, env = "MCP_RELAY_HTTP_PATH", default_value = "/mcp")]
    http_path: String,

    /// Allowed CORS origin for the downstream HTTP server. Repeatable; `*`
    /// allows any. Default is no CORS.
    #[arg(long, action = ArgAction::Append)]
    allow_origin: Vec<String>,

    /// Default log filter; `RUST_LOG` overrides it.
    #[arg(
        long,
        env = "MCP_RELAY_LOG_LEVEL",
        default_value = "info",
        value_parser = ["trace", "debug", "info", "warn", "error"]
    )]
    log_level: String,

    /// Try every method regardless of what the upstream announced.
    #[arg(long, default_value_t = false)]
    disable_capability_check: bool,

    /// Retries after the first attempt of a failed upstream call.
    #[arg(long, env = "MCP_RELAY_MAX_RETRIES", default_value_t = 1)]
    max_retries: u32,

    /// Backoff unit in milliseconds; retry `k` waits `(k + 1)` units.
    #[arg(long, default_value_t = 500)]
    backoff_ms: u64,

    /// Per-attempt deadline for upstream calls in seconds; 0 disables it.
    #[arg(long, default_value_t = 60)]
    request_timeout_secs: u64,
}

impl Args {
    fn session_config(&self) -> SessionConfig {
        SessionConfig {
            max_retries: self.max_retries,
            bypass_capability_check: self.disable_capability_check,
            backoff_unit: Duration::from_millis(self.backoff_ms),
            request_timeout: (self.request_timeout_secs > 0)
                .then(|| Duration::from_secs(self.request_timeout_secs)),
            client_name: "mcp-relay".to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    fn upstream_headers(&self) -> Vec<(String, String)> {
        let mut headers = pairs(&self.headers);
        if let Some(token) = self.api_access_token.as_deref().filter(|t| !t.is_empty()) {
            headers.push(("authorization".to_string(), format!("Bearer {token}")));
        }
        headers
    }
}

/// `[k1, v1, k2, v2]` as `[(k1, v1), (k2, v2)]`.
fn pairs(flat: &[String]) -> Vec<(String, String)> {
    flat.chunks_exact(2)
        .map(|kv| (kv[0].clone(), kv[1].clone()))
        .collect()
}

fn init_tracing(default_filter: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter.into());

    // stdout may carry the protocol.
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .json()
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_level);

    if upstream::is_url(&args.command_or_url) {
        relay_http_to_stdio(args).await
    } else {
        relay_command_to_http(args).await
    }
}

async fn relay_http_to_stdio(args: Args) -> anyhow::Result<()> {
    let url = Url::parse(&args.command_or_url).context("parse upstream url")?;
    let cfg = args.session_config();
    let headers = args.upstream_headers();
    let transport = args.transport.resolve(&url);
    info!(url = %url, transport = ?transport, "relaying http upstream to stdio");

    let (note_tx, note_rx) = mpsc::channel(64);
    let core = start_with_retry(|| {
        upstream::connect_url(&url, transport, headers.clone(), &cfg, note_tx.clone())
    })
    .await?;
    drop(note_tx);

    let stdin = LineSource::new(BufReader::new(tokio::io::stdin()));
    let stdout = LineSink::new(tokio::io::stdout());
    let outcome = tokio::select! {
        r = serve(core.clone(), stdin, stdout, Some(note_rx)) => r.context("serve stdio"),
        _ = shutdown_signal() => {
            info!("interrupted; shutting down");
            Ok(())
        }
        _ = core.closed() => {
            warn!("upstream session closed");
            Ok(())
        }
    };

    core.shutdown().await;
    outcome
}

async fn relay_command_to_http(args: Args) -> anyhow::Result<()> {
    let cfg = args.session_config();
    let spec = CommandSpec {
        program: args.command_or_url.clone(),
        args: args.args.clone(),
        env: pairs(&args.env),
        pass_environment: args.pass_environment,
    };
    info!(command = %spec.program, "relaying spawned command to http");

    let (note_tx, note_rx) = mpsc::channel(64);
    let session =
        start_with_retry(|| upstream::spawn_command(&spec, &cfg, note_tx.clone())).await?;
    drop(note_tx);
    let core = session.core.clone();

    let stop = {
        let core = core.clone();
        async move {
            tokio::select! {
                _ = shutdown_signal() => info!("interrupted; shutting down"),
                _ = core.closed() => warn!("upstream session closed"),
            }
        }
    };
    let served = http::serve_http(
        args.http_addr,
        &args.http_path,
        args.allow_origin.clone(),
        core,
        note_rx,
        stop,
    )
    .await;

    session.shutdown().await;
    served
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "ctrl-c handler unavailable");
        std::future::pending::<()>().await;
    }
}
