use std::future::Future;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use relay_core::{RecoveringSource, RelayCore, SessionConfig};
use relay_mcp::{
    HttpUpstream, HttpUpstreamOptions, JsonRpcNotification, LineSink, LineSource, PipeUpstream,
    SseUpstreamOptions,
};
use tokio::io::BufReader;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{info, warn};
use url::Url;

/// Attempts at starting a session (connect or spawn, then handshake).
const START_ATTEMPTS: u32 = 3;

/// Variables a spawned command inherits when the environment is not passed
/// through wholesale.
const INHERITED_ENV: [&str; 6] = ["HOME", "LOGNAME", "PATH", "SHELL", "TERM", "USER"];

const CHILD_EXIT_GRACE: Duration = Duration::from_secs(5);

pub fn is_url(target: &str) -> bool {
    target.starts_with("http://") || target.starts_with("https://")
}

/// Wire protocol spoken to an HTTP upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum HttpTransport {
    /// SSE when the URL path ends in `/sse`, streamable HTTP otherwise.
    Auto,
    StreamableHttp,
    /// GET event stream plus POSTs to the endpoint it announces.
    Sse,
}

impl HttpTransport {
    pub fn resolve(self, url: &Url) -> Self {
        match self {
            Self::Auto if url.path().trim_end_matches('/').ends_with("/sse") => Self::Sse,
            Self::Auto => Self::StreamableHttp,
            chosen => chosen,
        }
    }
}

fn start_backoff(failed_attempt: u32) -> Duration {
    Duration::from_secs(1u64 << failed_attempt.saturating_sub(1).min(6))
}

/// Runs `start` until it succeeds, up to [`START_ATTEMPTS`] times, waiting
/// 1s, 2s, ... between attempts. Each attempt builds a fresh session.
pub async fn start_with_retry<T, F, Fut>(mut start: F) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let mut attempt = 1;
    loop {
        match start().await {
            Ok(v) => return Ok(v),
            Err(e) if attempt < START_ATTEMPTS => {
                let delay = start_backoff(attempt);
                warn!(
                    attempt,
                    max_attempts = START_ATTEMPTS,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %format!("{e:#}"),
                    "session start failed; retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                return Err(e.context(format!("start upstream session ({attempt} attempts)")));
            }
        }
    }
}

pub async fn connect_url(
    url: &Url,
    transport: HttpTransport,
    headers: Vec<(String, String)>,
    cfg: &SessionConfig,
    notifications: mpsc::Sender<JsonRpcNotification>,
) -> anyhow::Result<Arc<RelayCore>> {
    match transport.resolve(url) {
        HttpTransport::Sse => connect_sse(url, headers, cfg, notifications).await,
        HttpTransport::Auto | HttpTransport::StreamableHttp => {
            connect_http(url, headers, cfg, notifications).await
        }
    }
}

async fn connect_sse(
    url: &Url,
    headers: Vec<(String, String)>,
    cfg: &SessionConfig,
    notifications: mpsc::Sender<JsonRpcNotification>,
) -> anyhow::Result<Arc<RelayCore>> {
    let mut opts = SseUpstreamOptions::new(url.clone());
    opts.headers = headers;
    opts.post_timeout = cfg.request_timeout;

    let (source, sink) = relay_mcp::connect_sse(opts).await?;
    let upstream = PipeUpstream::spawn(RecoveringSource::new(source), sink, Some(notifications));
    let core = Arc::new(RelayCore::new(Arc::new(upstream), cfg.clone()));
    core.handshake().await.context("handshake with sse upstream")?;
    Ok(core)
}

async fn connect_http(
    url: &Url,
    headers: Vec<(String, String)>,
    cfg: &SessionConfig,
    notifications: mpsc::Sender<JsonRpcNotification>,
) -> anyhow::Result<Arc<RelayCore>> {
    let mut opts = HttpUpstreamOptions::new(url.clone());
    opts.headers = headers;
    opts.timeout = cfg.request_timeout;

    let upstream = HttpUpstream::new(opts, Some(notifications))?;
    let core = Arc::new(RelayCore::new(Arc::new(upstream), cfg.clone()));
    core.handshake().await.context("handshake with http upstream")?;
    Ok(core)
}

#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub pass_environment: bool,
}

/// A relay session over a spawned command's stdin/stdout.
pub struct ChildSession {
    pub core: Arc<RelayCore>,
    child: Child,
}

impl ChildSession {
    /// Shuts the relay down, which closes the child's stdin, then waits
    /// briefly for the child to exit before killing it.
    pub async fn shutdown(mut self) {
        self.core.shutdown().await;
        match tokio::time::timeout(CHILD_EXIT_GRACE, self.child.wait()).await {
            Ok(Ok(status)) => info!(%status, "upstream command exited"),
            Ok(Err(e)) => warn!(error = %e, "wait for upstream command"),
            Err(_) => {
                warn!("upstream command did not exit; killing it");
                if let Err(e) = self.child.kill().await {
                    warn!(error = %e, "kill upstream command");
                }
            }
        }
    }
}

pub async fn spawn_command(
    spec: &CommandSpec,
    cfg: &SessionConfig,
    notifications: mpsc::Sender<JsonRpcNotification>,
) -> anyhow::Result<ChildSession> {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);
    if !spec.pass_environment {
        cmd.env_clear();
        for key in INHERITED_ENV {
            if let Ok(v) = std::env::var(key) {
                cmd.env(key, v);
            }
        }
    }
    cmd.envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));

    let mut child = cmd
        .spawn()
        .with_context(|| format!("spawn upstream command {}", spec.program))?;
    let stdin = child.stdin.take().context("upstream command stdin")?;
    let stdout = child.stdout.take().context("upstream command stdout")?;
    info!(pid = child.id(), command = %spec.program, "upstream command started");

    let upstream = PipeUpstream::spawn(
        RecoveringSource::new(LineSource::new(BufReader::new(stdout))),
        LineSink::new(stdin),
        Some(notifications),
    );
    let core = Arc::new(RelayCore::new(Arc::new(upstream), cfg.clone()));
    core.handshake()
        .await
        .context("handshake with spawned upstream")?;
    Ok(ChildSession { core, child })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[test]
    fn urls_select_the_http_upstream() {
        assert!(is_url("http://127.0.0.1:8080/mcp"));
        assert!(is_url("https://example.test/sse"));
        assert!(!is_url("npx"));
        assert!(!is_url("./http-server"));
    }

    #[test]
    fn auto_transport_follows_the_url_path() {
        let sse: Url = "http://127.0.0.1:8080/sse".parse().unwrap();
        let sse_slash: Url = "http://127.0.0.1:8080/v1/sse/".parse().unwrap();
        let mcp: Url = "http://127.0.0.1:8080/mcp".parse().unwrap();

        assert_eq!(HttpTransport::Auto.resolve(&sse), HttpTransport::Sse);
        assert_eq!(HttpTransport::Auto.resolve(&sse_slash), HttpTransport::Sse);
        assert_eq!(HttpTransport::Auto.resolve(&mcp), HttpTransport::StreamableHttp);
        assert_eq!(
            HttpTransport::StreamableHttp.resolve(&sse),
            HttpTransport::StreamableHttp
        );
        assert_eq!(HttpTransport::Sse.resolve(&mcp), HttpTransport::Sse);
    }

    #[test]
    fn start_backoff_doubles() {
        assert_eq!(start_backoff(1), Duration::from_secs(1));
        assert_eq!(start_backoff(2), Duration::from_secs(2));
        assert_eq!(start_backoff(3), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn start_is_retried_with_backoff() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let started = tokio::time::Instant::now();
        let value = start_with_retry(move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                anyhow::bail!("not yet");
            }
            Ok(42)
        })
        .await
        .unwrap();

        assert_eq!(value, 42);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn start_gives_up_after_the_last_attempt() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let err = start_with_retry(move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(anyhow::anyhow!("upstream refused"))
        })
        .await
        .unwrap_err();

        assert_eq!(counter.load(Ordering::SeqCst), START_ATTEMPTS);
        assert!(format!("{err:#}").contains("upstream refused"));
    }

    #[tokio::test]
    async fn missing_command_fails_to_spawn() {
        let spec = CommandSpec {
            program: "definitely-not-an-mcp-server-binary".to_string(),
            args: Vec::new(),
            env: Vec::new(),
            pass_environment: false,
        };
        let (tx, _rx) = mpsc::channel(1);
        let err = spawn_command(&spec, &SessionConfig::default(), tx)
            .await
            .err()
            .expect("spawn should fail");
        assert!(format!("{err:#}").contains("spawn upstream command"));
    }
}
