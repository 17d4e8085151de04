//! Terminal front end for the console event streams.
//!
//! `logs` tails a deployment's pods, `chat` streams completions from a
//! deployed model, `watch` polls a cluster or deployment until it settles.

use std::future::Future;
use std::io::Write as _;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use console_stream::prelude::*;
use console_stream::{
    CancelToken, ControlSignal, EventKind, FetchError, ReconnectPolicy, SessionError, WatchError,
    init_observability,
};
use futures::StreamExt as _;
use tokio::io::{AsyncBufReadExt as _, BufReader};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Console(#[from] ConsoleError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Watch(#[from] WatchError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("status watch gave up after {failures} failed checks: {last_error}")]
    WatchFailed { failures: u32, last_error: FetchError },
    #[error("failed to encode status: {0}")]
    Json(#[from] serde_json::Error),
    #[error("stdin: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Parser, Debug)]
#[command(
    name = "console-stream",
    about = "Tail deployment logs, chat with a deployed model, watch provisioning",
    version
)]
struct Cli {
    #[command(flatten)]
    connection: ConnectionArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct ConnectionArgs {
    /// Console API base URL (overrides CONSOLE_API_URL; the WebSocket base is
    /// re-derived from it unless --ws-url is given).
    #[arg(long, global = true)]
    api_url: Option<String>,

    /// WebSocket base URL (overrides CONSOLE_WS_URL).
    #[arg(long, global = true)]
    ws_url: Option<String>,

    /// Reconnect policy: manual, fixed:<ms> or exp:<ms> (overrides CONSOLE_RECONNECT).
    #[arg(long, global = true, value_parser = parse_reconnect)]
    reconnect: Option<ReconnectPolicy>,
}

impl ConnectionArgs {
    fn apply(&self, config: ConsoleConfig) -> ConsoleConfig {
        let mut config = match &self.api_url {
            Some(api_url) => ConsoleConfig::new(api_url.as_str())
                .request_timeout(config.request_timeout)
                .log_retention(config.log_retention)
                .reconnect(config.reconnect),
            None => config,
        };
        if let Some(ws_url) = &self.ws_url {
            config = config.ws_url(ws_url.as_str());
        }
        if let Some(policy) = &self.reconnect {
            config = config.reconnect(policy.clone());
        }
        config
    }
}

fn parse_reconnect(value: &str) -> Result<ReconnectPolicy, String> {
    ReconnectPolicy::parse(value)
        .ok_or_else(|| format!("expected manual, fixed:<ms> or exp:<ms>, got `{value}`"))
}

fn parse_pod_type(value: &str) -> Result<PodType, String> {
    value.parse().map_err(|e: ConsoleError| e.to_string())
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Tail a deployment's pod logs.
    Logs(LogsArgs),
    /// Chat with a deployed model over a streaming completion endpoint.
    Chat(ChatArgs),
    /// Poll a cluster or deployment until it reaches a terminal state.
    Watch(WatchArgs),
}

#[derive(Args, Debug)]
struct LogsArgs {
    deployment: String,

    /// Only tail vllm or router pods.
    #[arg(long, value_parser = parse_pod_type)]
    pod_type: Option<PodType>,

    /// Log lines kept in memory (overrides CONSOLE_LOG_RETENTION).
    #[arg(long)]
    retention: Option<usize>,

    /// Skip records the server delivers more than once.
    #[arg(long)]
    dedupe: bool,
}

#[derive(Args, Debug)]
struct ChatArgs {
    #[arg(long)]
    model: String,

    /// Route through the backend's chat proxy for this deployment instead of
    /// the API's /v1/chat/completions.
    #[arg(long)]
    deployment: Option<String>,

    #[arg(long)]
    system: Option<String>,

    #[arg(long)]
    max_tokens: Option<u32>,

    #[arg(long)]
    temperature: Option<f32>,

    /// Send one prompt and exit instead of reading prompts from stdin.
    #[arg(long)]
    prompt: Option<String>,
}

#[derive(Args, Debug)]
struct WatchArgs {
    #[arg(value_enum)]
    resource: ResourceKind,

    id: String,

    /// Terminal state; repeat for several. Defaults depend on the resource.
    #[arg(long = "until")]
    until: Vec<String>,

    #[arg(long, default_value_t = 5)]
    interval_secs: u64,

    #[arg(long, default_value_t = 600)]
    timeout_secs: u64,

    #[arg(long, default_value_t = 3)]
    max_failures: u32,

    /// Print every observed status body as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum ResourceKind {
    Cluster,
    Deployment,
}

impl ResourceKind {
    fn endpoint(self) -> StatusEndpoint {
        match self {
            Self::Cluster => StatusEndpoint::ClusterProgress,
            Self::Deployment => StatusEndpoint::Deployment,
        }
    }

    fn default_terminal_states(self) -> &'static [&'static str] {
        match self {
            Self::Cluster => &["RUNNING", "ERROR", "DEGRADED"],
            Self::Deployment => &["deployed", "failed"],
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let _ = dotenvy::dotenv();
    init_observability();
    if let Err(err) = run(Cli::parse()).await {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let config = cli.connection.apply(ConsoleConfig::from_env()?);
    debug!(api = %config.api_url, ws = %config.ws_url, reconnect = ?config.reconnect, "configuration loaded");
    match cli.command {
        Command::Logs(args) => tail_logs(config, args).await,
        Command::Chat(args) => chat(&config, args).await,
        Command::Watch(args) => watch_status(&config, args).await,
    }
}

/// Runs `fut` unless Ctrl-C arrives first.
async fn interruptible<F: Future>(fut: F) -> Option<F::Output> {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => None,
        out = fut => Some(out),
    }
}

async fn wait_while(session: &StreamSession, pred: impl Fn(&SessionState) -> bool) {
    let mut rx = session.state_changes();
    let _ = rx.wait_for(|state| !pred(state)).await;
}

async fn tail_logs(config: ConsoleConfig, args: LogsArgs) -> Result<(), CliError> {
    let config = match args.retention {
        Some(retention) => config.log_retention(retention),
        None => config,
    };
    let redelivery = if args.dedupe {
        Redelivery::Possible
    } else {
        Redelivery::None
    };
    let session = log_session(&config, &args.deployment, args.pod_type);
    session.on_event(print_log_event);
    let live = LiveTranscript::acquire(session, log_assembler(&config, redelivery))?;
    eprintln!("tailing {} (Ctrl-C to stop)", live.session().request());

    let automatic = config.reconnect != ReconnectPolicy::Manual;
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let Some(state) = interruptible(live.settled()).await else {
            break;
        };
        match state {
            SessionState::Closed => break,
            SessionState::Reconnecting if automatic => {
                let retrying = wait_while(live.session(), |s| *s == SessionState::Reconnecting);
                if interruptible(retrying).await.is_none() {
                    break;
                }
            }
            _ => {
                eprintln!("-- press Enter to reconnect, Ctrl-C to quit");
                let Some(line) = interruptible(stdin.next_line()).await else {
                    break;
                };
                if line?.is_none() {
                    break;
                }
                live.session().reconnect()?;
                wait_while(live.session(), |s| {
                    matches!(s, SessionState::Reconnecting | SessionState::Failed(_))
                })
                .await;
            }
        }
    }

    let transcript = live.release();
    if let Some(log) = transcript.as_log() {
        eprintln!(
            "-- {} lines retained, {} evicted",
            log.lines().count(),
            log.evicted
        );
    }
    Ok(())
}

fn print_log_event(event: &StreamEvent) {
    match event.control_signal() {
        None => println!("{event}"),
        Some(ControlSignal::Connected) => eprintln!("-- connected"),
        Some(ControlSignal::Disconnected) => eprintln!("-- disconnected: {}", event.payload()),
        Some(ControlSignal::DecodeFailed) => {
            eprintln!("-- skipped undecodable record: {}", event.payload())
        }
        Some(ControlSignal::ServerError) => eprintln!("-- server error: {}", event.payload()),
        Some(ControlSignal::RetriesExhausted) => eprintln!("-- {}", event.payload()),
        Some(ControlSignal::EndOfTurn) => {}
    }
}

async fn chat(config: &ConsoleConfig, args: ChatArgs) -> Result<(), CliError> {
    let url = match &args.deployment {
        Some(id) => config.deployment_chat_url(id),
        None => config.chat_url(),
    };
    let assembler = Assembler::chat();
    if let Some(prompt) = &args.prompt {
        chat_turn(config, &args, &url, &assembler, prompt).await?;
        return Ok(());
    }

    eprintln!("chatting with {} at {url}; empty line or Ctrl-D to quit", args.model);
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    loop {
        eprint!("> ");
        let _ = std::io::stderr().flush();
        let Some(line) = interruptible(stdin.next_line()).await else {
            break;
        };
        let Some(line) = line? else {
            break;
        };
        let prompt = line.trim();
        if prompt.is_empty() {
            break;
        }
        if !chat_turn(config, &args, &url, &assembler, prompt).await? {
            break;
        }
    }
    Ok(())
}

/// Streams one assistant reply into `assembler`. Returns false when
/// interrupted.
async fn chat_turn(
    config: &ConsoleConfig,
    args: &ChatArgs,
    url: &str,
    assembler: &Assembler,
    prompt: &str,
) -> Result<bool, CliError> {
    assembler.push_user_turn(prompt);
    let history = assembler.snapshot().as_chat().cloned().unwrap_or_default();
    let mut request = ChatRequest::from_history(args.model.as_str(), &history);
    if let Some(system) = &args.system {
        request = request.system_prompt(system.as_str());
    }
    if let Some(max_tokens) = args.max_tokens {
        request = request.max_tokens(max_tokens);
    }
    if let Some(temperature) = args.temperature {
        request = request.temperature(temperature);
    }

    let session = chat_session(config, url, &request)?;
    session.on_event(print_chat_event);
    let live = LiveTranscript::acquire(session, assembler.clone())?;
    let outcome = interruptible(live.settled()).await;
    println!();

    let Some(state) = outcome else {
        live.release();
        return Ok(false);
    };
    live.release();
    if state != SessionState::Closed {
        eprintln!("-- reply incomplete ({state})");
        assembler.keep_interrupted_reply();
    }
    Ok(true)
}

fn print_chat_event(event: &StreamEvent) {
    match event.kind() {
        EventKind::TokenDelta => {
            print!("{}", event.payload());
            let _ = std::io::stdout().flush();
        }
        EventKind::Control(ControlSignal::ServerError) => {
            eprintln!("\n-- server error: {}", event.payload())
        }
        EventKind::Control(ControlSignal::DecodeFailed) => {
            eprintln!("\n-- skipped undecodable frame: {}", event.payload())
        }
        EventKind::Control(ControlSignal::Disconnected) => {
            debug!(reason = event.payload(), "chat stream disconnected")
        }
        _ => {}
    }
}

async fn watch_status(config: &ConsoleConfig, args: WatchArgs) -> Result<(), CliError> {
    let terminal_states: Vec<String> = if args.until.is_empty() {
        args.resource
            .default_terminal_states()
            .iter()
            .map(|s| s.to_string())
            .collect()
    } else {
        args.until.clone()
    };
    let target = PollTarget::new(
        args.id.as_str(),
        terminal_states,
        Duration::from_secs(args.interval_secs),
        Duration::from_secs(args.timeout_secs),
    )?
    .with_max_consecutive_failures(args.max_failures);
    let fetcher = HttpStatusFetcher::new(
        config.api_url.as_str(),
        args.resource.endpoint(),
        config.request_timeout,
    )?;
    let watcher = StatusWatcher::new(target, fetcher);

    let cancel = CancelToken::new();
    let mut updates = watcher.watch_until(cancel.clone());
    let mut last_state: Option<String> = None;
    loop {
        let Some(update) = interruptible(updates.next()).await else {
            cancel.cancel();
            break;
        };
        let Some(update) = update else {
            break;
        };
        match update {
            PollUpdate::Observed(status) => {
                if args.json {
                    println!("{}", serde_json::to_string(&status)?);
                } else if last_state.as_deref() != Some(status.state.as_str()) {
                    println!("{}: {}", args.id, status.state);
                }
                last_state = Some(status.state);
            }
            PollUpdate::Error(err) => eprintln!("-- status check failed: {err}"),
            PollUpdate::TimedOut => {
                println!(
                    "{} is still provisioning after {}s; check back later",
                    args.id, args.timeout_secs
                );
            }
            PollUpdate::Failed {
                failures,
                last_error,
            } => return Err(CliError::WatchFailed { failures, last_error }),
        }
    }
    Ok(())
}
