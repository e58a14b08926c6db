use crate::identity::{FirebaseIdentity, IdentityProvider, StaticIdentity};
use crate::model::{AppConfig, DeliveryState, Outcome};
use crate::orchestrator::{
    process_outcome, run_controller, ControllerEvent, ResultDeliveryController, UiCommand,
};
use crate::render::{spawn_output_writer, JsonRenderer, OutputLine, Renderer, TextRenderer};
use crate::submission::{build_http_client, HttpSubmitter};
use crate::watch::FirestoreWatcher;
use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Parser, Clone)]
#[command(
    name = "stock-analysis",
    version,
    about = "Submit tickers to the stock analysis service and follow the results"
)]
pub struct Cli {
    /// Ticker symbols to analyze, one after another
    pub tickers: Vec<String>,

    /// Analysis submission endpoint
    #[arg(long, default_value = "http://localhost:5000/api/analyze_stock_endpoint")]
    pub endpoint: String,

    /// Web API key of the hosted project (identity sign-in)
    #[arg(long, env = "STOCK_ANALYSIS_API_KEY")]
    pub api_key: Option<String>,

    /// Project holding the analysis job documents
    #[arg(long, env = "STOCK_ANALYSIS_PROJECT_ID")]
    pub project_id: Option<String>,

    /// Collection holding the analysis job documents
    #[arg(long, default_value = "analysis_results")]
    pub collection: String,

    /// Document store REST base URL
    #[arg(long, default_value = "https://firestore.googleapis.com/v1")]
    pub firestore_url: String,

    /// Identity REST base URL
    #[arg(long, default_value = "https://identitytoolkit.googleapis.com/v1")]
    pub identity_url: String,

    /// Token refresh REST base URL
    #[arg(long, default_value = "https://securetoken.googleapis.com/v1")]
    pub token_url: String,

    /// Sign-in email
    #[arg(long, env = "STOCK_ANALYSIS_EMAIL")]
    pub email: Option<String>,

    /// Sign-in password
    #[arg(long, env = "STOCK_ANALYSIS_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Use a pre-issued bearer token instead of signing in
    #[arg(long, env = "STOCK_ANALYSIS_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// How often a pending job document is checked
    #[arg(long, default_value = "2s")]
    pub poll_interval: humantime::Duration,

    /// Give up on a pending job after this long (default: wait indefinitely)
    #[arg(long)]
    pub watch_timeout: Option<humantime::Duration>,

    /// Timeout for each HTTP request
    #[arg(long, default_value = "30s")]
    pub request_timeout: humantime::Duration,

    /// Print JSON results
    #[arg(long, conflicts_with = "text")]
    pub json: bool,

    /// Print text results (default)
    #[arg(long)]
    pub text: bool,

    /// Read tickers from stdin; a new ticker supersedes the one in flight.
    /// Also accepts `login [EMAIL PASSWORD]`, `logout`, `cancel` and `quit`
    #[arg(long, short)]
    pub interactive: bool,

    /// Export the last completed result as JSON
    #[arg(long)]
    pub export_json: Option<std::path::PathBuf>,

    /// Use --auto-save true or --auto-save false to override
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub auto_save: bool,

    /// List the N most recent saved analyses and exit
    #[arg(long, value_name = "N")]
    pub history: Option<usize>,

    /// Increase log verbosity (-v, -vv)
    #[arg(long, short, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Build an `AppConfig` from CLI arguments.
pub fn build_config(args: &Cli) -> AppConfig {
    AppConfig {
        endpoint: args.endpoint.clone(),
        project_id: args.project_id.clone().unwrap_or_default(),
        collection: args.collection.clone(),
        poll_interval: Duration::from(args.poll_interval),
        watch_timeout: args.watch_timeout.map(Duration::from),
        request_timeout: Duration::from(args.request_timeout),
        user_agent: format!("stock-analysis-cli/{}", env!("CARGO_PKG_VERSION")),
    }
}

pub async fn run(args: Cli) -> Result<()> {
    if let Some(n) = args.history {
        return print_history(n);
    }
    if args.tickers.is_empty() && !args.interactive {
        return Err(anyhow::anyhow!(
            "no tickers given. Pass one or more tickers, or use --interactive."
        ));
    }

    let cfg = build_config(&args);
    if cfg.project_id.is_empty() {
        return Err(anyhow::anyhow!(
            "--project-id (or STOCK_ANALYSIS_PROJECT_ID) is required to follow pending analyses"
        ));
    }
    tracing::debug!(endpoint = %cfg.endpoint, project = %cfg.project_id, "configuration");

    let http = build_http_client(&cfg)?;
    let identity = establish_session(&args, http.clone()).await?;
    let provider = identity.provider();
    let submitter = Arc::new(HttpSubmitter::new(http.clone(), &cfg.endpoint)?);
    let watcher = Arc::new(
        FirestoreWatcher::with_base_url(http, &args.firestore_url, &cfg.project_id, &cfg.collection)?
            .poll_interval(cfg.poll_interval)
            .timeout(cfg.watch_timeout)
            .follow_session(provider.subscribe()),
    );

    let (out_tx, out_handle) = spawn_output_writer();
    let renderer: Box<dyn Renderer> = if args.json {
        Box::new(JsonRenderer::new(out_tx.clone()))
    } else {
        Box::new(TextRenderer::new(out_tx.clone()))
    };

    let (controller, watch_rx) = ResultDeliveryController::new(submitter, watcher, renderer);
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<UiCommand>();
    let (status_tx, status_rx) = mpsc::unbounded_channel::<ControllerEvent>();
    let ctrl_handle = tokio::spawn(run_controller(
        controller,
        watch_rx,
        provider,
        cmd_rx,
        status_tx,
    ));

    let mut session = CliSession {
        args: &args,
        cmd_tx,
        status_rx,
        out_tx,
        failures: 0,
    };
    let res = if args.interactive {
        session.run_interactive(&identity).await
    } else {
        session.run_batch().await
    };
    let failures = session.failures;

    let _ = session.cmd_tx.send(UiCommand::Quit);
    ctrl_handle
        .await
        .context("controller task failed")?
        .context("controller failed")?;
    drop(session);
    let _ = out_handle.await;

    res?;
    if failures > 0 && !args.interactive {
        return Err(anyhow::anyhow!(
            "{failures} of {} analyses failed",
            args.tickers.len()
        ));
    }
    Ok(())
}

/// Identity backing a run. Email/password sessions can be signed into again.
enum SessionSource {
    Token(Arc<StaticIdentity>),
    Account(Arc<FirebaseIdentity>),
}

impl SessionSource {
    fn provider(&self) -> Arc<dyn IdentityProvider> {
        match self {
            SessionSource::Token(id) => id.clone(),
            SessionSource::Account(id) => id.clone(),
        }
    }
}

/// Sign in with a token, or with email and password, or start signed out.
async fn establish_session(args: &Cli, http: reqwest::Client) -> Result<SessionSource> {
    if let Some(token) = args.token.as_deref() {
        return Ok(SessionSource::Token(Arc::new(StaticIdentity::new(token))));
    }
    let Some(key) = args.api_key.as_deref() else {
        tracing::warn!("no token or API key given; submissions will be rejected");
        return Ok(SessionSource::Token(Arc::new(StaticIdentity::signed_out())));
    };

    let identity = FirebaseIdentity::with_urls(http, key, &args.identity_url, &args.token_url);
    match (&args.email, &args.password) {
        (Some(email), Some(password)) => {
            identity
                .sign_in(email, password)
                .await
                .context("sign-in failed")?;
        }
        _ => tracing::warn!("no email/password given; sign in with `login` in interactive mode"),
    }
    Ok(SessionSource::Account(Arc::new(identity)))
}

/// Read stdin lines on a plain thread so an exit never waits on a pending read.
fn spawn_line_reader<R>(reader: R) -> mpsc::UnboundedReceiver<std::io::Result<String>>
where
    R: std::io::BufRead + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let spawned = std::thread::Builder::new()
        .name("stdin-reader".into())
        .spawn(move || {
            for line in reader.lines() {
                if tx.send(line).is_err() {
                    break;
                }
            }
        });
    if let Err(e) = spawned {
        tracing::warn!(error = %e, "failed to start the stdin reader");
    }
    rx
}

/// Where a request stands after a controller notification.
enum Step {
    Pending,
    Settled,
}

/// UI side of a controller run.
struct CliSession<'a> {
    args: &'a Cli,
    cmd_tx: mpsc::UnboundedSender<UiCommand>,
    status_rx: mpsc::UnboundedReceiver<ControllerEvent>,
    out_tx: mpsc::UnboundedSender<OutputLine>,
    failures: usize,
}

impl CliSession<'_> {
    fn info(&self, msg: String) {
        if !self.args.json {
            let _ = self.out_tx.send(OutputLine::Stderr(msg));
        }
    }

    fn send(&self, cmd: UiCommand) -> Result<()> {
        self.cmd_tx
            .send(cmd)
            .map_err(|_| anyhow::anyhow!("controller stopped unexpectedly"))
    }

    /// Submit each ticker in turn and wait for its outcome.
    async fn run_batch(&mut self) -> Result<()> {
        let args = self.args;
        for ticker in &args.tickers {
            self.send(UiCommand::Submit(ticker.clone()))?;
            loop {
                tokio::select! {
                    ev = self.status_rx.recv() => {
                        let Some(ev) = ev else {
                            return Err(anyhow::anyhow!("controller stopped unexpectedly"));
                        };
                        if let Step::Settled = self.on_status(ev) {
                            break;
                        }
                    }
                    _ = tokio::signal::ctrl_c() => {
                        self.info("Cancelling…".into());
                        self.send(UiCommand::Cancel)?;
                        return Ok(());
                    }
                }
            }
        }
        Ok(())
    }

    /// Read commands from stdin until `quit` or end of input.
    async fn run_interactive(&mut self, identity: &SessionSource) -> Result<()> {
        let mut lines = spawn_line_reader(std::io::BufReader::new(std::io::stdin()));
        self.info("Enter a ticker to analyze (login, logout, cancel, quit):".into());
        loop {
            tokio::select! {
                line = lines.recv() => {
                    let Some(line) = line else {
                        break;
                    };
                    let line = line.context("failed to read stdin")?;
                    let mut words = line.split_whitespace();
                    match (words.next(), words.next(), words.next()) {
                        (None, _, _) => {}
                        (Some("quit" | "exit"), _, _) => break,
                        (Some("logout"), _, _) => identity.provider().sign_out(),
                        (Some("cancel"), _, _) => self.send(UiCommand::Cancel)?,
                        (Some("login"), email, password) => self.login(identity, email, password).await,
                        (Some(_), _, _) => self.send(UiCommand::Submit(line.trim().to_string()))?,
                    }
                }
                Some(ev) = self.status_rx.recv() => {
                    self.on_status(ev);
                }
                _ = tokio::signal::ctrl_c() => break,
            }
        }
        Ok(())
    }

    /// Sign in again, with the given account or the one from the command line.
    async fn login(&self, identity: &SessionSource, email: Option<&str>, password: Option<&str>) {
        let SessionSource::Account(account) = identity else {
            self.info("login needs --api-key; this run uses a fixed token".into());
            return;
        };
        let email = email.or(self.args.email.as_deref()).unwrap_or_default();
        let password = password.or(self.args.password.as_deref()).unwrap_or_default();
        match account.sign_in(email, password).await {
            Ok(session) => self.info(format!(
                "Signed in as {}",
                session.email.as_deref().unwrap_or(email)
            )),
            Err(e) => self.info(format!("Sign-in failed: {}", e.user_message())),
        }
    }

    fn on_status(&mut self, ev: ControllerEvent) -> Step {
        match ev {
            ControllerEvent::Rejected(_) => {
                // Already rendered by the controller.
                self.failures += 1;
                Step::Settled
            }
            ControllerEvent::State(state) => match &state {
                DeliveryState::Watching { .. } => {
                    self.info(state.to_message());
                    Step::Pending
                }
                DeliveryState::Rendered(Outcome::Success { ticker, payload }) => {
                    let processed = process_outcome(self.args, ticker, payload);
                    for msg in processed.export_messages {
                        self.info(msg);
                    }
                    if let Some(p) = processed.auto_saved_path {
                        self.info(format!("Saved: {}", p.display()));
                    }
                    Step::Settled
                }
                DeliveryState::Rendered(Outcome::Error(_)) => {
                    self.failures += 1;
                    Step::Settled
                }
                DeliveryState::Idle => {
                    self.info("Analysis cancelled".into());
                    Step::Settled
                }
            },
        }
    }
}

fn print_history(limit: usize) -> Result<()> {
    let records = crate::storage::load_recent(limit).context("failed to load saved analyses")?;
    if records.is_empty() {
        println!("No saved analyses");
        return Ok(());
    }
    for r in records {
        let summary = r
            .result
            .analysis_summary()
            .map(|s| s.chars().take(60).collect::<String>())
            .unwrap_or_default();
        println!("{}  {:<8} {}", r.timestamp_utc, r.ticker, summary.replace('\n', " "));
    }
    Ok(())
}
