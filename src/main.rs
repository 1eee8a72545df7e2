use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use huddle::config::{ConfigError, HuddleConfig};
use huddle::net::error::AuthError;
use huddle::net::gotrue::HttpAuthBackend;
use huddle::net::types::Provider;
use huddle::routes::{RouteKind, resolve};
use huddle::services::auth::RedirectHandler;
use huddle::services::session::{ManagerOptions, SessionManager};
use huddle::services::store::FileSessionStore;
use huddle::state::auth::AuthState;
use huddle::util::auth::{NavigateOptions, RouteGuard, watch_guard};
use url::Url;

const SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("{0}")]
    Auth(#[from] AuthError),
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("timed out waiting for auth state to settle")]
    Timeout,
    #[error("auth state closed")]
    Closed,
    #[error("signal handler failed: {0}")]
    Signal(#[from] std::io::Error),
}

#[derive(Parser, Debug)]
#[command(name = "huddle", about = "Huddle Up session manager CLI")]
struct Cli {
    #[arg(long, env = "HUDDLE_BACKEND_URL")]
    backend_url: String,

    #[arg(long, env = "HUDDLE_ANON_KEY")]
    anon_key: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create an account.
    SignUp {
        email: String,
        password: String,
        #[arg(long)]
        name: String,
    },
    /// Sign in with email and password.
    SignIn {
        email: String,
        password: String,
        /// Keep the session across restarts.
        #[arg(long)]
        remember: bool,
    },
    SignOut,
    /// Print the authorize URL for a federated provider.
    Provider { provider: Provider },
    /// Finish an OAuth sign-in from the URL the provider redirected to.
    CompleteRedirect { url: Url },
    /// Print the signed-in user.
    Whoami,
    /// Show what the router would do for a path.
    Route { path: String },
    /// Keep the session fresh and report guard decisions for a path until interrupted.
    Watch {
        #[arg(default_value = "/dashboard")]
        path: String,
    },
}

/// Prints the provider URL for the user to open.
struct PrintRedirect;

impl RedirectHandler for PrintRedirect {
    fn open(&self, url: &Url) -> Result<(), AuthError> {
        println!("{url}");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("ignoring unreadable .env: {e}");
        }
    }
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let config = HuddleConfig::from_env_with(&cli.backend_url, &cli.anon_key)?;
    let store = Arc::new(FileSessionStore::new(config.session_file.clone()));
    let backend = HttpAuthBackend::connect(&config, store).await?;
    let manager = SessionManager::new(backend.clone(), Arc::new(PrintRedirect), ManagerOptions::from_config(&config));
    settle(&manager, |s| !s.loading).await?;

    let result = run(cli.command, &manager, &backend).await;
    manager.shutdown();
    result
}

async fn run(command: Command, manager: &SessionManager, backend: &Arc<HttpAuthBackend>) -> Result<(), CliError> {
    match command {
        Command::SignUp { email, password, name } => {
            manager.sign_up(&email, &password, &name).await?;
            if backend.current_session().is_none() {
                println!("account created; check {email} for a confirmation link");
                return Ok(());
            }
            settle(manager, |s| s.user.is_some()).await?;
            print_user(&manager.snapshot())
        }
        Command::SignIn { email, password, remember } => {
            manager.sign_in(&email, &password, remember).await?;
            settle(manager, |s| s.user.is_some()).await?;
            print_user(&manager.snapshot())
        }
        Command::SignOut => {
            manager.sign_out().await?;
            settle(manager, |s| s.user.is_none()).await?;
            println!("signed out");
            Ok(())
        }
        Command::Provider { provider } => manager.sign_in_with_provider(provider).await.map_err(CliError::from),
        Command::CompleteRedirect { url } => {
            backend.complete_redirect(&url).await?;
            settle(manager, |s| s.user.is_some()).await?;
            print_user(&manager.snapshot())
        }
        Command::Whoami => print_user(&manager.snapshot()),
        Command::Route { path } => {
            let (route, decision) = resolve(&path, &manager.snapshot());
            println!("{route}: {decision:?}");
            Ok(())
        }
        Command::Watch { path } => watch(manager, backend, &path).await,
    }
}

async fn watch(manager: &SessionManager, backend: &Arc<HttpAuthBackend>, path: &str) -> Result<(), CliError> {
    let (route, _) = resolve(path, &manager.snapshot());
    let access = match route.kind() {
        RouteKind::Guarded(access) => access,
        kind => {
            println!("{route} is not guarded ({kind:?})");
            return Ok(());
        }
    };
    let refresher = backend.spawn_auto_refresh();
    let guard = RouteGuard::new(access, |to: &str, opts: NavigateOptions| {
        println!("navigate -> {to} (replace: {})", opts.replace);
    });
    tokio::select! {
        () = watch_guard(manager.subscribe(), guard) => {}
        signal = tokio::signal::ctrl_c() => signal?,
    }
    refresher.abort();
    Ok(())
}

async fn settle(manager: &SessionManager, ready: impl Fn(&AuthState) -> bool) -> Result<(), CliError> {
    let mut states = manager.subscribe();
    match tokio::time::timeout(SETTLE_TIMEOUT, states.wait_for(|s| ready(s))).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(_)) => Err(CliError::Closed),
        Err(_) => Err(CliError::Timeout),
    }
}

fn print_user(state: &AuthState) -> Result<(), CliError> {
    match &state.user {
        Some(user) => {
            println!("{} <{}>", user.display_name(), user.email.as_deref().unwrap_or("no email"));
            println!("{}", serde_json::to_string_pretty(user)?);
        }
        None => println!("signed out"),
    }
    if let Some(error) = &state.last_error {
        eprintln!("last error: {error}");
    }
    Ok(())
}
