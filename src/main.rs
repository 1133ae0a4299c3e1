//! ACORD session CLI - sign in, call the API and follow push events.
//!
//! See the `acord_session` library for the core functionality.

use std::io::{BufRead, Write};

use acord_session::auth::LoginRequest;
use acord_session::events::{
    DashboardUpdate, NotificationRecord, ProcessingComplete, ProcessingProgress,
};
use acord_session::http::ApiRequest;
use acord_session::notifications::DEFAULT_LOAD_LIMIT;
use acord_session::{Config, SessionContext};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use reqwest::Method;

/// mimalloc provides better multi-threaded performance than the system allocator.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser)]
#[command(name = "acord-session")]
#[command(version)]
#[command(about = "Session and push-event client for the ACORD parser API")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign in and store the session
    Login {
        /// Account email
        email: String,
        /// Two-factor code, if the account requires one
        #[arg(long)]
        code: Option<String>,
    },
    /// Forget the stored session
    Logout,
    /// Show sign-in state and configuration
    Status,
    /// Send an authenticated request and print the response body
    Request {
        /// HTTP method (GET, POST, PUT, DELETE, ...)
        method: String,
        /// Path relative to the API base, e.g. /documents
        path: String,
        /// JSON request body
        #[arg(long)]
        body: Option<String>,
    },
    /// Connect to the push hub and print events until Ctrl-C
    Watch,
    /// Manage the notification inbox
    Notifications {
        #[command(subcommand)]
        action: NotificationAction,
    },
}

#[derive(Subcommand)]
enum NotificationAction {
    /// List recent notifications
    List {
        /// Maximum number to fetch
        #[arg(long, default_value_t = DEFAULT_LOAD_LIMIT)]
        limit: u32,
    },
    /// Mark one notification read
    Read {
        /// Notification id
        id: String,
    },
    /// Mark every notification read
    ReadAll,
    /// Delete one notification
    Delete {
        /// Notification id
        id: String,
    },
    /// Delete every notification
    Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let cli = Cli::parse();
    let config = Config::load()?;
    let session = SessionContext::new(&config)?;

    match cli.command {
        Commands::Login { email, code } => login(&session, email, code).await?,
        Commands::Logout => {
            session.auth().logout();
            println!("Signed out.");
        }
        Commands::Status => status(&session, &config).await,
        Commands::Request { method, path, body } => request(&session, &method, path, body).await?,
        Commands::Watch => watch(&session).await?,
        Commands::Notifications { action } => notifications(&session, action).await?,
    }
    Ok(())
}

async fn login(session: &SessionContext, email: String, code: Option<String>) -> Result<()> {
    print!("Password: ");
    std::io::stdout().flush()?;
    let mut password = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut password)
        .context("failed to read password")?;

    let request = LoginRequest {
        email,
        password: password.trim_end_matches(['\r', '\n']).to_string(),
        two_factor_code: code,
    };
    let response = session.auth().login(&request).await?;
    if response.two_factor_required {
        println!("Two-factor code required. Run again with --code <CODE>.");
    } else {
        println!(
            "Signed in as {} ({:?} plan).",
            response.email, response.subscription_tier
        );
    }
    Ok(())
}

async fn status(session: &SessionContext, config: &Config) {
    println!("API:     {}", config.api_base());
    println!("Hub:     {}", config.hub_url());
    println!("Storage: {:?}", config.token_storage);

    if !session.auth().is_authenticated() {
        println!("Session: signed out");
        return;
    }
    match session.auth().load_current_user().await {
        Ok(user) => println!(
            "Session: signed in as {} ({:?} plan)",
            user.email, user.subscription_tier
        ),
        Err(e) => println!("Session: expired ({e})"),
    }
}

async fn request(
    session: &SessionContext,
    method: &str,
    path: String,
    body: Option<String>,
) -> Result<()> {
    let method: Method = method
        .to_uppercase()
        .parse()
        .with_context(|| format!("invalid HTTP method: {method}"))?;
    let mut request = ApiRequest::new(method, path);
    if let Some(body) = body {
        let json: serde_json::Value = serde_json::from_str(&body).context("--body is not valid JSON")?;
        request = request.json(json);
    }

    let response = session.api().execute(request).await?;
    match serde_json::from_str::<serde_json::Value>(response.text()) {
        Ok(json) => println!("{}", serde_json::to_string_pretty(&json)?),
        Err(_) => println!("{}", response.text()),
    }
    Ok(())
}

async fn watch(session: &SessionContext) -> Result<()> {
    if !session.auth().is_authenticated() {
        anyhow::bail!("not signed in; run `acord-session login <EMAIL>` first");
    }

    let bus = session.bus();
    let mut progress = bus.subscribe::<ProcessingProgress>();
    let mut complete = bus.subscribe::<ProcessingComplete>();
    let mut dashboard = bus.subscribe::<DashboardUpdate>();
    let mut notifications = bus.subscribe::<NotificationRecord>();
    let mut state = session.push().connection_state();
    let mut auth = session.auth().auth_state();

    session.push().start().await?;
    let watcher = session.spawn_auth_watcher();
    println!("Watching for push events (Ctrl-C to stop)...");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            Some(p) = progress.recv() => println!(
                "[progress] {} {}% {} ({}/{} fields)",
                p.file_name, p.percent_complete, p.current_step, p.processed_fields, p.total_fields
            ),
            Some(c) = complete.recv() => println!(
                "[complete] {} {}",
                c.document_id,
                if c.success { "succeeded" } else { "failed" }
            ),
            Some(d) = dashboard.recv() => println!("[dashboard] updated at {}", d.timestamp),
            Some(n) = notifications.recv() => println!(
                "[notification] {:?}: {} - {} (unread: {})",
                n.category, n.title, n.message, session.inbox().unread_count()
            ),
            Ok(()) = state.changed() => println!("[channel] {}", *state.borrow_and_update()),
            Ok(()) = auth.changed() => {
                let current = *auth.borrow_and_update();
                if !current.is_authenticated() {
                    println!("[session] {current:?}");
                    break;
                }
            }
        }
    }

    watcher.abort();
    session.shutdown().await;
    Ok(())
}

async fn notifications(session: &SessionContext, action: NotificationAction) -> Result<()> {
    let inbox = session.inbox();
    match action {
        NotificationAction::List { limit } => {
            inbox.load(limit).await?;
            let snapshot = inbox.snapshot();
            for n in &snapshot.items {
                println!(
                    "{} {} {:?} {} - {}",
                    if n.is_read { " " } else { "*" },
                    n.id,
                    n.category,
                    n.title,
                    n.message
                );
            }
            println!("{} unread", snapshot.unread);
        }
        NotificationAction::Read { id } => {
            inbox.mark_as_read(&id).await?;
            println!("Marked {id} read.");
        }
        NotificationAction::ReadAll => {
            inbox.mark_all_as_read().await?;
            println!("All notifications marked read.");
        }
        NotificationAction::Delete { id } => {
            inbox.delete(&id).await?;
            println!("Deleted {id}.");
        }
        NotificationAction::Clear => {
            inbox.clear_all().await?;
            println!("Inbox cleared.");
        }
    }
    Ok(())
}
