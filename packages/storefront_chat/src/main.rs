use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use storefront_chat::{
    Channel, ChatMessage, ChatSession, ClientConfig, ClientDirs, ConnectionState,
    CredentialSource, HttpApi, Identity, Role, SessionSupervisor, SharedCredential, StorefrontApi,
    WsConnector,
};

#[derive(Parser)]
#[command(name = "storefront-chat")]
#[command(about = "Storefront chat and notification client")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Custom data directory (defaults to ~/.storefront-chat)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Open an interactive chat session
    Chat(IdentityArgs),

    /// Print the notification feed
    Notifications(NotificationArgs),
}

#[derive(Args)]
struct IdentityArgs {
    /// Signed-in user id
    #[arg(long)]
    user_id: String,

    /// Display name sent with outgoing messages
    #[arg(long)]
    name: Option<String>,

    /// Sign in as support staff
    #[arg(long)]
    admin: bool,

    /// Bearer token (falls back to STOREFRONT_TOKEN)
    #[arg(long)]
    token: Option<String>,
}

impl IdentityArgs {
    fn identity(&self) -> Identity {
        let role = if self.admin { Role::Admin } else { Role::Customer };
        let name = self.name.clone().unwrap_or_else(|| self.user_id.clone());
        Identity::new(self.user_id.clone(), name, role)
    }

    fn credential(&self) -> SharedCredential {
        let token = self
            .token
            .clone()
            .or_else(|| std::env::var("STOREFRONT_TOKEN").ok());
        SharedCredential::new(token)
    }
}

#[derive(Args)]
struct NotificationArgs {
    #[command(flatten)]
    identity: IdentityArgs,

    /// Mark everything read after printing
    #[arg(long)]
    mark_all_read: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_directive = if cli.debug {
        "storefront_chat=debug,info"
    } else {
        "storefront_chat=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();

    let dirs = ClientDirs::new(cli.data_dir)?;
    let config = ClientConfig::load(&dirs.data_dir)
        .with_context(|| format!("loading {}", dirs.config_toml_path().display()))?;
    info!(ws = %config.ws_url, api = %config.api_url, "configuration loaded");

    match cli.command {
        Commands::Chat(args) => run_chat(args, config).await,
        Commands::Notifications(args) => run_notifications(args, config).await,
    }
}

async fn run_notifications(args: NotificationArgs, config: ClientConfig) -> Result<()> {
    let credentials: Arc<dyn CredentialSource> = Arc::new(args.identity.credential());
    let api = HttpApi::new(&config.api_url, credentials)?;

    let items = api.notifications().await?;
    let unread = api.unread_count().await?;
    println!("{unread} unread");
    for n in &items {
        let marker = if n.read { ' ' } else { '*' };
        println!("{marker} [{}] {} ({})", n.id, n.message, n.link);
    }

    if args.mark_all_read {
        let mut marked = 0;
        for n in items.iter().filter(|n| !n.read) {
            match api.mark_notification_read(&n.id).await {
                Ok(()) => marked += 1,
                Err(e) => warn!(id = %n.id, "mark read failed: {}", e),
            }
        }
        println!("marked {marked} read");
    }
    Ok(())
}

async fn run_chat(args: IdentityArgs, config: ClientConfig) -> Result<()> {
    let identity = args.identity();
    let credentials: Arc<dyn CredentialSource> = Arc::new(args.credential());
    if credentials.credential().is_none() {
        bail!("no token: pass --token or set STOREFRONT_TOKEN");
    }

    let api: Arc<dyn StorefrontApi> =
        Arc::new(HttpApi::new(&config.api_url, credentials.clone())?);
    let connector = Arc::new(WsConnector::new(
        config.ws_url.clone(),
        config.connection.connect_timeout,
    ));
    let supervisor = SessionSupervisor::new(api, connector, credentials, config);

    supervisor.apply(Some(identity)).await;
    let session = supervisor
        .current()
        .context("chat session did not start")?;

    let printer = tokio::spawn(print_events(session.clone()));
    let result = command_loop(&session).await;

    printer.abort();
    supervisor.shutdown().await;
    result
}

/// Echo live traffic, notification arrivals, and connection changes.
async fn print_events(session: Arc<ChatSession>) {
    let me = session.identity().id.clone();
    let mut observed = session.subscribe_observed();
    let mut arrivals = session.notifications().subscribe_arrivals();
    let mut state = session.subscribe_connection_state();

    loop {
        tokio::select! {
            msg = observed.recv() => match msg {
                Ok(m) if m.from != me => {
                    let name = sender_name(&m);
                    println!("<{name}> {}", m.content);
                }
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "message feed lagged"),
                Err(RecvError::Closed) => break,
            },
            n = arrivals.recv() => match n {
                Ok(n) => println!("! {} ({})", n.message, n.link),
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let now = *state.borrow_and_update();
                match now {
                    ConnectionState::Connected => println!("-- connected"),
                    ConnectionState::Connecting => println!("-- connecting..."),
                    ConnectionState::Disconnected => println!("-- disconnected"),
                }
            }
        }
    }
}

fn sender_name(m: &ChatMessage) -> &str {
    if m.from_name.is_empty() { &m.from } else { &m.from_name }
}

const HELP: &str = "\
/bot             talk to the assistant
/support         talk to support
/open <user>     (admin) open a customer conversation
/list            (admin) list conversations
/history         show the current conversation
/notifications   show notifications
/read <id>       mark one notification read
/readall         mark all notifications read
/quit            leave";

async fn command_loop(session: &ChatSession) -> Result<()> {
    let mut channel = Channel::Bot;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("{HELP}");

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
        let rest = rest.trim();

        match command {
            "" => {}
            "/quit" | "/exit" => break,
            "/help" => println!("{HELP}"),
            "/bot" => {
                channel = Channel::Bot;
                println!("-- talking to the assistant");
            }
            "/support" => {
                channel = Channel::Admin;
                println!("-- talking to support");
            }
            "/open" if !rest.is_empty() => match session.select_partner(rest).await {
                Ok(()) => {
                    channel = Channel::Admin;
                    println!("-- conversation with {rest}");
                }
                Err(e) => println!("error: {e}"),
            },
            "/list" => match session.directory() {
                Some(directory) => {
                    for c in directory.snapshot() {
                        println!(
                            "{:>3} {} ({}): {}",
                            c.unread_count, c.display_name, c.partner_id, c.preview_text
                        );
                    }
                }
                None => println!("error: conversation list is admin-only"),
            },
            "/history" => {
                for m in session.store(channel).snapshot() {
                    let name = sender_name(&m);
                    let pending = if m.is_provisional() { " (sending)" } else { "" };
                    println!("<{name}> {}{pending}", m.content);
                }
            }
            "/notifications" => {
                let notifications = session.notifications();
                println!("{} unread", notifications.unread_count());
                for n in notifications.snapshot() {
                    let marker = if n.read { ' ' } else { '*' };
                    println!("{marker} [{}] {}", n.id, n.message);
                }
            }
            "/read" if !rest.is_empty() => {
                if !session.mark_read(rest).await {
                    println!("no unread notification {rest}");
                }
            }
            "/readall" => {
                let marked = session.mark_all_read().await;
                println!("marked {marked} read");
            }
            _ if command.starts_with('/') => println!("unknown command; /help lists them"),
            _ => {
                if let Err(e) = session.send_message(channel, line) {
                    println!("error: {e}");
                }
            }
        }
    }
    Ok(())
}
