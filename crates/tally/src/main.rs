//! Tally: command-line client for the dashboard backend
//!
//! Subcommands:
//! - `watch`: keep collections hydrated and follow realtime changes
//! - `pay-purchase` / `pay-sale`: record a payment through the mutation pipeline
//! - `delete`: delete an entity through the mutation pipeline

use std::path::PathBuf;

use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use miette::Result;
use tally_sync::{DashboardClient, EntityId, EntityTag, SyncConfig};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod mutate;
mod watch;

#[derive(Parser)]
#[command(name = "tally")]
#[command(about = "Dashboard client with optimistic writes and realtime sync", long_about = None)]
struct Cli {
    #[command(flatten)]
    connection: ConnectionArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct ConnectionArgs {
    /// REST API base URL
    #[arg(long, env = "TALLY_API_URL", default_value = "http://localhost:8000/api")]
    api_url: String,

    /// Push channel WebSocket URL
    #[arg(long, env = "TALLY_EVENTS_URL", default_value = "ws://localhost:8000/ws/events/")]
    events_url: String,

    /// Account username
    #[arg(long, env = "TALLY_USERNAME")]
    username: String,

    /// Account password (prompted for when absent)
    #[arg(long, env = "TALLY_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Rows per page for list collections
    #[arg(long, default_value = "8")]
    page_size: u32,
}

#[derive(Subcommand)]
enum Commands {
    /// Hydrate collections and follow realtime changes until Ctrl-C
    Watch {
        /// Collections to keep active (e.g. sales,purchases)
        #[arg(long = "collection", required = true, value_delimiter = ',')]
        collections: Vec<EntityTag>,

        /// Search text applied to every collection
        #[arg(long)]
        search: Option<String>,

        /// Mirror the cache to disk (default location when no path is given)
        #[arg(long, env = "TALLY_MIRROR", num_args = 0..=1)]
        mirror: Option<Option<PathBuf>>,
    },

    /// Record a payment against a purchase
    PayPurchase {
        id: EntityId,
        amount: f64,
        #[command(flatten)]
        payment: PaymentArgs,
    },

    /// Record a payment against a sale
    PaySale {
        id: EntityId,
        amount: f64,
        #[command(flatten)]
        payment: PaymentArgs,
    },

    /// Delete an entity
    Delete { collection: EntityTag, id: EntityId },
}

#[derive(Args)]
struct PaymentArgs {
    /// Bank account the payment goes through
    #[arg(long)]
    bank: Option<EntityId>,

    /// Payment method (cash, transfer, ...)
    #[arg(long)]
    method: Option<String>,

    /// Payment date (YYYY-MM-DD), defaults to today on the server
    #[arg(long)]
    date: Option<NaiveDate>,
}

impl ConnectionArgs {
    fn config(&self) -> Result<SyncConfig> {
        SyncConfig::builder()
            .api_url(&self.api_url)
            .events_url(&self.events_url)
            .default_page_size(self.page_size)
            .build()
            .map_err(|e| miette::miette!("{}", e))
    }

    /// Build a client and log in.
    async fn connect(&self, config: &SyncConfig) -> Result<DashboardClient> {
        let password = match &self.password {
            Some(password) => password.clone(),
            None => read_password()?,
        };
        let client = DashboardClient::from_config(config);
        client
            .login(&self.username, &password)
            .await
            .map_err(|e| miette::miette!("{}", e))?;
        info!(username = %self.username, api = %config.api_url, "logged in");
        Ok(client)
    }
}

fn read_password() -> Result<String> {
    eprint!("Password: ");
    rpassword::read_password().map_err(|e| miette::miette!("failed to read password: {}", e))
}

/// Default mirror location under the user's cache directory.
fn default_mirror_path() -> Result<PathBuf> {
    dirs::cache_dir()
        .map(|dir| dir.join("tally").join("cache.json"))
        .ok_or_else(|| miette::miette!("no cache directory available, pass --mirror <PATH>"))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "tally=info,tally_sync=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = cli.connection.config()?;

    match cli.command {
        Commands::Watch {
            collections,
            search,
            mirror,
        } => {
            let mirror = match mirror {
                Some(Some(path)) => Some(path),
                Some(None) => Some(default_mirror_path()?),
                None => None,
            };
            let client = cli.connection.connect(&config).await?;
            watch::run(config, client, &collections, search.as_deref(), mirror).await
        }

        Commands::PayPurchase { id, amount, payment } => {
            let client = cli.connection.connect(&config).await?;
            mutate::pay(config, client, EntityTag::Purchases, id, payment.input(amount)).await
        }

        Commands::PaySale { id, amount, payment } => {
            let client = cli.connection.connect(&config).await?;
            mutate::pay(config, client, EntityTag::Sales, id, payment.input(amount)).await
        }

        Commands::Delete { collection, id } => {
            let client = cli.connection.connect(&config).await?;
            mutate::delete(config, client, collection, id).await
        }
    }
}

impl PaymentArgs {
    fn input(self, amount: f64) -> tally_sync::PaymentInput {
        tally_sync::PaymentInput {
            amount,
            bank_id: self.bank,
            method: self.method,
            date: self.date,
        }
    }
}
