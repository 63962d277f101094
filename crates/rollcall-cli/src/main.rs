use anyhow::{bail, Context, Result};
use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand};
use rollcall_core::{FeatureVector, IdentityId};
use rollcall_store::SqliteStore;
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "rollcall", version, about = "rollcall attendance scanner CLI")]
struct Cli {
    /// Database path (default: $ROLLCALL_DB_PATH or $XDG_DATA_HOME/rollcall/attendance.db)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll feature vectors for a person
    Enroll {
        /// Display name; enrollments with the same name (ignoring case and
        /// surrounding spaces) belong to one identity
        #[arg(short, long)]
        name: String,
        /// JSON file holding one 128-float array, or an array of them
        #[arg(short, long)]
        vectors: PathBuf,
    },
    /// List enrolled identities
    List,
    /// Remove an enrolled identity (attendance history is kept)
    Remove {
        /// Identity ID to remove
        id: i64,
    },
    /// Show attendance events for a day
    Events {
        /// Local date as YYYY-MM-DD (default: today)
        #[arg(short, long, value_parser = parse_date)]
        date: Option<NaiveDate>,
    },
    /// Acknowledge the pending confirmation and resume scanning
    Ack,
    /// Start a scanning session
    Start,
    /// Stop the running scanning session
    Stop,
    /// Ask the daemon to rebuild its gallery
    Reload,
    /// Show daemon status
    Status,
}

#[zbus::proxy(
    interface = "org.rollcall.Scanner1",
    default_service = "org.rollcall.Scanner1",
    default_path = "/org/rollcall/Scanner1"
)]
trait Scanner {
    async fn acknowledge(&self) -> zbus::Result<bool>;
    async fn start_session(&self) -> zbus::Result<String>;
    async fn stop_session(&self) -> zbus::Result<bool>;
    async fn reload_gallery(&self) -> zbus::Result<u32>;
    async fn status(&self) -> zbus::Result<String>;
}

/// Accepted shapes for `enroll --vectors`.
#[derive(Deserialize)]
#[serde(untagged)]
enum VectorFile {
    One(FeatureVector),
    Many(Vec<FeatureVector>),
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let db_path = cli.db.unwrap_or_else(default_db_path);
    tracing::debug!(path = %db_path.display(), "using database");

    match cli.command {
        Commands::Enroll { name, vectors } => {
            let vectors = read_vectors(&vectors)?;
            let mut store = open_store(&db_path)?;
            let id = store.enroll_many(&name, &vectors)?;
            println!("Enrolled {} vector(s) for {name} (identity {id})", vectors.len());
            match scanner().await {
                Ok(proxy) => match proxy.reload_gallery().await {
                    Ok(count) => println!("Daemon gallery reloaded: {count} identities"),
                    Err(err) => println!("Daemon reload failed: {err}"),
                },
                Err(_) => println!("rollcalld not running; gallery loads on next session"),
            }
        }
        Commands::List => {
            let store = open_store(&db_path)?;
            let identities = store.list_identity_summaries()?;
            if identities.is_empty() {
                println!("No identities enrolled");
            }
            for identity in identities {
                println!(
                    "{:>5}  {:<32}  {} vector(s)",
                    identity.identity_id, identity.display_name, identity.descriptors
                );
            }
        }
        Commands::Remove { id } => {
            let mut store = open_store(&db_path)?;
            if store.remove_identity(IdentityId(id))? {
                println!("Removed identity {id}");
            } else {
                bail!("no identity with id {id}");
            }
        }
        Commands::Events { date } => {
            let date = date.unwrap_or_else(|| Local::now().date_naive());
            let store = open_store(&db_path)?;
            let events = store.list_events_on(date)?;
            if events.is_empty() {
                println!("No attendance recorded on {date}");
            }
            for stored in events {
                let event = stored.event;
                println!(
                    "{:>5}  {}  {:<32}  confidence {}",
                    stored.event_id,
                    event.timestamp.format("%H:%M:%S"),
                    event.display_name,
                    event.confidence
                );
            }
        }
        Commands::Ack => {
            if scanner().await?.acknowledge().await? {
                println!("Acknowledged; scanning resumed");
            } else {
                println!("Nothing awaiting acknowledgment");
            }
        }
        Commands::Start => {
            let id = scanner().await?.start_session().await?;
            println!("Scanning session {id}");
        }
        Commands::Stop => {
            if scanner().await?.stop_session().await? {
                println!("Scanning session stopped");
            } else {
                println!("No scanning session running");
            }
        }
        Commands::Reload => {
            let count = scanner().await?.reload_gallery().await?;
            println!("Gallery reloaded: {count} identities");
        }
        Commands::Status => {
            let raw = scanner().await?.status().await?;
            let status: serde_json::Value = serde_json::from_str(&raw)?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
    }

    Ok(())
}

async fn scanner() -> Result<ScannerProxy<'static>> {
    let conn = zbus::Connection::session()
        .await
        .context("connecting to the session bus")?;
    ScannerProxy::new(&conn)
        .await
        .context("rollcalld not reachable on D-Bus")
}

fn open_store(path: &Path) -> Result<SqliteStore> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    SqliteStore::open(path).with_context(|| format!("opening database {}", path.display()))
}

fn default_db_path() -> PathBuf {
    if let Ok(path) = std::env::var("ROLLCALL_DB_PATH") {
        return PathBuf::from(path);
    }
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall/attendance.db")
}

fn parse_date(raw: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|e| format!("{raw}: {e}"))
}

fn parse_vectors(raw: &str) -> Result<Vec<FeatureVector>> {
    let vectors = match serde_json::from_str(raw).context("expected 128-float arrays")? {
        VectorFile::One(v) => vec![v],
        VectorFile::Many(vs) => vs,
    };
    if vectors.is_empty() {
        bail!("vector file contains no vectors");
    }
    Ok(vectors)
}

fn read_vectors(path: &Path) -> Result<Vec<FeatureVector>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading vectors from {}", path.display()))?;
    parse_vectors(&raw).with_context(|| format!("parsing {}", path.display()))
}
