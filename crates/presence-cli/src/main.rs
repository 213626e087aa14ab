use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

#[zbus::proxy(
    interface = "org.presence.Attendance1",
    default_service = "org.presence.Attendance1",
    default_path = "/org/presence/Attendance1"
)]
trait Attendance {
    async fn process_snapshot(&self, image: &[u8]) -> zbus::Result<String>;
    async fn status(&self, identity: &str) -> zbus::Result<String>;
    async fn present(&self) -> zbus::Result<String>;
    async fn history(&self, start: &str, end: &str, identity: &str) -> zbus::Result<String>;
    async fn stats(&self, start: &str, end: &str) -> zbus::Result<String>;
    async fn record_exit(&self, identity: &str) -> zbus::Result<String>;
    async fn health(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "presence", about = "Presence attendance CLI")]
struct Cli {
    /// Talk to a daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a snapshot (JPEG, PNG or WebP) for recognition
    Recognize {
        /// Image file
        file: PathBuf,
    },
    /// Show today's presence for an identity
    Status {
        /// Employee id
        id: String,
    },
    /// List everyone currently in the office
    Present,
    /// List attendance events between two dates (inclusive)
    History {
        /// First day, YYYY-MM-DD (default: today)
        #[arg(long)]
        from: Option<NaiveDate>,
        /// Last day, YYYY-MM-DD (default: today)
        #[arg(long)]
        to: Option<NaiveDate>,
        /// Only this employee id
        #[arg(long)]
        identity: Option<String>,
    },
    /// Hours present per identity between two dates (inclusive)
    Stats {
        /// First day, YYYY-MM-DD (default: today)
        #[arg(long)]
        from: Option<NaiveDate>,
        /// Last day, YYYY-MM-DD (default: today)
        #[arg(long)]
        to: Option<NaiveDate>,
    },
    /// Record an explicit exit
    Exit {
        /// Employee id
        id: String,
    },
    /// Show daemon health
    Health,
}

fn day(date: Option<NaiveDate>) -> String {
    date.unwrap_or_else(|| chrono::Local::now().date_naive())
        .format("%Y-%m-%d")
        .to_string()
}

fn print_json(raw: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(raw).context("daemon returned invalid JSON")?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let builder = if cli.system {
        zbus::connection::Builder::system()?
    } else {
        zbus::connection::Builder::session()?
    };
    // Recognition may wait on model inference; keep the timeout above the daemon's.
    let conn = builder
        .method_timeout(Duration::from_secs(30))
        .build()
        .await
        .context("connecting to D-Bus")?;
    let proxy = AttendanceProxy::new(&conn)
        .await
        .context("presenced is not reachable")?;

    let response = match cli.command {
        Commands::Recognize { file } => {
            let image = std::fs::read(&file).with_context(|| format!("reading {}", file.display()))?;
            tracing::debug!(bytes = image.len(), "submitting snapshot");
            proxy.process_snapshot(&image).await?
        }
        Commands::Status { id } => proxy.status(&id).await?,
        Commands::Present => proxy.present().await?,
        Commands::History { from, to, identity } => {
            proxy
                .history(&day(from), &day(to), identity.as_deref().unwrap_or(""))
                .await?
        }
        Commands::Stats { from, to } => proxy.stats(&day(from), &day(to)).await?,
        Commands::Exit { id } => proxy.record_exit(&id).await?,
        Commands::Health => proxy.health().await?,
    };

    print_json(&response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_history_parses_dates() {
        let cli = Cli::try_parse_from([
            "presence",
            "history",
            "--from",
            "2026-01-01",
            "--to",
            "2026-01-02",
            "--identity",
            "42",
        ])
        .unwrap();
        match cli.command {
            Commands::History { from, to, identity } => {
                assert_eq!(from, NaiveDate::from_ymd_opt(2026, 1, 1));
                assert_eq!(to, NaiveDate::from_ymd_opt(2026, 1, 2));
                assert_eq!(identity.as_deref(), Some("42"));
            }
            _ => panic!("expected history"),
        }
    }

    #[test]
    fn test_bad_date_rejected() {
        assert!(Cli::try_parse_from(["presence", "stats", "--from", "yesterday"]).is_err());
    }

    #[test]
    fn test_system_flag_is_global() {
        let cli = Cli::try_parse_from(["presence", "present", "--system"]).unwrap();
        assert!(cli.system);
    }

    #[test]
    fn test_default_day_is_formatted() {
        assert_eq!(day(NaiveDate::from_ymd_opt(2026, 3, 4)), "2026-03-04");
        assert_eq!(day(None).len(), 10);
    }
}
