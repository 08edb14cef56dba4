use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};

use cronix::config::Config;
use cronix::scheduler::cron::Schedule;
use cronix::storage::{self, LogRecorder, RetentionPolicy, UserStore};

#[derive(Parser)]
#[command(
    name = "cronix",
    about = "Scheduler and execution engine for HTTP cron jobs",
    version,
    long_about = None
)]
struct Cli {
    /// Path to a TOML config file (default: $CRONIX_CONFIG, then ./cronix.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the service (API server + scheduler + executor)
    Serve {
        /// Bind address, overrides server.bind
        #[arg(long)]
        bind: Option<String>,

        /// SQLite database path, overrides storage.db_path
        #[arg(long)]
        db: Option<PathBuf>,
    },

    /// Inspect cron expressions
    Schedule {
        #[command(subcommand)]
        action: ScheduleAction,
    },

    /// Apply the log retention policy once and exit
    CleanupLogs {
        /// SQLite database path, overrides storage.db_path
        #[arg(long)]
        db: Option<PathBuf>,
    },

    /// Manage users
    User {
        #[command(subcommand)]
        action: UserAction,
    },
}

#[derive(Subcommand)]
enum ScheduleAction {
    /// Print the next fire times of a cron expression (UTC)
    Preview {
        /// Cron expression (5 or 6 fields)
        #[arg(long)]
        expr: String,

        /// Number of fire times to print (1-50)
        #[arg(long, default_value = "5", value_parser = clap::value_parser!(u16).range(1..=50))]
        count: u16,
    },
}

#[derive(Subcommand)]
enum UserAction {
    /// Create (or find) a user and print a new session token
    Add {
        #[arg(long)]
        email: String,

        #[arg(long)]
        name: String,

        /// SQLite database path, overrides storage.db_path
        #[arg(long)]
        db: Option<PathBuf>,

        /// Session lifetime in days (1-3650)
        #[arg(long, default_value = "30", value_parser = clap::value_parser!(i64).range(1..=3650))]
        ttl_days: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::resolve(cli.config.as_deref())?;
    cronix::init_tracing(&config.logging);

    match cli.command {
        Commands::Serve { bind, db } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            if let Some(db) = db {
                config.storage.db_path = db;
            }
            tracing::info!(bind = %config.server.bind, "Starting cronix");
            cronix::serve(config).await?;
        }
        Commands::Schedule { action } => match action {
            ScheduleAction::Preview { expr, count } => {
                let schedule = Schedule::parse(&expr)?;
                let upcoming = schedule.upcoming(Utc::now(), usize::from(count));
                if upcoming.is_empty() {
                    println!("'{}' has no upcoming fire times.", schedule);
                } else {
                    println!("Next {} fire times for '{}' (UTC):", upcoming.len(), schedule);
                    for at in upcoming {
                        println!("  {}", at.to_rfc3339());
                    }
                }
            }
        },
        Commands::CleanupLogs { db } => {
            let db_path = db.unwrap_or_else(|| config.storage.db_path.clone());
            let pool = storage::open_pool(&db_path)
                .with_context(|| format!("failed to open database {}", db_path.display()))?;
            let policy = RetentionPolicy::from(&config.logs);
            let report = LogRecorder::new(pool).cleanup(&policy, Utc::now())?;
            println!(
                "Deleted {} log entries ({} expired, {} over the per-job cap).",
                report.total(),
                report.expired,
                report.over_cap
            );
        }
        Commands::User { action } => match action {
            UserAction::Add {
                email,
                name,
                db,
                ttl_days,
            } => {
                let db_path = db.unwrap_or_else(|| config.storage.db_path.clone());
                let pool = storage::open_pool(&db_path)
                    .with_context(|| format!("failed to open database {}", db_path.display()))?;
                let users = UserStore::new(pool);
                let now = Utc::now();
                let user = users.upsert(&email, &name, now)?;
                let token = users.create_session(user.id, now, chrono::Duration::days(ttl_days))?;
                println!("User:  {} <{}> ({})", user.name, user.email, user.id);
                println!("Token: {}", token);
            }
        },
    }

    Ok(())
}
