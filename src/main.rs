// Quota Holder - Administration CLI
//
// Runs against the SQLite database named in the config file, acting as the
// administrative entity.

use anyhow::{Context as _, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use quotaholder::{
    dispatch, logging, write_csv, Context, EngineConfig, ListQuery, QuotaHolder, Request,
    Resolution, TimelineQuery, DEFAULT_CONFIG_FILE, VERSION,
};
use std::io::Read;
use std::path::{Path, PathBuf};

/// Quota holder administration
#[derive(Parser)]
#[command(name = "quotaholder")]
#[command(about = "Quota holder - resource accounting and commissioning", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Override the database path from the config
    #[arg(short, long)]
    database: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database and bootstrap the administrative entity
    Init,

    /// List entities owned by the admin (or by --owner)
    Entities {
        #[arg(long)]
        owner: Option<String>,
        /// Key of --owner
        #[arg(long, default_value = "")]
        key: String,
        #[arg(long)]
        prefix: Option<String>,
        #[arg(long)]
        marker: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
    },

    /// List pending commission serials
    Pending,

    /// Resolve pending commissions (crash recovery)
    Resolve {
        /// Serials to accept
        #[arg(long, value_delimiter = ',')]
        accept: Vec<u64>,
        /// Serials to reject
        #[arg(long, value_delimiter = ',')]
        reject: Vec<u64>,
    },

    /// Export an entity's timeline as CSV
    Timeline {
        entity: String,
        #[arg(long)]
        resource: Option<String>,
        /// Exclusive lower bound (RFC 3339)
        #[arg(long)]
        after: Option<DateTime<Utc>>,
        /// Exclusive upper bound (RFC 3339)
        #[arg(long)]
        before: Option<DateTime<Utc>>,
        /// Output file; stdout when absent
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Purge resolved commissions past retention (or before --before)
    Purge {
        #[arg(long)]
        before: Option<DateTime<Utc>>,
    },

    /// Run one JSON request from a file ("-" for stdin) and print the reply
    Call { request: PathBuf },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = EngineConfig::load(&cli.config)?;
    if let Some(database) = cli.database {
        config.database = database;
    }

    let filter = if cli.verbose { "debug" } else { config.log_filter.as_str() };
    logging::init(filter);

    let holder = QuotaHolder::open_sqlite(&config)
        .with_context(|| format!("Failed to open database {}", config.database.display()))?;
    let admin = Context::new(&config.admin_entity, &config.admin_key);

    match cli.command {
        Commands::Init => run_init(&holder, &config),
        Commands::Entities {
            owner,
            key,
            prefix,
            marker,
            limit,
        } => {
            let (owner, key) = match owner {
                Some(owner) => (owner, key),
                None => (admin.entity.clone(), admin.key.clone()),
            };
            let query = ListQuery {
                prefix,
                marker,
                limit,
            };
            for name in holder.list_entities(&owner, &key, &query)? {
                println!("{}", name);
            }
            Ok(())
        }
        Commands::Pending => {
            let pending = holder.get_pending_commissions(&admin)?;
            println!("⏳ {} pending commission(s)", pending.len());
            for serial in pending {
                let commission = holder.get_commission(&admin, serial)?;
                println!(
                    "  #{} issued by {} at {} ({} provisions)",
                    serial,
                    commission.issuer,
                    commission.created_at.to_rfc3339(),
                    commission.provisions.len()
                );
            }
            Ok(())
        }
        Commands::Resolve { accept, reject } => run_resolve(&holder, &admin, accept, reject),
        Commands::Timeline {
            entity,
            resource,
            after,
            before,
            output,
        } => {
            let query = TimelineQuery {
                entity,
                resource,
                after,
                before,
            };
            let entries = holder.get_timeline(&admin, &query)?;
            match output {
                Some(path) => {
                    let file = std::fs::File::create(&path)
                        .with_context(|| format!("Failed to create {}", path.display()))?;
                    write_csv(&entries, file)?;
                    println!("✓ Wrote {} timeline entries to {}", entries.len(), path.display());
                }
                None => write_csv(&entries, std::io::stdout())?,
            }
            Ok(())
        }
        Commands::Purge { before } => {
            let purged = match before {
                Some(cutoff) => holder.purge_commissions(&admin, cutoff)?,
                None => holder.purge_expired(&admin)?,
            };
            println!("🧹 Purged {} resolved commission(s)", purged);
            Ok(())
        }
        Commands::Call { request } => run_call(&holder, &request),
    }
}

fn run_init(holder: &QuotaHolder, config: &EngineConfig) -> Result<()> {
    println!("🗄️  Quota Holder v{} - SQLite + WAL", VERSION);
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("✓ Database ready: {}", config.database.display());
    println!("✓ Administrative entity: {}", holder.admin()?);

    let pending = holder.get_pending_commissions(&Context::new(
        &config.admin_entity,
        &config.admin_key,
    ))?;
    if !pending.is_empty() {
        println!(
            "⚠️  {} pending commission(s) awaiting resolution: {:?}",
            pending.len(),
            pending
        );
    }
    Ok(())
}

fn run_resolve(holder: &QuotaHolder, admin: &Context, accept: Vec<u64>, reject: Vec<u64>) -> Result<()> {
    let items: Vec<Resolution> = accept
        .into_iter()
        .map(Resolution::accept)
        .chain(reject.into_iter().map(Resolution::reject))
        .collect();
    let total = items.len();

    let result = holder.resolve_pending_commissions(admin, items)?;
    println!("✓ Resolved {} of {} commission(s)", total - result.rejected.len(), total);
    for rejection in &result.rejected {
        println!("  ❌ #{}: {}", rejection.item, rejection.error);
    }
    Ok(())
}

fn run_call(holder: &QuotaHolder, path: &Path) -> Result<()> {
    let mut json = String::new();
    if path.as_os_str() == "-" {
        std::io::stdin().read_to_string(&mut json)?;
    } else {
        json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read request {}", path.display()))?;
    }

    let request = Request::from_json(&json)?;
    let reply = match dispatch(holder, request) {
        Ok(response) => serde_json::json!({ "success": true, "data": response }),
        Err(e) => serde_json::json!({ "success": false, "error": e }),
    };
    println!("{}", serde_json::to_string_pretty(&reply)?);
    Ok(())
}
