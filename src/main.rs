// Event Registry - administrative CLI

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use event_registry::{
    build_mirror, init_logging, AdminFilter, AreaRule, Config, MirrorSynchronizer, PushOutcome,
    RawArea, RecoveryOutcome, RegistrationService, RegistryStore, StatusChange, SyncHandle,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

#[derive(Parser)]
#[command(author, version, about = "Event registration registry with spreadsheet mirror")]
struct Cli {
    /// Configuration file (defaults are used when it does not exist)
    #[arg(short, long, global = true, default_value = "registry.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write the effective configuration to the config path
    InitConfig,
    /// Import the mirror into an empty local store
    Recover,
    /// Register a group of names
    Register {
        #[arg(long)]
        area: String,
        #[arg(long)]
        church: String,
        #[arg(required = true)]
        names: Vec<String>,
    },
    /// Approve one registrant
    Approve { full_name: String },
    /// Show the members and approval state of a group
    Status { group_id: String },
    /// List registrants, optionally filtered
    List {
        #[arg(long)]
        church: Option<String>,
        #[arg(long)]
        area: Option<i64>,
    },
    /// Delete every local registration (the mirror is not touched)
    Erase {
        #[arg(long)]
        yes: bool,
    },
    /// Push the full registry to the mirror now, ignoring the cooldown
    Push,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;
    init_logging(&config.log);

    match cli.command {
        Commands::InitConfig => {
            config.save(&cli.config)?;
            println!("✓ Wrote {}", cli.config.display());
        }
        Commands::Recover => {
            let mut synchronizer = synchronizer(open_store(&config)?, &config)?;
            match synchronizer.recover().await? {
                RecoveryOutcome::NotNeeded => println!("Local store is not empty; nothing to recover."),
                RecoveryOutcome::Unavailable => bail!("Mirror could not be read; see log for details"),
                RecoveryOutcome::Restored { fetched, imported, rejected } => {
                    println!("✓ Fetched {} records, imported {}, rejected {}", fetched, imported, rejected);
                }
            }
        }
        Commands::Register { area, church, names } => {
            let group_id = service(&config)?.try_register(&RawArea::Text(area), &church, &names)?;
            println!("✓ Registered group {}", group_id);
        }
        Commands::Approve { full_name } => match service(&config)?.approve(&full_name)? {
            StatusChange::Updated => println!("✓ {} approved", full_name.trim()),
            StatusChange::Unchanged => println!("{} was already approved", full_name.trim()),
        },
        Commands::Status { group_id } => {
            let status = service(&config)?.group_status(&group_id)?;
            if status.members.is_empty() {
                println!("No members found for group {}", group_id);
            }
            for member in &status.members {
                println!("{:<32} {}", member.name, member.status);
            }
            if status.all_approved {
                println!("All members approved ✅");
            } else {
                println!("Waiting for approval ⏳");
            }
        }
        Commands::List { church, area } => {
            let rows = service(&config)?.admin_list_filtered(&AdminFilter { church, area })?;
            println!("{:<32} {:<24} {:>4}  {}", "Name", "Church", "Area", "Status");
            for row in &rows {
                println!("{:<32} {:<24} {:>4}  {}", row.full_name, row.church, row.area, row.status);
            }
            println!("{} registrant(s)", rows.len());
        }
        Commands::Erase { yes } => {
            if !yes {
                bail!("Refusing to erase without --yes");
            }
            let removed = service(&config)?.erase()?;
            println!("✓ Removed {} registration(s)", removed);
        }
        Commands::Push => {
            let mut synchronizer = synchronizer(open_store(&config)?, &config)?;
            match synchronizer.flush(Instant::now()).await {
                PushOutcome::Pushed { rows } => println!("✓ Pushed {} rows to the mirror", rows),
                PushOutcome::Clean => println!("Nothing to push."),
                PushOutcome::Failed | PushOutcome::Deferred { .. } => {
                    bail!("Push failed; see log for details")
                }
            }
        }
    }

    Ok(())
}

fn open_store(config: &Config) -> Result<Arc<RegistryStore>> {
    let store = RegistryStore::open(&config.database_path, config.busy_timeout())
        .with_context(|| format!("Failed to open {}", config.database_path.display()))?;
    Ok(Arc::new(store))
}

// CLI changes reach the mirror through the next `push` or the server's sync loop
fn service(config: &Config) -> Result<RegistrationService> {
    Ok(RegistrationService::new(
        open_store(config)?,
        SyncHandle::detached(),
        AreaRule::from_config(&config.validation),
    ))
}

fn synchronizer(store: Arc<RegistryStore>, config: &Config) -> Result<MirrorSynchronizer> {
    if config.mirror.url.is_none() {
        bail!("No mirror configured; set [mirror] url or REGISTRY_MIRROR_URL");
    }
    let mirror = build_mirror(&config.mirror)?;
    Ok(MirrorSynchronizer::from_config(store, mirror, &config.mirror))
}
