//! gitindex command-line management tool.
//!
//! Inspects the content stores under the configured storage directory and
//! drives their search indexes: listing stores, showing per-branch index
//! status, printing change summaries and content pulls, rebuilding indexes,
//! polling remotes, and tearing stores down.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use comfy_table::{presets::UTF8_FULL, Cell, Color, ContentArrangement, Table};
use tracing::info;
use tracing_subscriber::EnvFilter;

use gitindex_core::config::AppConfig;
use gitindex_core::events::{Event, EventBus};
use gitindex_core::index::{backend_from_config, IndexState};
use gitindex_core::poller::Poller;
use gitindex_core::store::{layout, Author, RepositoryStore};
use gitindex_core::sync_engine::SyncOrchestrator;

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// gitindex command-line management tool.
#[derive(Parser, Debug)]
#[command(
    name = "gitindex",
    version,
    about = "Manage git-backed content stores and their search indexes"
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, global = true, default_value = "./gitindex.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(flatten)]
    Store(StoreCommand),

    /// Generate a default configuration file.
    InitConfig {
        /// Output path for the generated config file.
        #[arg(short, long, default_value = "./gitindex.toml")]
        output: PathBuf,
    },

    /// Validate a configuration file.
    Validate,
}

/// Commands that operate on the configured storage directory.
#[derive(Subcommand, Debug)]
enum StoreCommand {
    /// List the stores in the storage directory.
    List,

    /// Show a store's position, schemas, and branch indexes.
    Status {
        /// Store name (directory under storage.repo_dir).
        name: String,
    },

    /// Print the changes between a commit and the store's head as JSON.
    Diff {
        name: String,
        /// Earlier commit id.
        commit: String,
    },

    /// Print the objects added or modified since a commit, grouped by
    /// content type, as JSON.
    Pull {
        name: String,
        /// Earlier commit id.
        commit: String,
    },

    /// Print every object of a store, grouped by content type, as JSON.
    Dump { name: String },

    /// Clone a remote store and build its index.
    Clone {
        url: String,
        /// Directory name for the store (default: last URL component).
        #[arg(long)]
        name: Option<String>,
    },

    /// Rebuild the index of a store's checked-out branch from scratch.
    Reindex { name: String },

    /// Pull every store from its remote and sync indexes of stores that moved.
    Poll {
        /// Keep polling at this interval in seconds.
        #[arg(long)]
        watch: Option<u64>,
    },

    /// Destroy a store's indexes and delete the store.
    Teardown { name: String },
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::InitConfig { output } => {
            init_tracing("warn");
            cmd_init_config(&output)
        }
        Commands::Validate => {
            init_tracing("warn");
            cmd_validate(&cli.config)
        }
        Commands::Store(command) => {
            let config = load_config(&cli.config)?;
            init_tracing(&config.logging.level);
            let app = App::new(config)?;

            match command {
                StoreCommand::List => app.cmd_list(),
                StoreCommand::Status { name } => app.cmd_status(&name).await,
                StoreCommand::Diff { name, commit } => app.cmd_diff(&name, &commit),
                StoreCommand::Pull { name, commit } => app.cmd_pull(&name, &commit).await,
                StoreCommand::Dump { name } => app.cmd_dump(&name).await,
                StoreCommand::Clone { url, name } => app.cmd_clone(&url, name.as_deref()).await,
                StoreCommand::Reindex { name } => app.cmd_reindex(&name).await,
                StoreCommand::Poll { watch } => app.cmd_poll(watch).await,
                StoreCommand::Teardown { name } => app.cmd_teardown(&name).await,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Config helpers
// ---------------------------------------------------------------------------

fn load_config(path: &Path) -> Result<AppConfig> {
    AppConfig::load_and_resolve(path).with_context(|| {
        format!("failed to load configuration from {}", path.display())
    })
}

// ---------------------------------------------------------------------------
// Application context
// ---------------------------------------------------------------------------

struct App {
    config: AppConfig,
    orchestrator: Arc<SyncOrchestrator>,
    bus: Arc<EventBus>,
}

impl App {
    fn new(config: AppConfig) -> Result<Self> {
        let backend =
            backend_from_config(&config.index).context("failed to create index backend")?;
        let orchestrator = Arc::new(SyncOrchestrator::from_config(&config, backend));
        let bus = Arc::new(EventBus::new());
        if config.index.enabled {
            orchestrator.register(&bus);
        } else {
            info!("indexing disabled; index handlers not registered");
        }
        Ok(Self {
            config,
            orchestrator,
            bus,
        })
    }

    fn author(&self) -> Author {
        Author {
            name: self.config.storage.author_name.clone(),
            email: self.config.storage.author_email.clone(),
        }
    }

    fn store_path(&self, name: &str) -> PathBuf {
        self.config.storage.repo_dir.join(name)
    }

    fn open_store(&self, name: &str) -> Result<RepositoryStore> {
        let store = RepositoryStore::open(self.store_path(name))
            .with_context(|| format!("failed to open store '{}'", name))?;
        Ok(store.with_author(self.author()))
    }

    fn require_index(&self) -> Result<()> {
        if !self.config.index.enabled {
            anyhow::bail!("indexing is disabled; set index.enabled = true in the configuration");
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Subcommand implementations
    // -----------------------------------------------------------------------

    fn cmd_list(&self) -> Result<()> {
        let paths = layout::discover(&self.config.storage.repo_dir)
            .context("failed to scan storage directory")?;
        if paths.is_empty() {
            println!(
                "No stores found in {}.",
                self.config.storage.repo_dir.display()
            );
            return Ok(());
        }

        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_content_arrangement(ContentArrangement::Dynamic);
        table.set_header(vec!["Name", "Branch", "Commit", "Content types"]);

        for path in paths {
            let store = RepositoryStore::open(&path)
                .with_context(|| format!("failed to open store at {}", path.display()))?;
            let branch = store
                .current_branch()?
                .unwrap_or_else(|| "(detached)".to_string());
            let commit = store
                .head_commit()
                .map(|c| c[..8.min(c.len())].to_string())
                .unwrap_or_else(|_| "—".to_string());
            let types = store.list_content_types()?.join(", ");
            table.add_row(vec![
                Cell::new(store.name()),
                Cell::new(branch),
                Cell::new(commit),
                Cell::new(types),
            ]);
        }

        println!("{}", table);
        Ok(())
    }

    async fn cmd_status(&self, name: &str) -> Result<()> {
        let store = self.open_store(name)?;
        let summary = store.summary().context("failed to read store summary")?;

        println!("Store {}", summary.name);
        println!("{}", "=".repeat(summary.name.len() + 6));
        println!();
        println!(
            "  Branch    : {}",
            summary.branch.as_deref().unwrap_or("(detached)")
        );
        println!("  Commit    : {}", summary.commit);
        println!("  Timestamp : {}", summary.timestamp);
        println!("  Author    : {}", summary.author);
        println!("  Schemas   : {}", summary.schemas.len());
        for schema in summary.schemas.keys() {
            println!("    - {}", schema);
        }
        println!();

        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_content_arrangement(ContentArrangement::Dynamic);
        table.set_header(vec!["Branch", "Index", "State", "Documents"]);

        for branch in store.list_branches()? {
            let manager = self
                .orchestrator
                .branch_index(&store, &branch, None)
                .await
                .with_context(|| format!("failed to query index for branch '{}'", branch))?;
            let state_cell = match manager.state() {
                IndexState::Ready => Cell::new("ready").fg(Color::Green),
                IndexState::Absent => Cell::new("absent").fg(Color::Yellow),
                other => Cell::new(other.to_string()),
            };
            let documents = match manager.state() {
                IndexState::Absent => "—".to_string(),
                _ => manager.count(None).await?.to_string(),
            };
            table.add_row(vec![
                Cell::new(&branch),
                Cell::new(manager.name()),
                state_cell,
                Cell::new(documents),
            ]);
        }

        println!("{}", table);
        Ok(())
    }

    fn cmd_diff(&self, name: &str, commit: &str) -> Result<()> {
        let store = self.open_store(name)?;
        let summary = store
            .diff_summary(commit)
            .with_context(|| format!("failed to diff '{}' against {}", name, commit))?;
        println!("{}", serde_json::to_string_pretty(&summary)?);
        Ok(())
    }

    async fn cmd_pull(&self, name: &str, commit: &str) -> Result<()> {
        let store = self.open_store(name)?;
        let _guard = self.orchestrator.locks().acquire(store.root()).await?;
        let pull = store
            .pull_summary(commit)
            .with_context(|| format!("failed to collect changes in '{}' since {}", name, commit))?;
        println!("{}", serde_json::to_string_pretty(&pull)?);
        Ok(())
    }

    async fn cmd_dump(&self, name: &str) -> Result<()> {
        let store = self.open_store(name)?;
        let _guard = self.orchestrator.locks().acquire(store.root()).await?;
        let dump = store
            .dump()
            .with_context(|| format!("failed to read objects of '{}'", name))?;
        println!("{}", serde_json::to_string_pretty(&dump)?);
        Ok(())
    }

    async fn cmd_clone(&self, url: &str, name: Option<&str>) -> Result<()> {
        let name = match name {
            Some(n) => n.to_string(),
            None => url
                .trim_end_matches('/')
                .rsplit('/')
                .next()
                .map(|s| s.trim_end_matches(".git").to_string())
                .filter(|s| !s.is_empty())
                .context("cannot derive a store name from the URL; pass --name")?,
        };
        let path = self.store_path(&name);
        if path.exists() {
            anyhow::bail!("store already exists: {}", path.display());
        }
        std::fs::create_dir_all(&self.config.storage.repo_dir)
            .context("failed to create storage directory")?;

        let store = RepositoryStore::clone_from(url, &path)
            .with_context(|| format!("failed to clone {}", url))?
            .with_author(self.author());
        println!("Cloned {} into {}", url, path.display());

        self.bus
            .publish(&Event::StoreCloned {
                store: Arc::new(store),
                index_prefix: None,
            })
            .await
            .context("failed to index cloned store")?;
        if self.config.index.enabled {
            println!("Index built.");
        }
        Ok(())
    }

    async fn cmd_reindex(&self, name: &str) -> Result<()> {
        self.require_index()?;
        let store = self.open_store(name)?;
        let stats = self
            .orchestrator
            .on_store_cloned(&store, None)
            .await
            .with_context(|| format!("failed to rebuild index for '{}'", name))?;
        println!(
            "Rebuilt {} with {} document(s).",
            stats.index, stats.indexed
        );
        Ok(())
    }

    async fn cmd_poll(&self, watch: Option<u64>) -> Result<()> {
        let poller = Poller::from_config(&self.config, self.bus.clone())
            .with_locks(self.orchestrator.locks().clone());
        if let Some(secs) = watch {
            println!("Polling every {}s (Ctrl-C to stop)...", secs);
            tokio::select! {
                _ = poller.run(Duration::from_secs(secs.max(1))) => {}
                _ = tokio::signal::ctrl_c() => {
                    println!("Stopped.");
                }
            }
            return Ok(());
        }

        let report = poller
            .poll_once()
            .await
            .context("failed to scan storage directory")?;

        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_content_arrangement(ContentArrangement::Dynamic);
        table.set_header(vec!["Store", "Result", "Detail"]);
        for (name, old, new) in &report.updated {
            let old = if old.is_empty() { "(none)" } else { &old[..8.min(old.len())] };
            table.add_row(vec![
                Cell::new(name),
                Cell::new("updated").fg(Color::Green),
                Cell::new(format!("{} -> {}", old, &new[..8.min(new.len())])),
            ]);
        }
        for (name, error) in &report.failed {
            table.add_row(vec![
                Cell::new(name),
                Cell::new("failed").fg(Color::Red),
                Cell::new(error),
            ]);
        }

        println!(
            "Checked {} store(s): {} updated, {} failed.",
            report.checked,
            report.updated.len(),
            report.failed.len()
        );
        if !report.updated.is_empty() || !report.failed.is_empty() {
            println!("{}", table);
        }
        if !report.failed.is_empty() {
            anyhow::bail!("{} store(s) failed to poll", report.failed.len());
        }
        Ok(())
    }

    async fn cmd_teardown(&self, name: &str) -> Result<()> {
        let path = self.store_path(name);
        if self.config.index.enabled {
            let destroyed = self
                .orchestrator
                .teardown_store(&path, None)
                .await
                .with_context(|| format!("failed to tear down '{}'", name))?;
            for index in &destroyed {
                println!("Destroyed index {}", index);
            }
        } else {
            self.open_store(name)?
                .teardown()
                .with_context(|| format!("failed to remove '{}'", name))?;
        }
        println!("Removed store {}", path.display());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Configuration subcommands
// ---------------------------------------------------------------------------

fn cmd_init_config(output: &Path) -> Result<()> {
    if output.exists() {
        anyhow::bail!(
            "file already exists: {}. Use a different path or remove the existing file.",
            output.display()
        );
    }

    let body = AppConfig::default_toml().context("failed to render default configuration")?;
    let contents = format!("# gitindex configuration\n\n{}", body);
    std::fs::write(output, contents).context("failed to write config file")?;

    println!("Default configuration written to {}", output.display());
    println!();
    println!("Next steps:");
    println!("  1. Point storage.repo_dir at the directory holding your stores");
    println!("  2. Set index.enabled = true and the index URL (or the ES_HOST variable)");
    println!(
        "  3. Validate with: gitindex validate --config {}",
        output.display()
    );
    Ok(())
}

fn cmd_validate(config_path: &Path) -> Result<()> {
    println!("Validating configuration: {}", config_path.display());
    println!();

    let mut config =
        AppConfig::load_from_file(config_path).context("failed to parse configuration")?;
    println!("  [OK] TOML structure is valid");

    config
        .resolve_env_vars()
        .context("failed to resolve environment variables")?;
    println!("  [OK] Environment overrides applied");

    if let Err(e) = config.validate() {
        println!("  [FAIL] Validation error: {}", e);
        anyhow::bail!("configuration validation failed");
    }
    println!("  [OK] All fields are valid");

    println!();
    println!("Configuration summary:");
    println!("  Store directory : {}", config.storage.repo_dir.display());
    println!(
        "  Commit author   : {} <{}>",
        config.storage.author_name, config.storage.author_email
    );
    println!(
        "  Indexing        : {}",
        if config.index.enabled { "enabled" } else { "disabled" }
    );
    println!("  Index backend   : {:?}", config.index.backend);
    println!("  Index URL       : {}", config.index.url);
    println!(
        "  Rename targets  : {}",
        if config.sync.index_rename_targets { "re-indexed" } else { "ignored" }
    );
    println!();
    println!("Configuration is valid.");
    Ok(())
}
