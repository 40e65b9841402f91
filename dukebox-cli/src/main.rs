//! Dukebox - a package manager for Java runtime builds.

use std::collections::BTreeSet;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tabled::{
    settings::{object::Rows, Alignment, Modify, Style},
    Table, Tabled,
};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use dukebox_core::catalog::{manifest::ManifestProvider, BackendContext, ProviderRegistry};
use dukebox_core::config::{self, ConfigStore};
use dukebox_core::inventory::UnpackOptions;
use dukebox_core::{
    Catalog, Client, ClientEvent, Configuration, Inventory, RuntimeDescriptor, SearchCriteria,
    VersionRange,
};

#[derive(Debug, Clone, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn directive(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

#[derive(Parser, Debug)]
#[clap(
    name = "dukebox",
    about = "Download, verify and manage Java runtime builds",
    version
)]
struct Cli {
    #[clap(subcommand)]
    command: Command,

    /// Inventory root (defaults to the per-user data directory)
    #[clap(long, global = true)]
    inventory: Option<PathBuf>,

    /// Repository configuration file (defaults to the per-user config
    /// directory)
    #[clap(long, global = true)]
    config: Option<PathBuf>,

    /// Log level
    #[clap(long, global = true, default_value = "warn")]
    log_level: LogLevel,
}

#[derive(Debug, Args)]
struct Filters {
    /// Filter by platform (e.g. linux, windows)
    #[clap(long)]
    platform: Option<String>,

    /// Filter by CPU architecture (e.g. x64, aarch64)
    #[clap(long)]
    arch: Option<String>,

    /// Filter by virtual machine implementation (e.g. hotspot)
    #[clap(long)]
    vm: Option<String>,

    /// Filter by configuration: jdk or jre
    #[clap(long)]
    configuration: Option<String>,

    /// Lowest acceptable version (inclusive)
    #[clap(long)]
    min_version: Option<String>,

    /// Version cap (exclusive)
    #[clap(long)]
    max_version: Option<String>,

    /// Required tag; may be given several times
    #[clap(long = "tag")]
    tags: Vec<String>,
}

impl Filters {
    fn criteria(&self) -> Result<SearchCriteria> {
        let mut criteria = SearchCriteria::any();
        criteria.platform = self.platform.clone();
        criteria.architecture = self.arch.clone();
        criteria.vm = self.vm.clone();
        criteria.configuration = self
            .configuration
            .as_deref()
            .map(|s| s.parse::<Configuration>())
            .transpose()
            .map_err(|e| anyhow!("{e}"))?;
        if self.min_version.is_some() || self.max_version.is_some() {
            let lower = self
                .min_version
                .as_deref()
                .map(str::parse)
                .transpose()
                .map_err(|e| anyhow!("invalid --min-version: {e}"))?;
            let upper = self
                .max_version
                .as_deref()
                .map(str::parse)
                .transpose()
                .map_err(|e| anyhow!("invalid --max-version: {e}"))?;
            criteria.version = Some(VersionRange::new(lower, false, upper, true)?);
        }
        criteria.required_tags = self.tags.iter().cloned().collect::<BTreeSet<_>>();
        Ok(criteria)
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Search runtimes advertised by the configured repositories
    Search {
        #[clap(flatten)]
        filters: Filters,

        /// Output results as JSON
        #[clap(long)]
        json: bool,
    },

    /// List runtimes already downloaded into the inventory
    List {
        #[clap(flatten)]
        filters: Filters,

        /// Output results as JSON
        #[clap(long)]
        json: bool,
    },

    /// Download a runtime into the inventory, verifying on the way in
    Download {
        /// Runtime id (the archive hash value)
        id: String,
    },

    /// Print the stored archive path for a runtime
    Path {
        /// Runtime id
        id: String,
    },

    /// Re-verify a stored archive against its recorded hash
    Verify {
        /// Runtime id
        id: String,
    },

    /// Remove a runtime from the inventory
    Delete {
        /// Runtime id
        id: String,
    },

    /// Extract a stored archive
    Unpack {
        /// Runtime id
        id: String,

        /// Destination directory
        destination: PathBuf,

        /// Drop the archive's single top-level directory
        #[clap(long)]
        strip_root: bool,

        /// Clear group/other write bits on extracted files
        #[clap(long)]
        strip_write: bool,
    },

    /// Refresh one repository, or all of them
    Update {
        /// Repository name (all configured repositories if omitted)
        name: Option<String>,
    },

    /// Manage configured repositories
    Repo {
        #[clap(subcommand)]
        command: RepoCommand,
    },
}

#[derive(Subcommand, Debug)]
enum RepoCommand {
    /// Add a repository
    Add {
        /// Short name, e.g. "corporate"
        name: String,

        /// Manifest uri
        uri: String,
    },

    /// Remove a repository
    Remove {
        /// Repository name
        name: String,
    },

    /// List configured repositories
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cli.log_level.directive())),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut store = match &cli.config {
        Some(path) => ConfigStore::load_from_path(path.clone())?,
        None => ConfigStore::load()?,
    };
    debug!(repositories = store.repositories().len(), "config loaded");

    // Repo subcommands only touch the config file; no engine needed.
    if let Command::Repo { command } = &cli.command {
        return run_repo(&mut store, command);
    }

    let inventory_root = match &cli.inventory {
        Some(path) => path.clone(),
        None => config::inventory_dir()?,
    };

    let (client, names) = build_client(&store, inventory_root).await?;
    let result = run(&client, &cli.command, &names).await;
    client.close().await;
    result
}

/// Wires config entries into a running client. Returns the client and
/// the name -> uri mapping for the update command.
async fn build_client(
    store: &ConfigStore,
    inventory_root: PathBuf,
) -> Result<(Client, Vec<(String, String)>)> {
    let http = reqwest::Client::builder()
        .user_agent(concat!("dukebox/", env!("CARGO_PKG_VERSION")))
        .timeout(std::time::Duration::from_secs(30))
        .build()
        .context("failed to create HTTP client")?;

    let registry = ProviderRegistry::new();
    let mut names = Vec::new();
    for entry in store.repositories() {
        registry.register(std::sync::Arc::new(ManifestProvider::new(
            entry.uri.clone(),
            entry.name.clone(),
        )))?;
        names.push((entry.name.clone(), entry.uri.clone()));
    }

    let catalog = Catalog::new(BackendContext {
        cache_dir: config::cache_dir()?,
        http,
    });
    catalog.attach(&registry);

    let inventory = Inventory::open(inventory_root)?;
    debug!(repositories = names.len(), "client wired");
    Ok((Client::new(inventory, catalog), names))
}

async fn run(client: &Client, command: &Command, names: &[(String, String)]) -> Result<()> {
    match command {
        Command::Search { filters, json } => {
            let found = client.search_catalog(filters.criteria()?).await?;
            print_descriptors(&found, *json)
        }
        Command::List { filters, json } => {
            let found = client.search_inventory(filters.criteria()?).await?;
            print_descriptors(&found, *json)
        }
        Command::Download { id } => {
            let progress = tokio::spawn(print_progress(client.subscribe()));
            let result = client.download(id).await;
            progress.abort();
            let path = result?;
            println!("Downloaded to {}", path.display());
            Ok(())
        }
        Command::Path { id } => match client.path_of(id).await? {
            Some(path) => {
                println!("{}", path.display());
                Ok(())
            }
            None => Err(anyhow!("'{id}' is not in the inventory")),
        },
        Command::Verify { id } => {
            if client.verify(id).await? {
                println!("OK");
                Ok(())
            } else {
                Err(anyhow!("'{id}' failed verification"))
            }
        }
        Command::Delete { id } => {
            client.delete(id).await?;
            println!("Deleted '{id}'");
            Ok(())
        }
        Command::Unpack {
            id,
            destination,
            strip_root,
            strip_write,
        } => {
            let options = UnpackOptions {
                strip_leading_directory: *strip_root,
                strip_non_owner_writable: *strip_write,
            };
            let path = client.unpack(id, destination.clone(), options).await?;
            println!("Unpacked to {}", path.display());
            Ok(())
        }
        Command::Update { name } => {
            let selected: Vec<&(String, String)> = match name {
                Some(name) => {
                    let entry = names
                        .iter()
                        .find(|(n, _)| n == name)
                        .ok_or_else(|| anyhow!("repository '{name}' is not configured"))?;
                    vec![entry]
                }
                None => names.iter().collect(),
            };
            if selected.is_empty() {
                println!("No repositories configured.");
                return Ok(());
            }
            for (name, uri) in selected {
                print!("Updating '{name}'... ");
                match client.update(uri.clone()).await {
                    Ok(()) => println!("done"),
                    Err(e) => println!("failed: {e}"),
                }
            }
            Ok(())
        }
        Command::Repo { .. } => unreachable!("handled before engine start"),
    }
}

fn run_repo(store: &mut ConfigStore, command: &RepoCommand) -> Result<()> {
    match command {
        RepoCommand::Add { name, uri } => {
            store.add(name, uri)?;
            store.save()?;
            println!("Added repository '{name}'");
        }
        RepoCommand::Remove { name } => {
            store.remove(name)?;
            store.save()?;
            println!("Removed repository '{name}'");
        }
        RepoCommand::List => {
            if store.repositories().is_empty() {
                println!("No repositories configured.");
            } else {
                for entry in store.repositories() {
                    println!("  {} -> {}", entry.name, entry.uri);
                }
            }
        }
    }
    Ok(())
}

#[derive(Tabled)]
struct RuntimeRow {
    #[tabled(rename = "Id")]
    id: String,
    #[tabled(rename = "Version")]
    version: String,
    #[tabled(rename = "Platform")]
    platform: String,
    #[tabled(rename = "Arch")]
    arch: String,
    #[tabled(rename = "VM")]
    vm: String,
    #[tabled(rename = "Config")]
    configuration: String,
    #[tabled(rename = "Tags")]
    tags: String,
}

fn print_descriptors(found: &[RuntimeDescriptor], json: bool) -> Result<()> {
    if found.is_empty() {
        println!("No runtimes found.");
        return Ok(());
    }

    if json {
        println!("{}", serde_json::to_string_pretty(found)?);
        return Ok(());
    }

    let rows: Vec<RuntimeRow> = found
        .iter()
        .map(|d| RuntimeRow {
            id: shorten(d.id()),
            version: d.version().to_string(),
            platform: d.platform().to_string(),
            arch: d.architecture().to_string(),
            vm: d.vm().to_string(),
            configuration: d.configuration().as_str().to_string(),
            tags: d.tags().iter().cloned().collect::<Vec<_>>().join(","),
        })
        .collect();

    let mut table = Table::new(rows);
    table
        .with(Style::rounded())
        .with(Modify::new(Rows::new(1..)).with(Alignment::left()));
    println!("{table}");
    println!("{} runtime(s)", found.len());
    Ok(())
}

fn shorten(id: &str) -> String {
    if id.len() > 16 {
        format!("{}...", &id[..16])
    } else {
        id.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_filters() -> Filters {
        Filters {
            platform: None,
            arch: None,
            vm: None,
            configuration: None,
            min_version: None,
            max_version: None,
            tags: Vec::new(),
        }
    }

    #[test]
    fn filters_build_a_half_open_version_range() {
        let filters = Filters {
            platform: Some("linux".into()),
            configuration: Some("jdk".into()),
            min_version: Some("8".into()),
            max_version: Some("11".into()),
            tags: vec!["production".into()],
            ..empty_filters()
        };
        let criteria = filters.criteria().unwrap();
        assert_eq!(criteria.platform.as_deref(), Some("linux"));
        assert!(matches!(criteria.configuration, Some(Configuration::Jdk)));
        assert!(criteria.version.is_some());
        assert!(criteria.required_tags.contains("production"));
    }

    #[test]
    fn unparsable_version_filter_is_rejected() {
        let filters = Filters {
            min_version: Some("not-a-version".into()),
            ..empty_filters()
        };
        assert!(filters.criteria().is_err());
    }

    #[test]
    fn long_ids_are_shortened_for_display() {
        assert_eq!(shorten("0123456789abcdef0123"), "0123456789abcdef...");
        assert_eq!(shorten("short"), "short");
    }
}

async fn print_progress(mut events: tokio::sync::broadcast::Receiver<ClientEvent>) {
    while let Ok(event) = events.recv().await {
        if let ClientEvent::DownloadProgress {
            bytes,
            expected,
            bytes_per_sec,
            ..
        } = event
        {
            let percent = if expected > 0 {
                (bytes as f64 / expected as f64) * 100.0
            } else {
                0.0
            };
            eprintln!(
                "  {percent:>5.1}%  {:.1} MiB  {:.1} MiB/s",
                bytes as f64 / (1024.0 * 1024.0),
                bytes_per_sec / (1024.0 * 1024.0),
            );
        }
    }
}
