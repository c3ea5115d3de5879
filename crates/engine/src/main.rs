//! EventVault engine CLI
//!
//! Configuration management and an in-memory simulation of a vault visit.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use engine::access::generate_vault_code;
use engine::backend::Backends;
use engine::config::{default_config_path, Config};
use engine::likes::GUEST_FILE;
use engine::{Engine, GuestIdentity, SelectionItem, UploadFile};
use model::{Folder, GuestId, Identity, UserId, Vault};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// EventVault engine - vault access, uploads and live sync.
#[derive(Parser, Debug)]
#[command(name = "eventvault")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Manage the configuration file
    #[command(subcommand)]
    Config(ConfigCommands),

    /// Run a vault visit against in-memory backends
    Simulate {
        /// Number of files to upload
        #[arg(long, short, default_value = "3")]
        files: usize,

        /// Size of each file in bytes
        #[arg(long, default_value = "4096")]
        size: usize,

        /// Passkey protecting the vault
        #[arg(long, default_value = "1234")]
        passkey: String,

        /// Make the vault public (no passkey needed to view)
        #[arg(long)]
        public: bool,

        /// Turn guest uploads off for the vault
        #[arg(long)]
        no_uploads: bool,

        /// Make the transfer of this file fail
        #[arg(long, value_name = "FILE_NAME")]
        fail_upload: Option<String>,

        /// Make the remote delete fail so the local view rolls back
        #[arg(long)]
        fail_delete: bool,

        /// Visit without signing in
        #[arg(long, conflicts_with = "as_owner")]
        anonymous: bool,

        /// Visit as the vault owner, who may also delete folders
        #[arg(long)]
        as_owner: bool,

        /// Do not persist the guest identity
        #[arg(long)]
        ephemeral: bool,
    },
}

/// Subcommands for configuration management.
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCommands {
    /// Print the effective configuration
    Show,

    /// Write the default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long, short)]
        force: bool,
    },

    /// Check the configuration file
    Validate,

    /// Print the configuration file path
    Path,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut config = Config::load(&config_path)?;
    config.apply_env_overrides();

    let _log_guard = init_tracing(&config, cli.verbose)?;

    match cli.command {
        Commands::Config(cmd) => match cmd {
            ConfigCommands::Show => {
                print!("{}", config.to_toml()?);
            }
            ConfigCommands::Init { force } => {
                if config_path.exists() && !force {
                    anyhow::bail!(
                        "Config file already exists at {} (use --force to overwrite)",
                        config_path.display()
                    );
                }
                Config::default().save(&config_path)?;
                println!("Wrote default configuration to {}", config_path.display());
            }
            ConfigCommands::Validate => match config.validate() {
                Ok(()) => println!("Configuration is valid"),
                Err(e) => {
                    eprintln!("Invalid configuration: {}", e);
                    std::process::exit(1);
                }
            },
            ConfigCommands::Path => {
                println!("{}", config_path.display());
            }
        },
        Commands::Simulate {
            files,
            size,
            passkey,
            public,
            no_uploads,
            fail_upload,
            fail_delete,
            anonymous,
            as_owner,
            ephemeral,
        } => {
            config.validate()?;
            let guest = if ephemeral {
                GuestId::new()
            } else {
                GuestIdentity::load_or_create(config.engine.data_dir.join(GUEST_FILE))?.id()
            };
            let options = SimulateOptions {
                files,
                size,
                passkey,
                public,
                allow_uploads: !no_uploads,
                fail_upload,
                fail_delete,
                anonymous,
                as_owner,
            };
            let report = simulate(config, guest, options).await?;
            println!(
                "Summary: {} uploaded, {} failed, {} asset(s) and {} folder(s) deleted{}",
                report.uploads_complete,
                report.uploads_failed,
                report.assets_deleted,
                report.folders_deleted,
                if report.delete_rolled_back {
                    ", delete rolled back"
                } else {
                    ""
                }
            );
        }
    }

    Ok(())
}

/// Sets up the tracing subscriber. Returns the guard of the file writer,
/// which must live until exit.
fn init_tracing(config: &Config, verbose: bool) -> anyhow::Result<Option<WorkerGuard>> {
    let level = if verbose {
        "debug".to_string()
    } else {
        config.engine.log_level.to_lowercase()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&level));

    match &config.engine.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "eventvault.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
            Ok(None)
        }
    }
}

struct SimulateOptions {
    files: usize,
    size: usize,
    passkey: String,
    public: bool,
    allow_uploads: bool,
    fail_upload: Option<String>,
    fail_delete: bool,
    anonymous: bool,
    as_owner: bool,
}

/// What a simulated visit ended with.
#[derive(Debug, Default, PartialEq, Eq)]
struct SimulateReport {
    uploads_complete: usize,
    uploads_failed: usize,
    assets_deleted: usize,
    folders_deleted: usize,
    delete_rolled_back: bool,
    final_folders: usize,
    final_files: usize,
    stored_objects: usize,
}

async fn simulate(
    config: Config,
    guest: GuestId,
    options: SimulateOptions,
) -> anyhow::Result<SimulateReport> {
    let mut report = SimulateReport::default();
    let (backends, identity, store, blobs) = Backends::in_memory();

    let owner = UserId::new();
    let code = generate_vault_code();
    let vault = Vault::new(owner, "Simulated event", code.clone())
        .with_passkey(options.passkey.clone())
        .public(options.public)
        .uploads(options.allow_uploads);
    let vault_id = vault.id;
    store.add_vault(vault)?;
    let folder = Folder::new(vault_id, None, "Ceremony");
    let folder_id = folder.id;
    store.seed_folder(folder)?;
    println!("Created vault with code {} and folder Ceremony", code);

    if let Some(name) = &options.fail_upload {
        blobs.fail_upload(name.clone());
    }
    if options.as_owner {
        identity.sign_in(Identity::new(owner));
    } else if !options.anonymous {
        identity.sign_in(Identity::new(UserId::new()));
    }

    let engine = Engine::start(config, backends, guest).await?;
    println!("Visiting as {}", engine.actor());

    let resolved = engine
        .resolve_code(&code.to_lowercase())
        .await
        .found()
        .context("Vault code did not resolve")?;
    anyhow::ensure!(resolved == vault_id, "Vault code resolved to another vault");

    let session = engine.open_vault(vault_id).await?;
    let mut permissions = session.permissions();
    println!("Access on open: {:?}", permissions);

    if !permissions.can_view {
        permissions = session.request_join(&options.passkey).await?;
        println!("Access after join: {:?}", permissions);
    }

    if permissions.can_upload && options.files > 0 {
        let mut files: Vec<UploadFile> = (0..options.files)
            .map(|i| {
                UploadFile::new(format!("photo-{:02}.jpg", i + 1), vec![0u8; options.size])
                    .with_content_type("image/jpeg")
            })
            .collect();
        // The first photo goes into the folder, the rest to the root.
        let rest = files.split_off(1);
        let mut ids = session.enqueue_upload(files, Some(folder_id)).await?;
        if !rest.is_empty() {
            ids.extend(session.enqueue_upload(rest, None).await?);
        }
        engine.uploads().wait_settled(&ids).await;

        println!("Uploads:");
        for id in &ids {
            match engine.uploads().get(*id) {
                Some(task) => match &task.error {
                    Some(error) => {
                        report.uploads_failed += 1;
                        println!("  {} - {} ({})", task.file_name, task.status, error)
                    }
                    None => {
                        report.uploads_complete += 1;
                        println!("  {} - {} {}%", task.file_name, task.status, task.progress)
                    }
                },
                None => {
                    report.uploads_complete += 1;
                    println!("  {} - complete", id)
                }
            }
        }
    } else {
        println!("Uploads are not allowed for this visitor");
    }

    session.reload().await?;
    session.select_all();
    if !permissions.is_admin {
        // Folder deletes are reserved to admins.
        for folder in session.selection().folders() {
            session.toggle_selection(SelectionItem::Folder(folder));
        }
    }
    let selection = session.selection();
    let actions = session.bulk_actions();
    println!(
        "Selected {} item(s), delete: {}, download: {}",
        selection.len(),
        actions.can_delete,
        actions.can_download
    );

    if actions.can_delete && !selection.is_empty() {
        if options.fail_delete {
            if let Some(first) = selection.assets().first() {
                store.fail_asset_delete(*first)?;
            }
        }
        match session
            .delete_items(&selection.assets(), &selection.folders())
            .await
        {
            Ok(outcome) => {
                report.assets_deleted = outcome.assets_deleted;
                report.folders_deleted = outcome.folders_deleted;
                println!(
                    "Deleted {} asset(s) and {} folder(s)",
                    outcome.assets_deleted, outcome.folders_deleted
                )
            }
            Err(e) => {
                report.delete_rolled_back = true;
                println!("Delete rolled back: {}", e)
            }
        }
    }

    let listing = session.listing();
    report.final_folders = listing.folders.len();
    report.final_files = listing.files.len();
    report.stored_objects = blobs.object_count();
    println!(
        "Final view: {} folder(s), {} file(s), {} stored object(s)",
        report.final_folders, report.final_files, report.stored_objects
    );

    session.close().await;
    engine.shutdown();
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn options(args: &[&str]) -> SimulateOptions {
        let cli = Cli::try_parse_from(["eventvault", "simulate"].iter().chain(args)).unwrap();
        match cli.command {
            Commands::Simulate {
                files,
                size,
                passkey,
                public,
                no_uploads,
                fail_upload,
                fail_delete,
                anonymous,
                as_owner,
                ..
            } => SimulateOptions {
                files,
                size,
                passkey,
                public,
                allow_uploads: !no_uploads,
                fail_upload,
                fail_delete,
                anonymous,
                as_owner,
            },
            _ => panic!("Expected Simulate command"),
        }
    }

    #[test]
    fn test_cli_debug_assert() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_anonymous_conflicts_with_owner() {
        let result = Cli::try_parse_from(["eventvault", "simulate", "--anonymous", "--as-owner"]);
        assert!(result.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_simulation_uploads_and_deletes() {
        let report = simulate(Config::default(), GuestId::new(), options(&[]))
            .await
            .unwrap();

        assert_eq!(report.uploads_complete, 3);
        assert_eq!(report.uploads_failed, 0);
        // Only the root photos go; the folder keeps the first one.
        assert_eq!(report.assets_deleted, 2);
        assert_eq!(report.folders_deleted, 0);
        assert!(!report.delete_rolled_back);
        assert_eq!(report.final_folders, 1);
        assert_eq!(report.final_files, 0);
        assert_eq!(report.stored_objects, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_owner_simulation_deletes_folders() {
        let report = simulate(Config::default(), GuestId::new(), options(&["--as-owner"]))
            .await
            .unwrap();

        assert_eq!(report.uploads_complete, 3);
        assert_eq!(report.assets_deleted, 3);
        assert_eq!(report.folders_deleted, 1);
        assert_eq!(report.final_folders, 0);
        assert_eq!(report.stored_objects, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_simulated_failures_surface() {
        let report = simulate(
            Config::default(),
            GuestId::new(),
            options(&["--fail-upload", "photo-03.jpg", "--fail-delete"]),
        )
        .await
        .unwrap();

        assert_eq!(report.uploads_complete, 2);
        assert_eq!(report.uploads_failed, 1);
        assert!(report.delete_rolled_back);
        assert_eq!(report.final_files, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_simulation_without_uploads() {
        let report = simulate(Config::default(), GuestId::new(), options(&["--no-uploads"]))
            .await
            .unwrap();

        assert_eq!(
            report,
            SimulateReport {
                final_folders: 1,
                ..SimulateReport::default()
            }
        );
    }
}
