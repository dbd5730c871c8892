use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use cinder_cache::{default_machine_root, default_user_root, CacheLayout, CacheManager};
use cinder_core::{BundleManifest, EvaluationContext, ItemSet, Operation, OperationPolicies};
use cinder_engine::{
    AbortSignal, CompositePerformer, ElevationBridge, EngineConfig, EngineServices,
    NoSourceResolver, PerformerFactory, SourceResolver, SystemCommandRunner, TypeHandlerFactory,
};
use clap::{Parser, Subcommand};
use clap_complete::Shell;

use crate::bridge::ProcessBridge;
use crate::completion::write_completions_script;
use crate::download::start_background_downloads;
use crate::elevated::run_elevated_serve;
use crate::render::{current_output_style, ConsoleLog, ConsoleObserver, PromptSourceResolver};

#[derive(Parser, Debug)]
#[command(name = "cinder")]
#[command(about = "Bundle install orchestration engine", long_about = None)]
pub struct Cli {
    /// Bundle manifest to operate on.
    #[arg(long, default_value = "bundle.toml", global = true)]
    pub manifest: PathBuf,
    /// Override the per-machine cache root.
    #[arg(long, global = true)]
    pub machine_root: Option<PathBuf>,
    /// Override the per-user cache root.
    #[arg(long, global = true)]
    pub user_root: Option<PathBuf>,
    /// Detection variables, as name=value pairs.
    #[arg(long = "variable", value_name = "NAME=VALUE", global = true)]
    pub variables: Vec<String>,
    /// No prompts; missing sources are skipped instead of asked for.
    #[arg(long, global = true)]
    pub unattended: bool,
    /// Disable colored output and progress bars.
    #[arg(long, global = true)]
    pub plain: bool,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Install the bundle.
    Install {
        /// Run per-machine items through an elevated helper process.
        #[arg(long)]
        elevate: bool,
        /// Extra installer options appended after authored ones.
        #[arg(long = "option", value_name = "PROP=VALUE")]
        options: Vec<String>,
    },
    /// Uninstall the bundle.
    Uninstall {
        #[arg(long)]
        elevate: bool,
        #[arg(long = "option", value_name = "PROP=VALUE")]
        options: Vec<String>,
    },
    /// Repair the bundle.
    Repair {
        #[arg(long)]
        elevate: bool,
        #[arg(long = "option", value_name = "PROP=VALUE")]
        options: Vec<String>,
    },
    /// Report each item's cache and availability state.
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Operate on the package cache directly.
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },
    /// Emit a shell completion script.
    Completions { shell: Shell },
    /// Serve the elevated half of the bridge over stdio.
    #[command(hide = true)]
    ElevatedServe,
}

#[derive(Subcommand, Debug)]
pub enum CacheCommands {
    /// Remove this bundle's temporary cache subtree.
    PurgeTemp,
    /// Remove one item's cached payload.
    Delete { item_id: String },
}

#[derive(Debug)]
pub(crate) struct Session {
    manifest: BundleManifest,
    items: ItemSet,
    cache: CacheManager,
    config: EngineConfig,
    ctx: EvaluationContext,
    policies: OperationPolicies,
}

pub fn run_cli(cli: Cli) -> Result<()> {
    let style = current_output_style(cli.plain);

    match &cli.command {
        Commands::Completions { shell } => {
            return write_completions_script(*shell, &mut std::io::stdout());
        }
        _ => {}
    }

    let session = open_session(&cli)?;

    match &cli.command {
        Commands::Install { elevate, options } => run_operation(
            &cli,
            session,
            Operation::Installing,
            *elevate,
            options.clone(),
            style,
        ),
        Commands::Uninstall { elevate, options } => run_operation(
            &cli,
            session,
            Operation::Uninstalling,
            *elevate,
            options.clone(),
            style,
        ),
        Commands::Repair { elevate, options } => run_operation(
            &cli,
            session,
            Operation::Repairing,
            *elevate,
            options.clone(),
            style,
        ),
        Commands::Status { json } => {
            for line in status_lines(&session, *json)? {
                println!("{line}");
            }
            Ok(())
        }
        Commands::Cache { command } => match command {
            CacheCommands::PurgeTemp => session
                .cache
                .delete_temporary_cache_directories(None)
                .context("failed to purge the temporary cache"),
            CacheCommands::Delete { item_id } => {
                let index = item_index(&session.items, item_id)?;
                session
                    .cache
                    .delete_cached_package(index, None)
                    .with_context(|| format!("failed to delete cache entry for '{item_id}'"))
            }
        },
        Commands::ElevatedServe => run_elevated_serve(session.items, session.cache, session.config),
        Commands::Completions { .. } => unreachable!("handled above"),
    }
}

fn open_session(cli: &Cli) -> Result<Session> {
    let raw = std::fs::read_to_string(&cli.manifest)
        .with_context(|| format!("failed to read bundle manifest: {}", cli.manifest.display()))?;
    let manifest = BundleManifest::from_toml_str(&raw)
        .with_context(|| format!("failed to load bundle manifest: {}", cli.manifest.display()))?;

    let items = ItemSet::new(manifest.into_items()?);

    let machine_root = match &cli.machine_root {
        Some(root) => root.clone(),
        None => default_machine_root()?,
    };
    let user_root = match &cli.user_root {
        Some(root) => root.clone(),
        None => default_user_root()?,
    };
    let layout = CacheLayout::new(machine_root, user_root, manifest.id.clone());
    let cache = CacheManager::new(layout, items.clone());

    let ctx = EvaluationContext::from_pairs(&cli.variables)?;

    let config = EngineConfig {
        interactive: !cli.unattended,
        lock_path: std::env::temp_dir().join("cinder-install.lock"),
        ..EngineConfig::default()
    };

    Ok(Session {
        policies: manifest.policies,
        manifest,
        items,
        cache,
        config,
        ctx,
    })
}

fn run_operation(
    cli: &Cli,
    session: Session,
    operation: Operation,
    elevate: bool,
    options: Vec<String>,
    style: crate::render::OutputStyle,
) -> Result<()> {
    let Session {
        manifest,
        items,
        cache,
        mut config,
        ctx,
        policies,
    } = session;
    config.command_line_options = options;

    let abort = AbortSignal::new();
    let runner = Arc::new(SystemCommandRunner);
    let factory: Arc<dyn PerformerFactory> = Arc::new(TypeHandlerFactory::new(
        runner,
        config.clone(),
        abort.clone(),
        ctx.clone(),
        items.clone(),
    ));

    let downloader = if operation == Operation::Installing || operation == Operation::Repairing {
        start_background_downloads(items.clone(), cache.layout().clone())
    } else {
        None
    };

    let needs_bridge = elevate && items.lock().iter().any(|item| item.per_machine);
    let mut bridge = if needs_bridge {
        Some(ProcessBridge::spawn(
            &cli.manifest,
            cli.machine_root.as_deref(),
            cli.user_root.as_deref(),
            ctx.variables()
                .map(|(name, value)| (name.to_string(), value.to_string()))
                .collect(),
            style,
            abort.clone(),
        )?)
    } else {
        None
    };

    let mut orchestrator = CompositePerformer::new(
        items,
        cache,
        config,
        ctx,
        policies,
        abort,
        factory,
        operation,
    );

    let mut log = ConsoleLog::new(style);
    let mut prompt_resolver = PromptSourceResolver;
    let mut skip_resolver = NoSourceResolver;
    let source_resolver: &mut dyn SourceResolver = if cli.unattended {
        &mut skip_resolver
    } else {
        &mut prompt_resolver
    };

    let mut observer = ConsoleObserver::new(style, operation.as_str());
    let code = {
        let mut services = EngineServices {
            source_resolver,
            bridge: bridge
                .as_mut()
                .map(|bridge| bridge as &mut dyn ElevationBridge),
            log: &mut log,
            reboot_pending: false,
        };
        orchestrator.perform(&mut observer, &mut services)
    };

    if let Some(bridge) = bridge {
        bridge.shutdown()?;
    }
    if let Some(handle) = downloader {
        let _ = handle.join();
    }

    if code.is_success() {
        Ok(())
    } else {
        Err(anyhow!(
            "{} of bundle '{}' failed with code {}",
            operation.as_str(),
            manifest.id,
            code
        ))
    }
}

fn item_index(items: &ItemSet, item_id: &str) -> Result<usize> {
    items
        .lock()
        .iter()
        .position(|item| item.id == item_id)
        .ok_or_else(|| anyhow!("no item '{item_id}' in this bundle"))
}

fn status_lines(session: &Session, json: bool) -> Result<Vec<String>> {
    let mut lines = Vec::new();
    let count = session.items.len();

    if json {
        let mut entries = Vec::new();
        for index in 0..count {
            let cached = session.cache.is_cached(index, None)?;
            let Some(item) = session.items.item(index) else {
                continue;
            };
            entries.push(serde_json::json!({
                "id": item.id,
                "kind": item.kind.as_str(),
                "version": item.version.to_string(),
                "state": item.state.as_str(),
                "per_machine": item.per_machine,
                "cached": cached,
            }));
        }
        let document = serde_json::json!({
            "bundle": session.manifest.id,
            "version": session.manifest.version.to_string(),
            "items": entries,
        });
        lines.push(serde_json::to_string_pretty(&document)?);
        return Ok(lines);
    }

    lines.push(format!(
        "bundle {} {}",
        session.manifest.id, session.manifest.version
    ));
    for index in 0..count {
        let cached = session.cache.is_cached(index, None)?;
        let Some(item) = session.items.item(index) else {
            continue;
        };
        lines.push(format!(
            "  {:<24} {:<16} {:<20} {}",
            item.id,
            item.kind.as_str(),
            item.state.as_str(),
            if cached { "cached" } else { "not cached" }
        ));
    }
    Ok(lines)
}

#[cfg(test)]
pub(crate) mod tests_support {
    use std::path::Path;

    use super::*;

    pub(crate) fn open_test_session(manifest_path: &Path, base: &Path) -> Result<Session> {
        let args = vec![
            "cinder".to_string(),
            "--manifest".to_string(),
            manifest_path.display().to_string(),
            "--machine-root".to_string(),
            base.join("machine").display().to_string(),
            "--user-root".to_string(),
            base.join("user").display().to_string(),
            "status".to_string(),
        ];
        let cli = Cli::parse_from(args);
        open_session(&cli)
    }

    pub(crate) fn session_status_lines(session: &Session, json: bool) -> Result<Vec<String>> {
        status_lines(session, json)
    }

    pub(crate) fn session_items(session: &Session) -> &ItemSet {
        &session.items
    }

    pub(crate) fn session_manifest(session: &Session) -> &BundleManifest {
        &session.manifest
    }
}
