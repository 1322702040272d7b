//! `forge component` - manage cluster add-ons independently of the cluster
//!
//! Components are taken from the configuration in declared order. Naming
//! components restricts the command to those.

use std::path::{Path, PathBuf};

use clap::{Args, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{prompter, ConfigArgs};
use crate::component::{load_components, Component};
use crate::orchestrator::apply_components;
use crate::platform;
use crate::{Error, Result};

/// Manage configured components
#[derive(Args, Debug)]
pub struct ComponentArgs {
    #[command(subcommand)]
    pub command: ComponentCommand,
}

#[derive(Subcommand, Debug)]
pub enum ComponentCommand {
    /// Install or upgrade components on the running cluster
    Apply(ApplyArgs),
    /// Uninstall components from the running cluster
    Delete(DeleteArgs),
    /// Render component manifests without touching the cluster
    RenderManifest(RenderArgs),
}

/// Components to act on and where the cluster is
#[derive(Args, Debug)]
pub struct TargetArgs {
    #[command(flatten)]
    pub config: ConfigArgs,

    /// Kubeconfig to use instead of the one in the asset directory
    #[arg(short, long, env = "FORGE_KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// Component names; every configured component when empty
    pub names: Vec<String>,
}

#[derive(Args, Debug)]
pub struct ApplyArgs {
    #[command(flatten)]
    pub target: TargetArgs,
}

#[derive(Args, Debug)]
pub struct DeleteArgs {
    #[command(flatten)]
    pub target: TargetArgs,

    /// Delete each component's namespace after its release
    #[arg(long)]
    pub delete_namespace: bool,

    /// Delete without asking
    #[arg(short = 'y', long)]
    pub confirm: bool,
}

#[derive(Args, Debug)]
pub struct RenderArgs {
    #[command(flatten)]
    pub target: TargetArgs,

    /// Write one file per manifest under this directory instead of stdout
    #[arg(short, long)]
    pub output_dir: Option<PathBuf>,
}

pub async fn run(args: ComponentArgs, cancel: CancellationToken) -> Result<()> {
    match args.command {
        ComponentCommand::Apply(args) => apply(args, cancel).await,
        ComponentCommand::Delete(args) => delete(args, cancel).await,
        ComponentCommand::RenderManifest(args) => render(args, cancel).await,
    }
}

/// Loaded components plus the kubeconfig they target
struct Selection {
    components: Vec<Box<dyn Component>>,
    kubeconfig: PathBuf,
}

impl TargetArgs {
    fn select(&self, cancel: &CancellationToken) -> Result<Selection> {
        let config = self.config.load()?;
        let selected = config.select_components(&self.names)?;
        let components = load_components(&selected, cancel)?;
        let kubeconfig = match &self.kubeconfig {
            Some(path) => path.clone(),
            None => platform::load_config(&config, prompter(false))?
                .meta()
                .kubeconfig(),
        };
        Ok(Selection {
            components,
            kubeconfig,
        })
    }
}

async fn apply(args: ApplyArgs, cancel: CancellationToken) -> Result<()> {
    let selection = args.target.select(&cancel)?;
    println!("Applying {} component(s)...\n", selection.components.len());
    apply_components(&selection.components, &selection.kubeconfig).await?;
    println!("\nComponents applied.");
    Ok(())
}

/// Uninstalls in reverse order so later components never outlive the ones
/// they were installed on top of
async fn delete(args: DeleteArgs, cancel: CancellationToken) -> Result<()> {
    let selection = args.target.select(&cancel)?;
    let names: Vec<String> = selection
        .components
        .iter()
        .map(|c| c.metadata().release.name)
        .collect();

    let question = format!("This uninstalls: {}.", names.join(", "));
    if !prompter(args.confirm).confirm(&question).await? {
        println!("\nAborted.");
        return Ok(());
    }

    for component in selection.components.iter().rev() {
        let name = component.metadata().release.name;
        println!("  Deleting {}...", name);
        component
            .uninstall(&selection.kubeconfig, args.delete_namespace)
            .await
            .map_err(|e| Error::in_release(name, e))?;
    }
    info!(components = names.len(), "components deleted");
    Ok(())
}

async fn render(args: RenderArgs, cancel: CancellationToken) -> Result<()> {
    let selection = args.target.select(&cancel)?;
    for component in &selection.components {
        let name = component.metadata().release.name;
        let manifests = component.render_manifests().await?;
        match &args.output_dir {
            Some(dir) => {
                let written = write_manifests(&dir.join(&name), &manifests)?;
                println!("{}: {} manifest(s) written to {}", name, written, dir.join(&name).display());
            }
            None => {
                for (file, content) in &manifests {
                    println!("---\n# Source: {}\n{}", file, content.trim_end());
                }
            }
        }
    }
    Ok(())
}

/// Write each manifest under `dir`, keeping the chart-relative path
fn write_manifests(
    dir: &Path,
    manifests: &std::collections::BTreeMap<String, String>,
) -> Result<usize> {
    for (file, content) in manifests {
        let relative = Path::new(file);
        if relative.is_absolute()
            || relative
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(Error::validation(format!("refusing to write manifest outside {}: {}", dir.display(), file)));
        }
        let path = dir.join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, content)?;
    }
    Ok(manifests.len())
}
