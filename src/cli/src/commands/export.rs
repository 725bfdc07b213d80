//! `packs-lifecycle export` command.

use clap::Args;
use packs_core::{LifecycleConfig, Result};
use packs_lifecycle::{source_for, Exporter};

use super::LaunchArgs;
use crate::output;

#[derive(Args)]
pub struct ExportArgs {
    /// Image repository to export to
    pub repository: String,

    /// Stack (run) image the layers are added to
    #[arg(long)]
    pub stack: String,

    #[command(flatten)]
    pub launch: LaunchArgs,

    /// Maximum number of layers built concurrently [default: from config]
    #[arg(long)]
    pub workers: Option<usize>,
}

pub async fn execute(args: ExportArgs, config: LifecycleConfig) -> Result<()> {
    let mut config = args.launch.apply(config);
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    config.validate()?;
    let group = super::load_group(&config)?;

    let daemon = args.launch.daemon;
    let helpers = args.launch.helpers;
    let stack = source_for(&args.stack, daemon, helpers, &config)?
        .image()
        .await?;

    let target = source_for(&args.repository, daemon, helpers, &config)?;
    let previous = match target.image().await {
        Ok(image) => Some(image),
        Err(e) if e.is_skippable() => {
            tracing::warn!(image = %target.describe(), error = %e, "No previous image, layers cannot be reused");
            None
        }
        Err(e) => return Err(e),
    };

    let image = Exporter::from_config(group, &config)
        .export(&stack, previous.as_ref())
        .await?;
    let id = target.save(&image).await?;

    println!(
        "Exported {} ({})",
        target.describe(),
        output::describe_image(&image)
    );
    println!("{}", id);
    Ok(())
}
