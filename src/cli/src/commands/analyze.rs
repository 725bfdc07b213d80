//! `packs-lifecycle analyze` command.

use std::io::Read;

use clap::Args;
use packs_core::{BuildMetadata, LifecycleConfig, LifecycleError, Result};
use packs_lifecycle::{source_for, Analyzer, MetadataSource};

use super::LaunchArgs;
use crate::output;

#[derive(Args)]
pub struct AnalyzeArgs {
    /// Image repository the previous build was exported to
    pub repository: String,

    #[command(flatten)]
    pub launch: LaunchArgs,

    /// Read build metadata JSON from stdin instead of the previous image
    #[arg(long)]
    pub metadata_on_stdin: bool,
}

pub async fn execute(args: AnalyzeArgs, config: LifecycleConfig) -> Result<()> {
    let config = args.launch.apply(config);
    config.validate()?;
    let group = super::load_group(&config)?;
    let analyzer = Analyzer::from_config(group, &config);

    let outcome = if args.metadata_on_stdin {
        let document = read_metadata(std::io::stdin().lock())?;
        analyzer.analyze(MetadataSource::from_parts(None, Some(document))?)?
    } else {
        let source = source_for(
            &args.repository,
            args.launch.daemon,
            args.launch.helpers,
            &config,
        )?;
        analyzer.analyze_source(source.as_ref()).await?
    };

    println!("{}", output::describe_outcome(&outcome));
    Ok(())
}

/// Read a metadata document. Unlike an image label, a document the caller
/// hands over must parse.
fn read_metadata(mut reader: impl Read) -> Result<BuildMetadata> {
    let mut content = String::new();
    reader
        .read_to_string(&mut content)
        .map_err(|e| LifecycleError::io("Failed to read metadata from stdin", e))?;
    BuildMetadata::from_json(content.trim())
}
