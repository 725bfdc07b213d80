//! `packs-lifecycle version` command.

use clap::Args;
use packs_core::Result;

#[derive(Args)]
pub struct VersionArgs;

pub async fn execute(_args: VersionArgs) -> Result<()> {
    println!("packs-lifecycle version {}", packs_lifecycle::VERSION);
    Ok(())
}
