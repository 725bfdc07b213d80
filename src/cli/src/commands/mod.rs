//! CLI command definitions and dispatch.

mod analyze;
mod export;
mod version;

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use packs_core::{BuildpackGroup, LifecycleConfig, Result};

/// Packs lifecycle: restore and export buildpack layers.
#[derive(Parser)]
#[command(name = "packs-lifecycle", version, about)]
pub struct Cli {
    /// Lifecycle configuration file (TOML)
    #[arg(long, global = true, env = "PACKS_LIFECYCLE_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Restore cached layers from the previous image into the launch directory
    Analyze(analyze::AnalyzeArgs),
    /// Export the launch directory as layers on top of a stack image
    Export(export::ExportArgs),
    /// Show version information
    Version(version::VersionArgs),
}

/// Options shared by the analyze and export commands.
#[derive(clap::Args, Debug, Clone, Default)]
pub struct LaunchArgs {
    /// Launch directory [default: from config, /launch]
    #[arg(long = "launch")]
    pub launch_dir: Option<PathBuf>,

    /// Buildpack group file [default: from config, ./group.toml]
    #[arg(long = "group")]
    pub group_path: Option<PathBuf>,

    /// Use the local image store instead of a registry
    #[arg(long)]
    pub daemon: bool,

    /// Use stored and environment registry credentials
    #[arg(long)]
    pub helpers: bool,
}

impl LaunchArgs {
    /// Apply command-line overrides on top of the configuration.
    fn apply(&self, mut config: LifecycleConfig) -> LifecycleConfig {
        if let Some(dir) = &self.launch_dir {
            config.launch_dir = dir.clone();
        }
        if let Some(path) = &self.group_path {
            config.group_path = path.clone();
        }
        config
    }
}

/// Load the configuration file, or defaults when none is given.
pub fn load_config(path: Option<&Path>) -> Result<LifecycleConfig> {
    match path {
        Some(path) => LifecycleConfig::from_file(path),
        None => Ok(LifecycleConfig::default()),
    }
}

fn load_group(config: &LifecycleConfig) -> Result<BuildpackGroup> {
    let group = BuildpackGroup::from_file(&config.group_path)?;
    tracing::debug!(
        path = %config.group_path.display(),
        buildpacks = group.len(),
        "Loaded buildpack group"
    );
    Ok(group)
}

/// Dispatch a parsed CLI to the appropriate command handler.
pub async fn dispatch(cli: Cli, config: LifecycleConfig) -> Result<()> {
    match cli.command {
        Command::Analyze(args) => analyze::execute(args, config).await,
        Command::Export(args) => export::execute(args, config).await,
        Command::Version(args) => version::execute(args).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_analyze() {
        let cli = Cli::try_parse_from([
            "packs-lifecycle",
            "analyze",
            "ghcr.io/acme/app",
            "--launch",
            "/workspace/launch",
            "--daemon",
        ])
        .unwrap();
        match cli.command {
            Command::Analyze(args) => {
                assert_eq!(args.repository, "ghcr.io/acme/app");
                assert_eq!(args.launch.launch_dir, Some(PathBuf::from("/workspace/launch")));
                assert!(args.launch.daemon);
                assert!(!args.launch.helpers);
                assert!(!args.metadata_on_stdin);
            }
            _ => panic!("expected analyze"),
        }
    }

    #[test]
    fn test_parse_export_requires_stack() {
        assert!(Cli::try_parse_from(["packs-lifecycle", "export", "app"]).is_err());

        let cli = Cli::try_parse_from([
            "packs-lifecycle",
            "--config",
            "lifecycle.toml",
            "export",
            "app",
            "--stack",
            "stack:run",
            "--workers",
            "4",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("lifecycle.toml")));
        match cli.command {
            Command::Export(args) => {
                assert_eq!(args.stack, "stack:run");
                assert_eq!(args.workers, Some(4));
            }
            _ => panic!("expected export"),
        }
    }

    #[test]
    fn test_launch_args_override_config() {
        let args = LaunchArgs {
            launch_dir: Some(PathBuf::from("/tmp/launch")),
            group_path: None,
            ..Default::default()
        };
        let config = args.apply(LifecycleConfig::default());
        assert_eq!(config.launch_dir, PathBuf::from("/tmp/launch"));
        assert_eq!(config.group_path, PathBuf::from("./group.toml"));
    }

    #[test]
    fn test_load_config() {
        assert!(load_config(None).is_ok());

        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("lifecycle.toml");
        std::fs::write(&path, "workers = 0\n").unwrap();
        let err = load_config(Some(&path)).unwrap_err();
        assert_eq!(err.exit_code(), packs_core::exit_code::INVALID_ENV);
    }
}
