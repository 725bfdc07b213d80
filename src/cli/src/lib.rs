//! packs-lifecycle CLI - analyze and export phases of a buildpack build.

pub mod commands;
pub mod output;
