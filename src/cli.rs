//! CLI command definitions using clap.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};

/// labsync - declarative cloud lab provisioning
#[derive(Parser, Debug)]
#[command(name = "labsync")]
#[command(version)]
#[command(about = "Reconcile cloud lab projects, environments, networks, VMs and tunnels")]
#[command(
    long_about = "labsync reads a TOML manifest of lab resources and drives the provisioning API until every resource matches it. Ids and observed state are kept in a local state file between runs."
)]
pub struct Cli {
    /// Provider configuration file (TOML)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// State file recording ids and observed state
    #[arg(short, long, global = true, default_value = "labsync.state.json")]
    pub state: PathBuf,

    /// Run against an in-memory simulation instead of the remote API
    #[arg(long, global = true, default_value_t = false)]
    pub simulate: bool,

    /// Enable debug logging
    #[arg(short, long, global = true, default_value_t = false)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create or update every resource in the manifest, in declaration order
    Apply {
        /// Manifest file path
        manifest: PathBuf,
    },

    /// Re-read every resource in the manifest without changing it
    Refresh {
        /// Manifest file path
        manifest: PathBuf,
    },

    /// Delete every resource in the manifest, in reverse declaration order
    Destroy {
        /// Manifest file path
        manifest: PathBuf,
    },

    /// Print recorded state for the resources in the manifest
    Show {
        /// Manifest file path
        manifest: PathBuf,

        /// Print full records as JSON
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Look up an existing project by exact name without managing it
    FindProject {
        /// Project name
        name: String,
    },
}

impl Commands {
    /// Manifest the command works from; lookups take none.
    #[must_use]
    pub fn manifest(&self) -> Option<&Path> {
        match self {
            Self::Apply { manifest }
            | Self::Refresh { manifest }
            | Self::Destroy { manifest }
            | Self::Show { manifest, .. } => Some(manifest),
            Self::FindProject { .. } => None,
        }
    }
}
