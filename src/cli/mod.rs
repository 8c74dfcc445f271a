// Credstore — CLI Module
//
// Command-line interface using clap derive macros.
// Subcommands: keys, set, get, find, paths, delete, ca-dependents, rotate.

mod commands;

use std::path::PathBuf;

use clap::{ArgGroup, Parser, Subcommand, ValueEnum};

pub use commands::execute;

/// Credstore — encrypted, versioned credential storage.
#[derive(Parser, Debug)]
#[command(name = "credstore")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to the JSON configuration file.
    #[arg(long, global = true, env = "CREDSTORE_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show how configured keys map onto stored canaries, and key usage.
    Keys {
        /// Print a fresh random key for the `internal` provider and exit.
        #[arg(long)]
        generate: bool,
    },

    /// Write a new version of a credential.
    Set {
        /// Credential name, e.g. "/deploy/db-password".
        name: String,

        #[arg(long = "type", value_enum, default_value = "value")]
        kind: SetKind,

        /// The value to store. Prefer CREDSTORE_VALUE to keep it out of shell history.
        #[arg(long, env = "CREDSTORE_VALUE", hide_env_values = true)]
        value: String,

        /// Keep the existing version if the name already has one.
        #[arg(long)]
        no_overwrite: bool,
    },

    /// Print the latest version of a credential, or the newest `n`.
    Get {
        name: String,

        #[arg(long)]
        versions: Option<i64>,
    },

    /// Find credentials by path prefix or by name fragment.
    #[command(group(ArgGroup::new("query").required(true).args(["path", "name_like"])))]
    Find {
        #[arg(long)]
        path: Option<String>,

        #[arg(long)]
        name_like: Option<String>,
    },

    /// List every directory implied by stored names.
    Paths,

    /// Delete a credential and all of its versions.
    Delete { name: String },

    /// List certificates signed by the named CA.
    CaDependents { ca_name: String },

    /// Re-encrypt data under inactive keys with the active key.
    Rotate,
}

/// Credential types writable from the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SetKind {
    Value,
    Password,
    Json,
}

// ─── Tests ───────────────────────────────────────────────────────────────────
