//! # Porter CLI Module
//!
//! This module implements the command line interface for Porter.
//!
//! ## Available Commands
//!
//! - `build` - Validate the manifest and write the bundle descriptor
//! - `install`, `upgrade`, `uninstall`, `invoke` - Run a bundle action
//! - `lint` - Check the manifest with every mixin that lints
//! - `schema` - Print the manifest schema contributed by the installed mixins
//! - `version` - Print the version, optionally with system details
//! - `installations` - Inspect and delete installation records
//! - `credentials`, `parameters` - Manage credential and parameter sets
//! - `mixins` - List installed mixins

mod commands;

use clap::{Args, Parser, Subcommand};
use porter_core::{ConfigOverrides, OutputFormat, PorterError};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

pub use commands::*;

// =============================================================================
// CLI STRUCTURE
// =============================================================================

/// Porter - build, publish and run CNAB bundles
#[derive(Parser, Debug)]
#[command(name = "porter")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Enable debug logging and mixin debug output
    #[arg(long, global = true)]
    pub debug: bool,

    /// Output format: plaintext or json
    #[arg(short, long, global = true, value_parser = parse_output)]
    pub output: Option<OutputFormat>,

    /// Namespace of the installation and its sets
    #[arg(short, long, global = true)]
    pub namespace: Option<String>,

    /// Porter home directory (defaults to $PORTER_HOME, then ~/.porter)
    #[arg(long, global = true)]
    pub home: Option<PathBuf>,

    /// Enable an experimental feature, e.g. dependencies-v2
    #[arg(long, global = true, value_delimiter = ',')]
    pub experimental: Vec<String>,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Configuration values given explicitly on the command line.
    pub fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            home: self.home.clone(),
            namespace: self.namespace.clone(),
            debug: self.debug.then_some(true),
            output: self.output,
            experimental: (!self.experimental.is_empty()).then(|| self.experimental.clone()),
        }
    }
}

fn parse_output(s: &str) -> Result<OutputFormat, String> {
    s.parse().map_err(|e: PorterError| e.to_string())
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Build the bundle descriptor and Dockerfile from the manifest
    Build {
        /// Path to the porter manifest
        #[arg(short, long, default_value = porter_core::manifest::MANIFEST_FILE)]
        file: PathBuf,
    },

    /// Install a new installation of a bundle
    Install(ActionArgs),

    /// Upgrade an installation
    Upgrade(ActionArgs),

    /// Uninstall an installation
    Uninstall {
        #[command(flatten)]
        args: ActionArgs,

        /// Remove the installation records after a successful uninstall
        #[arg(long)]
        delete: bool,
    },

    /// Invoke a custom action on an installation
    Invoke {
        #[command(flatten)]
        args: ActionArgs,

        /// Custom action to invoke
        #[arg(long)]
        action: String,
    },

    /// Lint the manifest
    Lint {
        /// Path to the porter manifest
        #[arg(short, long, default_value = porter_core::manifest::MANIFEST_FILE)]
        file: PathBuf,
    },

    /// Print the manifest schema, including the installed mixins' step schemas
    Schema,

    /// Print the client version
    Version {
        /// Include system details and installed mixins
        #[arg(long)]
        system: bool,
    },

    /// Installation commands
    #[command(subcommand)]
    Installations(InstallationCommands),

    /// Credential set commands
    #[command(subcommand)]
    Credentials(SetCommands),

    /// Parameter set commands
    #[command(subcommand)]
    Parameters(SetCommands),

    /// Mixin commands
    #[command(subcommand)]
    Mixins(MixinCommands),
}

/// Flags shared by every bundle action.
#[derive(Args, Debug, Clone, Default)]
pub struct ActionArgs {
    /// Installation name (defaults to the bundle name)
    pub installation: Option<String>,

    /// Path to the porter manifest
    #[arg(short, long)]
    pub file: Option<PathBuf>,

    /// Published bundle to use instead of a manifest
    #[arg(short, long)]
    pub reference: Option<String>,

    /// Parameter override NAME=VALUE, or DEPENDENCY#NAME=VALUE
    #[arg(long = "param")]
    pub params: Vec<String>,

    /// Parameter set to apply
    #[arg(short = 'p', long = "parameter-set")]
    pub parameter_sets: Vec<String>,

    /// Credential set to apply
    #[arg(short = 'c', long = "cred")]
    pub credential_sets: Vec<String>,

    /// Label KEY=VALUE to add to the installation
    #[arg(short, long = "label")]
    pub labels: Vec<String>,

    /// Re-pull the bundle and repeat an install that already succeeded
    #[arg(long)]
    pub force: bool,
}

#[derive(Subcommand, Debug)]
pub enum InstallationCommands {
    /// List installations
    List {
        /// List installations in every namespace
        #[arg(long)]
        all_namespaces: bool,

        /// Only installations with this label KEY=VALUE
        #[arg(short, long = "label")]
        labels: Vec<String>,
    },

    /// Show an installation
    Show { name: String },

    /// Show the outputs of the last run of an installation
    Outputs { name: String },

    /// Show the logs of the last run of an installation
    Logs { name: String },

    /// Delete an installation and its history
    Delete { name: String },
}

#[derive(Subcommand, Debug)]
pub enum SetCommands {
    /// Create or update a set from a JSON or YAML file
    Apply { file: PathBuf },

    /// List sets
    List,

    /// Show a set
    Show { name: String },

    /// Delete a set
    Delete { name: String },
}

#[derive(Subcommand, Debug)]
pub enum MixinCommands {
    /// List installed mixins
    List,
}

// =============================================================================
// COMMAND EXECUTION
// =============================================================================

/// Execute the CLI with parsed arguments.
pub async fn execute(cli: Cli, cancel: CancellationToken) -> porter_core::Result<()> {
    let app = App::load(&cli.overrides())?;

    match cli.command {
        Commands::Build { file } => cmd_build(&app, &cancel, &file).await,
        Commands::Install(args) => cmd_action(&app, &cancel, "install", &args, false).await,
        Commands::Upgrade(args) => cmd_action(&app, &cancel, "upgrade", &args, false).await,
        Commands::Uninstall { args, delete } => {
            cmd_action(&app, &cancel, "uninstall", &args, delete).await
        }
        Commands::Invoke { args, action } => {
            cmd_action(&app, &cancel, &action, &args, false).await
        }
        Commands::Lint { file } => cmd_lint(&app, &cancel, &file).await,
        Commands::Schema => cmd_schema(&app, &cancel).await,
        Commands::Version { system } => cmd_version(&app, &cancel, system).await,
        Commands::Installations(command) => cmd_installations(&app, command),
        Commands::Credentials(command) => cmd_sets(&app, porter_core::SetKind::Credentials, command),
        Commands::Parameters(command) => cmd_sets(&app, porter_core::SetKind::Parameters, command),
        Commands::Mixins(MixinCommands::List) => cmd_mixins_list(&app),
    }
}

/// Process exit code for an error: 2 when interrupted, 1 otherwise.
pub fn exit_code(err: &PorterError) -> i32 {
    if err.is_canceled() { 2 } else { 1 }
}
