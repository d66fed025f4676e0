mod cmd;
mod output;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use cmd::{cmd_diff, cmd_lambda_validate, cmd_manifests, cmd_run, cmd_tool_ensure};
use output::OutputFormat;

const DEFAULT_TOOLS_DIR: &str = ".piped/tools";

#[derive(Parser)]
#[command(name = "piped")]
#[command(author, version, about = "GitOps deployment agent for Kubernetes and AWS Lambda", long_about = None)]
struct Cli {
  /// Enable verbose output
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Run the agent: live state, drift detection and reporting
  Run {
    /// Path to the piped configuration file
    #[arg(short, long, default_value = "piped.yaml")]
    config: PathBuf,
  },

  /// Diff two manifest files or directories
  Diff {
    /// Old manifests
    old: PathBuf,
    /// New manifests
    new: PathBuf,
    /// Hide the data of Secrets
    #[arg(long)]
    mask_secret: bool,
    /// Hide the data of ConfigMaps
    #[arg(long)]
    mask_config_map: bool,
    /// Render changes with the system diff command
    #[arg(long)]
    use_diff_command: bool,
    #[arg(short, long, value_enum, default_value_t)]
    output: OutputFormat,
  },

  /// Load and print the manifests of a Kubernetes application
  Manifests {
    /// Application directory containing the application config
    app_dir: PathBuf,
    /// Application config file name
    #[arg(long, default_value = "app.pipecd.yaml")]
    config_filename: String,
    /// Root of the repository holding the application
    #[arg(long)]
    repo_dir: Option<PathBuf>,
    /// Where kustomize and helm are installed
    #[arg(long, default_value = DEFAULT_TOOLS_DIR)]
    tools_dir: PathBuf,
    #[arg(short, long, value_enum, default_value_t)]
    output: OutputFormat,
  },

  /// Manage external tools
  #[command(subcommand)]
  Tool(ToolCommands),

  /// AWS Lambda utilities
  #[command(subcommand)]
  Lambda(LambdaCommands),
}

#[derive(Subcommand)]
enum ToolCommands {
  /// Install a tool when missing and print its path
  Ensure {
    /// kubectl, kustomize or helm
    name: String,
    /// Version to install; the default version when omitted
    version: Option<String>,
    #[arg(long, default_value = DEFAULT_TOOLS_DIR)]
    tools_dir: PathBuf,
  },
}

#[derive(Subcommand)]
enum LambdaCommands {
  /// Validate a function manifest and print its artifact versions
  Validate {
    /// Path to the function manifest
    file: PathBuf,
    #[arg(short, long, value_enum, default_value_t)]
    output: OutputFormat,
  },
}

fn main() -> Result<()> {
  let cli = Cli::parse();

  let default_level = if cli.verbose { "debug" } else { "info" };
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(std::io::stderr)
    .without_time()
    .init();

  match cli.command {
    Commands::Run { config } => cmd_run(&config),
    Commands::Diff {
      old,
      new,
      mask_secret,
      mask_config_map,
      use_diff_command,
      output,
    } => cmd_diff(
      &old,
      &new,
      cmd::DiffFlags {
        mask_secret,
        mask_config_map,
        use_diff_command,
      },
      output,
    ),
    Commands::Manifests {
      app_dir,
      config_filename,
      repo_dir,
      tools_dir,
      output,
    } => cmd_manifests(&app_dir, &config_filename, repo_dir.as_deref(), &tools_dir, output),
    Commands::Tool(ToolCommands::Ensure {
      name,
      version,
      tools_dir,
    }) => cmd_tool_ensure(&name, version.as_deref().unwrap_or_default(), &tools_dir),
    Commands::Lambda(LambdaCommands::Validate { file, output }) => cmd_lambda_validate(&file, output),
  }
}
