use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand};
use funcpack_domain::Platform;

pub const FUNCPACK_BEFORE_HELP: &str = concat!(
    "funcpack ",
    env!("CARGO_PKG_VERSION"),
    " – Daemonless function image builder\n\n",
    "  build            Build a multi-platform OCI image layout for the function.\n",
    "  last             Print the image layout of the last successful build.\n",
    "  clean            Drop stale build directories and orphaned build claims.\n",
    "  cache prune      Shrink the base layer cache to a size limit.\n",
);

#[derive(Parser, Debug)]
#[command(
    name = "funcpack",
    author,
    version,
    disable_help_subcommand = true,
    before_help = FUNCPACK_BEFORE_HELP
)]
#[allow(clippy::struct_excessive_bools)]
pub struct FuncpackCli {
    #[arg(
        short,
        long,
        help = "Suppress human output (errors still print to stderr)",
        global = true
    )]
    pub quiet: bool,
    #[arg(short, long, action = ArgAction::Count, help = "Increase logging (-vv reaches trace)", global = true)]
    pub verbose: u8,
    #[arg(long, help = "Force trace logging regardless of -v/-q", global = true)]
    pub trace: bool,
    #[arg(
        long,
        help = "Emit {status,message,details} JSON envelopes",
        global = true
    )]
    pub json: bool,
    #[arg(long, help = "Disable colored human output", global = true)]
    pub no_color: bool,
    #[command(subcommand)]
    pub command: CommandCli,
}

#[derive(Subcommand, Debug)]
pub enum CommandCli {
    #[command(
        about = "Build the function's image layout under .func/builds.",
        override_usage = "funcpack build [--path DIR] [--platform OS/ARCH[/VARIANT]]..."
    )]
    Build(BuildArgs),
    #[command(about = "Print the oci directory of the last successful build.")]
    Last(PathArgs),
    #[command(about = "Remove stale builds and orphaned build claims.")]
    Clean(PathArgs),
    #[command(subcommand, about = "Inspect or shrink the base layer cache.")]
    Cache(CacheCommand),
}

#[derive(Subcommand, Debug)]
pub enum CacheCommand {
    #[command(about = "Evict least recently used base layers down to a size limit.")]
    Prune(PruneArgs),
}

#[derive(Args, Debug, Clone)]
pub struct PathArgs {
    #[arg(
        short,
        long,
        default_value = ".",
        help = "Function root (the directory holding func.yaml)"
    )]
    pub path: PathBuf,
}

#[derive(Args, Debug, Clone)]
pub struct BuildArgs {
    #[command(flatten)]
    pub common: PathArgs,
    #[arg(
        long = "platform",
        value_name = "OS/ARCH[/VARIANT]",
        help = "Target platform; repeat for more (defaults to linux/amd64, linux/arm64, linux/arm/v7)"
    )]
    pub platforms: Vec<Platform>,
    #[arg(long, value_name = "SECS", help = "Cancel the build after this many seconds")]
    pub timeout: Option<u64>,
}

#[derive(Args, Debug, Clone)]
pub struct PruneArgs {
    #[command(flatten)]
    pub common: PathArgs,
    #[arg(
        long,
        value_name = "BYTES",
        help = "Size limit (defaults to FUNCPACK_BLOB_CACHE_MAX_BYTES)"
    )]
    pub max_bytes: Option<u64>,
}
