use crate::tracing::{LogLevel, TracingFormat};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "kubetools")]
#[command(about = "Keep CI toolchain images in step with upstream Kubernetes releases")]
#[command(long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    #[arg(long, help = "Build one toolchain image per matched Kubernetes release")]
    pub containers: bool,

    #[arg(long, help = "Build the standalone tool images")]
    pub setup: bool,

    #[arg(long, help = "Run semantic-release for the repository")]
    pub release: bool,

    #[arg(long, help = "Run every pipeline")]
    pub all: bool,

    #[arg(
        short = 'c',
        long,
        global = true,
        env = "KUBETOOLS_CONFIG",
        help = "Path to a TOML configuration file"
    )]
    pub config: Option<PathBuf>,

    #[arg(
        short = 'l',
        long,
        global = true,
        help = "Set logging level",
        default_value = "info",
        value_enum
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-format",
        global = true,
        help = "Log output format",
        default_value = "pretty",
        value_enum
    )]
    pub log_format: TracingFormat,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    #[command(about = "Pack files matching a glob into a .zip or .tar.gz archive")]
    Archive {
        #[arg(help = "Glob selecting the files and directories to pack")]
        pattern: String,
        #[arg(help = "Archive to write; the extension selects the format")]
        destination: PathBuf,
    },
}

/// Pipelines chosen on the command line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Selection {
    pub containers: bool,
    pub setup: bool,
    pub release: bool,
}

impl Selection {
    pub fn is_empty(self) -> bool {
        !(self.containers || self.setup || self.release)
    }
}

impl Cli {
    pub fn selection(&self) -> Selection {
        Selection {
            containers: self.containers || self.all,
            setup: self.setup || self.all,
            release: self.release || self.all,
        }
    }
}

pub fn parse() -> Cli {
    Cli::parse()
}
