use clap::Parser;
use std::path::PathBuf;

/// Inspect the grammars bound to an XML document
#[derive(Parser, Debug, Clone)]
#[command(name = "xml-content-model")]
#[command(about = "Resolve the DTD, XML Schema or RelaxNG grammars of an XML document and show its content model")]
#[command(version)]
pub struct Cli {
    /// XML document to inspect
    #[arg(help = "XML file to inspect")]
    pub file: PathBuf,

    /// Configuration file (TOML or JSON)
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// XML catalog files, consulted in order
    #[arg(long = "catalog", action = clap::ArgAction::Append)]
    pub catalogs: Vec<String>,

    /// Cache directory for remote grammars
    #[arg(long = "cache-dir")]
    pub cache_dir: Option<PathBuf>,

    /// Do not cache remote grammars on disk
    #[arg(long = "no-cache")]
    pub no_cache: bool,

    /// Never download remote grammars
    #[arg(long = "offline")]
    pub offline: bool,

    /// How long to wait for a remote grammar download, in milliseconds
    #[arg(long = "wait-ms")]
    pub wait_ms: Option<u64>,

    /// Enable verbose output
    #[arg(short = 'v', long = "verbose", help = "Enable verbose output")]
    pub verbose: bool,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }

    pub fn validate(&self) -> Result<(), String> {
        if !self.file.is_file() {
            return Err(format!("File does not exist: {}", self.file.display()));
        }
        Ok(())
    }
}
