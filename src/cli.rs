use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::ArchiveConfig;
use crate::zip::CompressionMethod;

#[derive(Parser, Debug)]
#[command(name = "zipvfs")]
#[command(version)]
#[command(about = "Browse and edit ZIP/JAR archives in place", long_about = None)]
#[command(after_help = "Examples:\n  \
  zipvfs app.jar list -v                  list entries with sizes and dates\n  \
  zipvfs app.jar cat META-INF/MANIFEST.MF print one entry\n  \
  zipvfs app.jar put notes.txt docs/notes.txt   add a file, creating docs/\n  \
  zipvfs data.zip extract -d out '*.csv'  extract matching entries")]
pub struct Cli {
    /// ZIP file path
    #[arg(value_name = "ARCHIVE")]
    pub archive: PathBuf,

    #[command(subcommand)]
    pub command: Command,

    /// Open the archive read-only
    #[arg(long, global = true)]
    pub read_only: bool,

    /// Write entries back in their original order
    #[arg(long, global = true)]
    pub keep_order: bool,

    /// DEFLATE level for rewritten entries (0-9)
    #[arg(long, global = true, value_name = "N", default_value_t = 6, value_parser = clap::value_parser!(u32).range(0..=9))]
    pub level: u32,

    /// Store new entries without compression
    #[arg(long, global = true)]
    pub store: bool,

    /// Log more (-L info, -LL debug, -LLL trace)
    #[arg(long = "log", short = 'L', action = clap::ArgAction::Count, global = true)]
    pub log: u8,

    /// Quiet mode (-qq => quieter)
    #[arg(short = 'q', action = clap::ArgAction::Count, global = true)]
    pub quiet: u8,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List entries
    List {
        /// List verbosely: sizes, ratio and modification time
        #[arg(short = 'v')]
        verbose: bool,
    },

    /// Write entry contents to stdout
    Cat {
        #[arg(value_name = "ENTRY", required = true)]
        entries: Vec<String>,
    },

    /// Extract entries (default: all)
    Extract {
        /// Patterns selecting entries; `*` and `?` are wildcards
        #[arg(value_name = "FILES")]
        files: Vec<String>,

        /// Extract files into exdir
        #[arg(short = 'd', value_name = "DIR")]
        extract_dir: Option<PathBuf>,

        /// Exclude files that follow
        #[arg(short = 'x', value_name = "FILE", num_args = 1..)]
        exclude: Vec<String>,

        /// Overwrite files WITHOUT prompting
        #[arg(short = 'o')]
        overwrite: bool,

        /// Junk paths (do not make directories)
        #[arg(short = 'j')]
        junk_paths: bool,
    },

    /// Copy a local file into an entry, creating parent directories
    Put {
        #[arg(value_name = "SOURCE")]
        source: PathBuf,
        #[arg(value_name = "ENTRY")]
        entry: String,
        /// Append to the entry instead of replacing it
        #[arg(short = 'a')]
        append: bool,
    },

    /// Create a directory and its parents
    Mkdir {
        #[arg(value_name = "DIR")]
        dir: String,
    },

    /// Remove entries
    Rm {
        #[arg(value_name = "ENTRY", required = true)]
        entries: Vec<String>,
        /// Remove directories with everything below them
        #[arg(short = 'r')]
        recursive: bool,
    },

    /// Copy an entry
    Cp {
        source: String,
        target: String,
        /// Replace an existing target
        #[arg(short = 'f')]
        force: bool,
    },

    /// Move an entry
    Mv {
        source: String,
        target: String,
        /// Replace an existing target
        #[arg(short = 'f')]
        force: bool,
    },

    /// Show or set the archive comment
    Comment {
        /// New comment; omit to print the current one
        text: Option<String>,
    },
}

impl Cli {
    pub fn is_quiet(&self) -> bool {
        self.quiet > 0
    }

    pub fn is_very_quiet(&self) -> bool {
        self.quiet > 1
    }

    /// Whether the command changes the archive.
    pub fn mutates(&self) -> bool {
        match &self.command {
            Command::List { .. } | Command::Cat { .. } | Command::Extract { .. } => false,
            Command::Comment { text } => text.is_some(),
            _ => true,
        }
    }

    pub fn archive_config(&self) -> ArchiveConfig {
        let method = if self.store {
            CompressionMethod::Stored
        } else {
            CompressionMethod::Deflate
        };
        ArchiveConfig::default()
            .read_only(self.read_only || !self.mutates())
            .maintain_order(self.keep_order)
            .compression_level(self.level)
            .default_method(method)
    }
}
