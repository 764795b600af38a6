// sheetfield CLI - headless operations on an infinite-grid document

mod commands;
mod exit_codes;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use sheetfield_document::DocumentError;
use sheetfield_engine::position::Position;
use tracing_subscriber::EnvFilter;

use exit_codes::{document_exit_code, EXIT_ERROR, EXIT_SUCCESS, EXIT_USAGE};

#[derive(Parser)]
#[command(name = "sheetfield")]
#[command(about = "Inspect and edit sheetfield documents without a canvas")]
#[command(long_version = long_version())]
#[command(version)]
struct Cli {
    /// Document file (created if missing)
    document: PathBuf,

    /// Settings file; defaults to the user config directory
    #[arg(long, global = true, env = "SHEETFIELD_CONFIG")]
    config: Option<PathBuf>,

    /// Log more (-v info, -vv debug); RUST_LOG overrides
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sheet count, world history size and last save time
    Info {
        #[arg(long)]
        json: bool,
    },

    /// Placed sheets, row-major
    List {
        #[arg(long)]
        json: bool,
    },

    /// Place an empty sheet
    #[command(allow_negative_numbers = true)]
    New { x: i32, y: i32 },

    /// Unplace a sheet (world undo brings it back)
    #[command(allow_negative_numbers = true)]
    Remove { x: i32, y: i32 },

    /// Move a sheet to an empty position
    #[command(allow_negative_numbers = true)]
    Move { x: i32, y: i32, to_x: i32, to_y: i32 },

    /// Undo the last world edit
    Undo,

    /// Redo the most recently undone world edit
    Redo,

    /// Sheets whose text contains QUERY (case-insensitive)
    Search { query: String },

    /// Place stored sheets that nothing references into the scratch region
    Repair,

    /// Write a sheet's content as interchange bytes
    #[command(allow_negative_numbers = true)]
    Export { x: i32, y: i32, file: PathBuf },

    /// Place a new sheet from an interchange file
    #[command(allow_negative_numbers = true)]
    Import { x: i32, y: i32, file: PathBuf },
}

fn long_version() -> &'static str {
    concat!(
        env!("CARGO_PKG_VERSION"),
        " (", env!("GIT_COMMIT_HASH"), ")",
        "\ndocument: sheetfield-document ", env!("CARGO_PKG_VERSION"),
        "\ntarget:   ", env!("TARGET"),
    )
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    // Also installs the `log` bridge, so library records reach stderr.
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).try_init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let ctx = commands::Context { document: cli.document, config: cli.config };
    let result = match cli.command {
        Commands::Info { json } => commands::cmd_info(&ctx, json),
        Commands::List { json } => commands::cmd_list(&ctx, json),
        Commands::New { x, y } => commands::cmd_new(&ctx, Position::new(x, y)),
        Commands::Remove { x, y } => commands::cmd_remove(&ctx, Position::new(x, y)),
        Commands::Move { x, y, to_x, to_y } => {
            commands::cmd_move(&ctx, Position::new(x, y), Position::new(to_x, to_y))
        }
        Commands::Undo => commands::cmd_undo(&ctx),
        Commands::Redo => commands::cmd_redo(&ctx),
        Commands::Search { query } => commands::cmd_search(&ctx, &query),
        Commands::Repair => commands::cmd_repair(&ctx),
        Commands::Export { x, y, file } => commands::cmd_export(&ctx, Position::new(x, y), &file),
        Commands::Import { x, y, file } => commands::cmd_import(&ctx, Position::new(x, y), &file),
    };

    match result {
        Ok(()) => ExitCode::from(EXIT_SUCCESS),
        Err(CliError { code, message, hint }) => {
            if !message.is_empty() {
                eprintln!("error: {}", message);
            }
            if let Some(hint) = hint {
                eprintln!("hint:  {}", hint);
            }
            ExitCode::from(code)
        }
    }
}

#[derive(Debug)]
pub struct CliError {
    pub code: u8,
    pub message: String,
    pub hint: Option<String>,
}

impl CliError {
    pub fn general(msg: impl Into<String>) -> Self {
        Self { code: EXIT_ERROR, message: msg.into(), hint: None }
    }

    pub fn usage(msg: impl Into<String>) -> Self {
        Self { code: EXIT_USAGE, message: msg.into(), hint: None }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

impl From<DocumentError> for CliError {
    fn from(err: DocumentError) -> Self {
        let hint = match &err {
            DocumentError::NotPlaced(_) => Some("run `list` to see placed sheets".to_string()),
            DocumentError::Occupied(_) => Some("pick an empty position or `remove` first".to_string()),
            _ => None,
        };
        Self { code: document_exit_code(&err), message: err.to_string(), hint }
    }
}
