use std::{path::PathBuf, sync::atomic::AtomicBool};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use flexi_logger::{Logger, LoggerHandle};
use palm::config::{self, ImportConfig};
use palm::import::{Importer, MemoryService};
use palm::LoadReport;

#[derive(Debug, Parser)]
#[command(
    name = "palm",
    about = "Read Palm Desktop memo exports and stage them for a note service",
    version
)]
struct Cli {
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Parse an export file and list the notes found in it.
    Parse(ParseArgs),

    /// Run the import pipeline against an in-memory note service.
    Import(ImportArgs),
}

#[derive(Debug, Args)]
struct SourceArgs {
    /// Memo export file written by Palm Desktop.
    #[arg(env = "PALM_EXPORT_FILE")]
    file: PathBuf,
    /// Character encoding of the export file (macintosh, windows-1252, latin1, ...).
    #[arg(long, short, env = "PALM_EXPORT_ENCODING")]
    encoding: Option<String>,
    /// Locale whose month names appear in Mac export dates (e.g. de_DE).
    #[arg(long, short, env = "PALM_LOCALE", default_value = config::DEFAULT_LOCALE)]
    locale: String,
}

impl SourceArgs {
    fn into_config(self) -> ImportConfig {
        let mut config = ImportConfig::new(self.file);
        if let Some(encoding) = self.encoding {
            config.encoding = encoding;
        }
        config.locale = self.locale;
        config
    }
}

#[derive(Debug, Args)]
struct ParseArgs {
    #[command(flatten)]
    source: SourceArgs,
    /// Emit JSON instead of a human-readable list.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct ImportArgs {
    #[command(flatten)]
    source: SourceArgs,
    /// Print the generated note content for each staged note.
    #[arg(long)]
    show_content: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let _logger = init_logging(cli.verbose)?;
    match cli.command {
        Commands::Parse(args) => handle_parse(args),
        Commands::Import(args) => handle_import(args),
    }
}

fn init_logging(verbose: bool) -> Result<LoggerHandle> {
    let level = if verbose { "debug" } else { "warn" };
    Logger::try_with_str(level)
        .context("configuring logger")?
        .log_to_stderr()
        .start()
        .context("starting logger")
}

/// Load the export, failing when no notes were recovered.
fn load_notes(config: &ImportConfig) -> Result<LoadReport> {
    let report = config
        .load()
        .with_context(|| format!("loading {:?}", config.export_path))?;
    if report.notes.is_empty() {
        let reason = report
            .diagnostic
            .unwrap_or_else(|| "no notes found".to_string());
        anyhow::bail!(reason);
    }
    if let Some(diagnostic) = &report.diagnostic {
        eprintln!("warning: {diagnostic}");
    }
    if report.rejected > 0 {
        eprintln!("warning: skipped {} unreadable records", report.rejected);
    }
    Ok(report)
}

fn handle_parse(args: ParseArgs) -> Result<()> {
    let ParseArgs { source, json } = args;
    let config = source.into_config();
    let report = load_notes(&config)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let dialect = report.dialect.map(|d| d.label()).unwrap_or("unknown");
    println!("Opened {} notes ({} format).", report.notes.len(), dialect);
    for note in &report.notes {
        let categories = note
            .categories
            .iter()
            .filter(|c| !c.is_empty())
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(", ");
        println!(
            "{} ({}) [{}]",
            note.title,
            note.modified_at.format("%c"),
            categories
        );
    }
    Ok(())
}

fn handle_import(args: ImportArgs) -> Result<()> {
    let ImportArgs {
        source,
        show_content,
    } = args;
    let config = source.into_config();
    let report = load_notes(&config)?;
    println!("Read {} notes from export file", report.notes.len());

    let mut service = MemoryService::default();
    let cancel = AtomicBool::new(false);
    let summary = Importer::new(&mut service)
        .run(&report.notes, &mut |msg| println!("{msg}"), &cancel)
        .context("staging notes")?;

    if show_content {
        for (id, note) in &service.notes {
            println!();
            println!("== {} ({}) ==", note.title, id);
            println!("{}", note.content);
        }
    }
    println!("{summary}");
    Ok(())
}
