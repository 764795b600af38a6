// Command implementations. Each one opens the document, does its work, and
// closes it, which writes anything the command changed.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use sheetfield_config::DocumentSettings;
use sheetfield_document::{Document, DocumentError, DocumentEvent};
use sheetfield_engine::history::WalkReport;
use sheetfield_engine::position::Position;

use crate::CliError;

pub struct Context {
    pub document: PathBuf,
    pub config: Option<PathBuf>,
}

impl Context {
    fn settings(&self) -> DocumentSettings {
        match &self.config {
            Some(path) => DocumentSettings::load_from(path),
            None => DocumentSettings::load(),
        }
    }

    fn open(&self) -> Result<Document, CliError> {
        Document::open_path(&self.document, self.settings()).map_err(|e| {
            CliError::from(e).with_hint(format!("could not open {}", self.document.display()))
        })
    }
}

#[derive(Serialize)]
struct InfoJson {
    sheets: usize,
    world_history_groups: usize,
    world_history_branches: usize,
    last_saved: Option<String>,
}

#[derive(Serialize)]
struct SheetJson {
    x: i32,
    y: i32,
    identity: String,
}

fn print_json<T: Serialize>(value: &T) -> Result<(), CliError> {
    let text = serde_json::to_string_pretty(value).map_err(|e| CliError::general(e.to_string()))?;
    println!("{}", text);
    Ok(())
}

fn finish(doc: Document) -> Result<(), CliError> {
    doc.close().map_err(CliError::from)
}

fn report_walk(verb: &str, report: Option<WalkReport>) {
    match report {
        None => println!("nothing to {}", verb),
        Some(report) if report.is_clean() => println!("{}: {} step(s)", verb, report.applied),
        Some(report) => println!(
            "{}: {} step(s), {} clamped, {} repaired, {} failed",
            verb,
            report.applied,
            report.clamped,
            report.repaired,
            report.errored + report.skipped
        ),
    }
}

pub fn cmd_info(ctx: &Context, json: bool) -> Result<(), CliError> {
    let doc = ctx.open()?;
    let stats = doc.stats();
    let last_saved = doc.store().last_saved().map_err(DocumentError::from)?.map(|t| t.to_rfc3339());

    if json {
        print_json(&InfoJson {
            sheets: stats.placed,
            world_history_groups: stats.world_history_groups,
            world_history_branches: stats.world_history_branches,
            last_saved,
        })?;
    } else {
        println!("sheets:          {}", stats.placed);
        println!("world history:   {} group(s), {} branch(es)", stats.world_history_groups, stats.world_history_branches);
        println!("last saved:      {}", last_saved.as_deref().unwrap_or("never"));
    }
    finish(doc)
}

pub fn cmd_list(ctx: &Context, json: bool) -> Result<(), CliError> {
    let doc = ctx.open()?;
    let entries = doc.world().index().entries();
    if json {
        let sheets: Vec<SheetJson> = entries
            .iter()
            .map(|(p, id)| SheetJson { x: p.x, y: p.y, identity: id.to_string() })
            .collect();
        print_json(&sheets)?;
    } else {
        for (position, identity) in &entries {
            println!("{}\t{}\t{}", position.x, position.y, identity);
        }
    }
    finish(doc)
}

pub fn cmd_new(ctx: &Context, position: Position) -> Result<(), CliError> {
    let mut doc = ctx.open()?;
    doc.world_new_group();
    let identity = doc.new_sheet(position)?;
    println!("placed {} at {}", identity, position);
    finish(doc)
}

pub fn cmd_remove(ctx: &Context, position: Position) -> Result<(), CliError> {
    let mut doc = ctx.open()?;
    doc.world_new_group();
    let identity = doc.remove_sheet(position)?;
    println!("removed {} from {}", identity, position);
    finish(doc)
}

pub fn cmd_move(ctx: &Context, from: Position, to: Position) -> Result<(), CliError> {
    let mut doc = ctx.open()?;
    doc.world_new_group();
    doc.move_sheet(from, to)?;
    println!("moved {} to {}", from, to);
    finish(doc)
}

pub fn cmd_undo(ctx: &Context) -> Result<(), CliError> {
    let mut doc = ctx.open()?;
    let report = doc.world_undo()?;
    report_walk("undo", report);
    finish(doc)
}

pub fn cmd_redo(ctx: &Context) -> Result<(), CliError> {
    let mut doc = ctx.open()?;
    let report = doc.world_redo()?;
    report_walk("redo", report);
    finish(doc)
}

pub fn cmd_search(ctx: &Context, query: &str) -> Result<(), CliError> {
    if query.is_empty() {
        return Err(CliError::usage("search query is empty"));
    }
    let doc = ctx.open()?;
    for position in doc.search(query)? {
        println!("{}\t{}", position.x, position.y);
    }
    finish(doc)
}

pub fn cmd_repair(ctx: &Context) -> Result<(), CliError> {
    let mut doc = ctx.open()?;
    // Opening already repairs; collect what it placed along with a fresh pass.
    let mut placed: Vec<_> = doc
        .drain_events()
        .into_iter()
        .filter_map(|event| match event {
            DocumentEvent::OrphansRepaired { placed } => Some(placed),
            _ => None,
        })
        .flatten()
        .collect();
    placed.extend(doc.repair()?);

    if placed.is_empty() {
        println!("no orphaned sheets");
    }
    for (position, identity) in &placed {
        println!("placed {} at {}", identity, position);
    }
    finish(doc)
}

pub fn cmd_export(ctx: &Context, position: Position, file: &Path) -> Result<(), CliError> {
    let doc = ctx.open()?;
    let bytes = doc.export_sheet(position)?;
    fs::write(file, &bytes).map_err(|e| CliError::usage(format!("{}: {}", file.display(), e)))?;
    println!("exported {} to {} ({} bytes)", position, file.display(), bytes.len());
    finish(doc)
}

pub fn cmd_import(ctx: &Context, position: Position, file: &Path) -> Result<(), CliError> {
    let bytes = fs::read(file).map_err(|e| CliError::usage(format!("{}: {}", file.display(), e)))?;
    let mut doc = ctx.open()?;
    doc.world_new_group();
    let identity = doc.paste_sheet(position, &bytes)?;
    println!("imported {} as {} at {}", file.display(), identity, position);
    finish(doc)
}
