use std::path::PathBuf;

use anyhow::{Context, Result};
use itertools::Itertools;
use rustyline::{error::ReadlineError, Editor};
use structopt::StructOpt;
use tracing_subscriber::EnvFilter;

use deltaql::{
    parse_catalog, parse_command, Command, Document, Engine, EngineConfig, ProvenanceMode,
    SqliteSession,
};

const HISTORY_FILENAME: &str = ".deltaql_history";

#[derive(StructOpt)]
#[structopt(name = "deltaql", about = "Compile peer mappings into incremental SQL maintenance programs")]
struct Opt {
    /// Catalog file with peers, relations, mappings and trust priorities
    #[structopt(parse(from_os_str))]
    catalog: PathBuf,

    /// SQLite database file; in-memory when omitted
    #[structopt(long, parse(from_os_str))]
    database: Option<PathBuf>,

    /// JSON engine configuration
    #[structopt(long, parse(from_os_str))]
    config: Option<PathBuf>,

    #[structopt(long)]
    outer_union: bool,

    /// Add per-target views joining each tuple with its provenance rows
    #[structopt(long, conflicts_with = "outer_union")]
    outer_join: bool,

    #[structopt(long)]
    bidirectional: bool,

    /// Inline the iteration counter instead of binding it as a parameter
    #[structopt(long)]
    inline_iteration: bool,

    /// Print the translation and delta rules, then exit
    #[structopt(long)]
    dump_rules: bool,

    /// Print the compiled programs as JSON, then exit
    #[structopt(long)]
    dump_json: bool,
}

fn print_rules(engine: &mut Engine<SqliteSession>) -> Result<()> {
    if let Some(translation) = engine.translation() {
        println!("-- translation");
        for rule in translation.rules() {
            println!("{}", rule);
        }
        for view in &translation.views {
            println!("{}", view.rule);
        }
    }
    let delta = engine.compute_delta_rules()?;
    println!("-- delta");
    for rule in delta.rules().chain(&delta.reset) {
        println!("{}", rule);
    }
    Ok(())
}

fn handle_input(engine: &mut Engine<SqliteSession>, line: &str) -> Result<()> {
    match line.trim() {
        "" => {}
        ".update" => {
            let stats = engine.update_cycle()?;
            println!("{} changes from {} statements", stats.changes, stats.statements);
        }
        ".recompute" => {
            let stats = engine.recompute()?;
            println!("{} changes from {} statements", stats.changes, stats.statements);
        }
        ".rules" => print_rules(engine)?,
        ".sql" => {
            for (label, statements) in engine.program_sql()? {
                println!("-- {}", label);
                for sql in statements {
                    println!("{};", sql);
                }
            }
        }
        code => match parse_command(code)? {
            Command::Insert(relation, tuple) => engine.insert(&relation, &tuple)?,
            Command::Delete(relation, tuple) => engine.delete(&relation, &tuple)?,
            Command::Show(relation) => {
                for tuple in engine.contents(&relation)? {
                    println!("({})", tuple.iter().join(", "));
                }
            }
        },
    }
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("deltaql=info")))
        .with_writer(std::io::stderr)
        .init();

    let opt = Opt::from_args();
    let mut config = match &opt.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    if opt.outer_union {
        config.provenance = ProvenanceMode::OuterUnion;
    }
    if opt.outer_join {
        config.provenance = ProvenanceMode::OuterJoin;
    }
    config.bidirectional |= opt.bidirectional;
    config.inline_iteration |= opt.inline_iteration;

    let code = std::fs::read_to_string(&opt.catalog)
        .with_context(|| format!("Failed to read {}", opt.catalog.display()))?;
    let program = parse_catalog(&code)?;

    let session = match &opt.database {
        Some(path) => SqliteSession::open(path)?,
        None => SqliteSession::open_in_memory()?,
    };
    let mut engine = Engine::new(program.catalog, config, session)?;
    engine.compute_translation_rules(&program.trust)?;

    if opt.dump_rules {
        return print_rules(&mut engine);
    }
    if opt.dump_json {
        engine.compute_delta_rules()?;
        let document = Document {
            catalog: engine.catalog().clone(),
            translation: engine.translation().cloned(),
            delta: engine.delta_rules().cloned(),
        };
        println!("{}", document.to_json()?);
        return Ok(());
    }

    engine.create_schema()?;

    let mut editor = Editor::<()>::new();
    if editor.load_history(HISTORY_FILENAME).is_err() {
        tracing::debug!("no history loaded");
    }
    loop {
        let readline = editor.readline("> ");
        match readline {
            Ok(line) => {
                editor.add_history_entry(line.as_str());
                if line.trim() == ".quit" {
                    break;
                }
                if let Err(e) = handle_input(&mut engine, &line) {
                    println!("Error: {:#}", e);
                }
            }
            Err(ReadlineError::Interrupted) => break,
            Err(ReadlineError::Eof) => break,
            Err(err) => {
                println!("Error: {}", err);
                break;
            }
        }
    }
    editor
        .save_history(HISTORY_FILENAME)
        .context("Failed to save history")?;

    Ok(())
}
