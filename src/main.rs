//! tuplepipe CLI - run programs through an inference engine and print tuples.
//!
//! Usage:
//!   tuplepipe [--engine <name>] [--flavor <flavor>] query -q <id>=<file>...
//!   tuplepipe eval <file>
//!   tuplepipe filter <data file> --min-prob <p>
//!
//! Examples:
//!   tuplepipe query -q q1=retrieve.pd -q q2=qterm.pd
//!   tuplepipe --flavor psql --engine hy_psql eval query.sql
//!   tuplepipe filter index.tf --min-prob 0.1 -o pruned.tf

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tuplepipe::engine::{ArgvBuilder, EchoStyle, DEFAULT_END_TOKEN};
use tuplepipe::tuple::{filter_data, ParseMode};
use tuplepipe::{Delimiter, Engine, EngineConfig, Flavor};

#[derive(Parser)]
#[command(name = "tuplepipe")]
#[command(about = "Drive a text-protocol inference engine and collect its tuples")]
#[command(version)]
struct Cli {
    /// JSON config file (defaults to $TUPLEPIPE_CONFIG or the user config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Engine binary name or path
    #[arg(long, global = true, default_value = "hy_pd")]
    engine: String,

    /// Echo syntax the engine understands
    #[arg(long, global = true, default_value = "datalog")]
    flavor: FlavorArg,

    /// Delimiter token the engine echoes after each request
    #[arg(long, global = true, default_value = DEFAULT_END_TOKEN)]
    token: String,

    /// Extra argument for the engine (repeatable)
    #[arg(long = "arg", global = true, allow_hyphen_values = true)]
    args: Vec<String>,

    /// Connect to an engine server instead of spawning one
    #[arg(long, global = true)]
    connect: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Pipeline several programs and print tuples per query id
    Query {
        /// Query as <id>=<program file> (repeatable, run in order)
        #[arg(short, long = "query", required = true)]
        queries: Vec<String>,

        /// Print results as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run one program file and print its tuples
    Eval {
        /// Program file
        file: PathBuf,
    },

    /// Rewrite a tuple data file, keeping comments and probable tuples
    Filter {
        /// Input data file
        input: PathBuf,

        /// Minimum probability to keep a tuple
        #[arg(long, default_value_t = 0.0)]
        min_prob: f64,

        /// Output file (stdout if omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Fail on the first malformed tuple instead of dropping it
        #[arg(long)]
        strict: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum FlavorArg {
    /// `_echo("TOKEN").`
    Datalog,
    /// `INSERT INTO _echo VALUES ('TOKEN');`
    Psql,
    /// The bare token (engines that echo their input)
    Echo,
}

impl From<FlavorArg> for EchoStyle {
    fn from(arg: FlavorArg) -> Self {
        match arg {
            FlavorArg::Datalog => EchoStyle::Datalog,
            FlavorArg::Psql => EchoStyle::Psql,
            FlavorArg::Echo => EchoStyle::Template("{token}".to_string()),
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "tuplepipe=info".into()),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(io::stderr),
        )
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    match &cli.command {
        Commands::Query { queries, json } => cmd_query(&cli, queries, *json),
        Commands::Eval { file } => cmd_eval(&cli, file),
        Commands::Filter {
            input,
            min_prob,
            output,
            strict,
        } => cmd_filter(input, *min_prob, output.as_deref(), *strict),
    }
}

fn load_config(cli: &Cli) -> Result<EngineConfig> {
    let config = match &cli.config {
        Some(path) => EngineConfig::load(path)?.with_env_overrides(),
        None => EngineConfig::discover()?,
    };
    Ok(config)
}

fn open_engine(cli: &Cli) -> Result<Engine> {
    let config = load_config(cli)?;
    let delimiter = Delimiter::new(&cli.token, cli.flavor.into())?;
    let builder = ArgvBuilder::new(cli.engine.as_str()).args(cli.args.iter().cloned());
    let name = Path::new(&cli.engine)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| cli.engine.clone());
    let flavor = Flavor::new(name, builder).with_delimiter(delimiter);

    match &cli.connect {
        Some(addr) => Engine::connect(addr.as_str(), flavor, config)
            .with_context(|| format!("Failed to connect to engine server at {}", addr)),
        None => {
            let engine = Engine::new(flavor, config);
            engine
                .start()
                .with_context(|| format!("Failed to start engine {}", cli.engine))?;
            Ok(engine)
        }
    }
}

fn cmd_query(cli: &Cli, queries: &[String], as_json: bool) -> Result<()> {
    let engine = open_engine(cli)?;

    for spec in queries {
        let Some((id, file)) = spec.split_once('=') else {
            bail!("Query must be <id>=<file>, got `{}`", spec);
        };
        let text = std::fs::read_to_string(file)
            .with_context(|| format!("Failed to read query file {}", file))?;
        engine.enqueue(id, text)?;
    }

    let results = engine.execute_queue().context("Query batch failed")?;
    if results.is_partial() {
        warn!(
            "Engine answered {} of {} queries",
            results.observed(),
            results.submitted()
        );
    }

    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    if as_json {
        let by_id: serde_json::Map<String, serde_json::Value> = results
            .iter()
            .map(|(id, tuples)| {
                let value = serde_json::to_value(tuples)?;
                Ok::<_, serde_json::Error>((id.to_string(), value))
            })
            .collect::<Result<_, serde_json::Error>>()?;
        let doc = json!({
            "results": by_id,
            "submitted": results.submitted(),
            "observed": results.observed(),
            "malformed": results.malformed_lines(),
        });
        serde_json::to_writer_pretty(&mut out, &doc)?;
        writeln!(out)?;
    } else {
        for (id, tuples) in results.iter() {
            for tuple in tuples {
                writeln!(out, "{}\t{}", id, tuple)?;
            }
        }
    }
    out.flush()?;
    Ok(())
}

fn cmd_eval(cli: &Cli, file: &Path) -> Result<()> {
    let engine = open_engine(cli)?;
    let sink = engine
        .eval_file(file)
        .with_context(|| format!("Failed to send {}", file.display()))?;

    let stdout = io::stdout();
    let mut out = stdout.lock();
    let mut count = 0;
    while let Some(tuple) = sink.next_tuple() {
        writeln!(out, "{}", tuple)?;
        count += 1;
    }
    info!("{} tuples from {}", count, file.display());

    if let Some(timing) = engine.close_stdin().ok().and_then(|_| engine.timing()) {
        info!(
            "Engine time: real {} user {} sys {} cpu {}",
            timing.real, timing.user, timing.sys, timing.cpu
        );
    }
    Ok(())
}

fn cmd_filter(input: &Path, min_prob: f64, output: Option<&Path>, strict: bool) -> Result<()> {
    let reader = BufReader::new(
        File::open(input).with_context(|| format!("Failed to open {}", input.display()))?,
    );
    let mode = if strict {
        ParseMode::Strict
    } else {
        ParseMode::Lenient
    };
    let keep = |t: &tuplepipe::Tuple| t.probability() >= min_prob;

    let stats = match output {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("Failed to create {}", path.display()))?;
            filter_data(reader, BufWriter::new(file), mode, keep)?
        }
        None => filter_data(reader, io::stdout().lock(), mode, keep)?,
    };

    info!(
        "Kept {} tuples, removed {}, dropped {} malformed",
        stats.kept, stats.removed, stats.malformed
    );
    Ok(())
}
