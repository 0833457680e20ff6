use anyhow::Result;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use veritrace::offline::{load_trace, LoadedTrace};
use veritrace::server;
use veritrace_core::query::{bucket_width, context_id_of, describe_variable, variable_quark};
use veritrace_core::{get_values_range, series, Config, Timestamp, PROVIDER_VERSION};

#[derive(Parser)]
#[command(name = "veritrace")]
#[command(about = "Precision trace explorer: ingest numerical traces, build visual trees, query values", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "veritrace.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the Veritrace server
    Serve {
        /// Enable verbose request logging
        #[arg(short, long)]
        verbose: bool,
    },

    /// Build and print the visual tree of a trace file
    Tree {
        /// Trace file (JSON lines)
        file: PathBuf,

        /// Only list variables with a sample below this many significant digits
        #[arg(long)]
        problems: Option<f64>,

        /// Output raw JSON instead of formatted text
        #[arg(long)]
        json: bool,
    },

    /// Print one value per variable over a time range
    Values {
        file: PathBuf,

        /// Range start (defaults to the trace start)
        #[arg(long)]
        start: Option<Timestamp>,

        /// Range end (defaults to the trace end)
        #[arg(long)]
        end: Option<Timestamp>,

        /// Value field to read
        #[arg(long)]
        field: Option<String>,

        #[arg(long)]
        json: bool,
    },

    /// Print the bucketed series of one variable
    Series {
        file: PathBuf,

        /// Context id of the variable
        #[arg(long)]
        context: u64,

        #[arg(long)]
        field: Option<String>,

        /// Bucket width in trace time units
        #[arg(long)]
        width: Option<Timestamp>,

        #[arg(long)]
        json: bool,
    },

    /// Ingest a trace file and report what was kept and dropped
    Check {
        file: PathBuf,

        #[arg(long)]
        json: bool,
    },

    /// Print the default configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Config = cli.command {
        print!("{}", Config::default_toml()?);
        return Ok(());
    }

    let mut config = if cli.config.exists() {
        eprintln!("📝 Loading configuration from {:?}", cli.config);
        Config::from_file(&cli.config)?
    } else {
        Config::default()
    };
    config.validate()?;

    match cli.command {
        Commands::Serve { verbose } => {
            if verbose {
                config.server.verbose = true;
            }
            println!(
                "🚀 Starting Veritrace server on {}:{}",
                config.server.host, config.server.port
            );
            server::start_server(config).await?;
        }
        Commands::Tree {
            file,
            problems,
            json,
        } => {
            server::init_tracing(&config.logging)?;
            let trace = load_trace(&config, &file)?;
            handle_tree(&config, &trace, problems, json).await?;
        }
        Commands::Values {
            file,
            start,
            end,
            field,
            json,
        } => {
            server::init_tracing(&config.logging)?;
            let trace = load_trace(&config, &file)?;
            let field = field.unwrap_or_else(|| config.build.sample_field.clone());
            handle_values(&trace, start, end, &field, json)?;
        }
        Commands::Series {
            file,
            context,
            field,
            width,
            json,
        } => {
            server::init_tracing(&config.logging)?;
            let trace = load_trace(&config, &file)?;
            let field = field.unwrap_or_else(|| config.build.sample_field.clone());
            handle_series(&config, &trace, context, &field, width, json)?;
        }
        Commands::Check { file, json } => {
            server::init_tracing(&config.logging)?;
            let trace = load_trace(&config, &file)?;
            handle_check(&trace, json)?;
        }
        Commands::Config => {}
    }

    Ok(())
}

async fn handle_tree(
    config: &Config,
    trace: &LoadedTrace,
    problems: Option<f64>,
    json: bool,
) -> Result<()> {
    let (state, tree) = trace.build_tree(config).await?;

    if let Some(limit) = problems {
        let entries = tree.problematic(limit);
        if json {
            println!("{}", serde_json::to_string_pretty(&entries)?);
            return Ok(());
        }
        println!(
            "⚠️  {} variable(s) below {} significant digits",
            entries.len(),
            limit
        );
        for entry in entries {
            println!("  • {} ({}:{})", entry.name, entry.file, entry.line);
        }
        return Ok(());
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&tree)?);
        return Ok(());
    }

    println!("🌳 {} [{:?}, {} entries]", trace.name, state, tree.len());
    print!("{}", tree.render());
    Ok(())
}

fn handle_values(
    trace: &LoadedTrace,
    start: Option<Timestamp>,
    end: Option<Timestamp>,
    field: &str,
    json: bool,
) -> Result<()> {
    let store = trace.store.as_ref();
    let start = start.unwrap_or_else(|| store.start_time());
    let end = end.unwrap_or_else(|| store.current_end_time());

    #[derive(Serialize)]
    struct Row {
        context_id: Option<u64>,
        name: Option<String>,
        value: f64,
    }

    let mut rows: Vec<Row> = get_values_range(store, start, end, field)
        .into_iter()
        .map(|(quark, value)| {
            let context_id = context_id_of(store, quark);
            Row {
                context_id,
                name: context_id
                    .and_then(|id| describe_variable(store, id))
                    .map(|d| d.name),
                value,
            }
        })
        .collect();
    rows.sort_by_key(|r| r.context_id);

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    println!("📈 {} over [{}, {}]", field, start, end);
    println!("{:<10} {:<24} {:>14}", "CONTEXT", "NAME", "VALUE");
    for row in rows {
        println!(
            "{:<10} {:<24} {:>14.4}",
            row.context_id.map_or("-".to_string(), |id| id.to_string()),
            row.name.as_deref().unwrap_or("-"),
            row.value
        );
    }
    Ok(())
}

fn handle_series(
    config: &Config,
    trace: &LoadedTrace,
    context: u64,
    field: &str,
    width: Option<Timestamp>,
    json: bool,
) -> Result<()> {
    let store = trace.store.as_ref();
    let variable = variable_quark(store, context)
        .ok_or_else(|| anyhow::anyhow!("No values recorded for context {}", context))?;
    let start = store.start_time();
    let end = store.current_end_time();
    let width = width.unwrap_or_else(|| {
        bucket_width(
            start,
            end,
            config.build.display_width,
            config.build.bucket_multiplier,
        )
    });

    let view = series(store, variable, field, start, end, width);
    let width = view.width();
    let buckets = view.collect_buckets();

    if json {
        println!("{}", serde_json::to_string_pretty(&buckets)?);
        return Ok(());
    }

    let name = describe_variable(store, context).map_or_else(|| context.to_string(), |d| d.name);
    println!("📉 {} / {} ({} buckets of {})", name, field, buckets.len(), width);
    for bucket in buckets {
        println!("  [{:>12}, {:>12}]  {:.4}", bucket.start, bucket.end, bucket.value);
    }
    Ok(())
}

fn handle_check(trace: &LoadedTrace, json: bool) -> Result<()> {
    if json {
        #[derive(Serialize)]
        struct Report<'a> {
            provider_version: u32,
            start_time: Timestamp,
            end_time: Timestamp,
            contexts: usize,
            callpaths: usize,
            stats: &'a veritrace_core::IngestStats,
        }
        let report = Report {
            provider_version: PROVIDER_VERSION,
            start_time: trace.store.start_time(),
            end_time: trace.store.current_end_time(),
            contexts: trace.contexts,
            callpaths: trace.callpaths,
            stats: &trace.stats,
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let stats = &trace.stats;
    println!("🔍 {} (provider v{})", trace.name, PROVIDER_VERSION);
    println!(
        "• Time range: [{}, {}]",
        trace.store.start_time(),
        trace.store.current_end_time()
    );
    println!("• Events: {}", stats.events);
    println!(
        "• Contexts: {} • Callpaths: {} • Values: {}",
        trace.contexts, trace.callpaths, stats.values
    );
    if stats.dropped() > 0 {
        println!("\n⚠️  Dropped {} event(s):", stats.dropped());
        println!("  • unknown kind: {}", stats.unknown_kinds);
        println!("  • missing parent: {}", stats.missing_parents);
        println!("  • malformed: {}", stats.malformed);
        println!("  • store errors: {}", stats.store_errors);
        println!("  • conflicting redefinitions: {}", stats.conflicts);
    } else {
        println!("✅ No dropped events");
    }
    Ok(())
}
