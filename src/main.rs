use anyhow::{Context, Result};
use clap::Parser;
use mpiperf::aggregate::RankScope;
use mpiperf::cli::{Cli, OutputFormat};
use mpiperf::engine::{analyze_source, CancellationToken};
use mpiperf::filter::{parse_rank_list, FilterSet};
use mpiperf::report::JsonReport;
use mpiperf::source::JsonLinesSource;
use mpiperf::{EngineConfig, RankId};
use std::collections::BTreeSet;
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber for debug output
fn init_tracing(debug: bool) {
    if debug {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::from_default_env().add_directive(tracing::Level::DEBUG.into()),
            )
            .with_writer(std::io::stderr)
            .init();
    }
}

fn main() -> Result<()> {
    let args = Cli::parse();

    init_tracing(args.debug);

    let config = match &args.config {
        Some(path) => EngineConfig::from_toml(path)?,
        None => EngineConfig::default(),
    };

    let filters = match &args.filter {
        Some(expr) => FilterSet::from_expr(expr)?,
        None => FilterSet::default(),
    };

    let selected: Option<BTreeSet<RankId>> = match &args.rank {
        Some(list) => Some(parse_rank_list(list)?),
        None => None,
    };

    let mut source = JsonLinesSource::open(&args.trace)
        .with_context(|| format!("Failed to open trace {}", args.trace.display()))?;
    let report = analyze_source(&mut source, &config, &CancellationToken::new())?;

    let Some(analysis) = report.analysis else {
        for failed in &report.failed_ranks {
            eprintln!("{}", failed);
        }
        anyhow::bail!(
            "No rank could be reconstructed from {}",
            args.trace.display()
        );
    };

    let ranks: Vec<RankId> = match &selected {
        Some(set) => set.iter().copied().collect(),
        None => analysis.ranks().collect(),
    };

    let mut output = JsonReport::new(&analysis);

    if args.critical_path {
        output.set_critical_path(&analysis);
    }

    if args.aggregate {
        let scopes: Vec<RankScope> = match &selected {
            Some(set) => set.iter().map(|&r| RankScope::Rank(r)).collect(),
            None => vec![RankScope::All],
        };
        output.set_aggregates(&analysis, &scopes);
    }

    if args.call_tree {
        for &rank in &ranks {
            output.add_call_tree(&analysis, rank);
        }
    }

    if let Some(matrix) = args.matrix {
        match analysis.comm_matrix(None, matrix.grouping()) {
            Some(m) => output.set_matrix(matrix.name(), &m),
            None => eprintln!(
                "Trace defines no {} locality groups; matrix skipped",
                matrix.name()
            ),
        }
    }

    if let Some(axis) = args.histogram {
        for &rank in &ranks {
            output.add_histogram(analysis.message_histogram(rank, axis.into(), &filters));
        }
    }

    match args.format {
        OutputFormat::Json => println!("{}", output.to_json()?),
        OutputFormat::Text => print!("{}", output.to_text()),
    }

    Ok(())
}
