use std::error::Error;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use unit_cart::config::CartConfig;
use unit_cart::input::load_corpus;
use unit_cart::pipeline::CartBuilder;
use unit_cart::refine::WagonTrainer;
use unit_cart::tree::format_tree;

/// Builds a pre-selection CART over the units of a voice corpus
#[derive(Parser, Debug)]
#[command(name = "unit-cart")]
#[command(about = "Builds a pre-selection CART for unit-selection synthesis", long_about = None)]
struct Args {
    /// Corpus file (JSON: schema, units and cepstra)
    #[arg(short, long)]
    corpus: PathBuf,

    /// TOML configuration; built-in defaults when omitted
    #[arg(long)]
    config: Option<PathBuf>,

    /// Where to write the leaf listing (JSON); stdout when omitted
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Print the finished tree to stderr
    #[arg(long)]
    print_tree: bool,

    /// Log level, overridden by RUST_LOG
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&args.log_level)?,
    };
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(io::stderr).init();

    info!("Starting unit-cart v{}", env!("CARGO_PKG_VERSION"));
    let config = match &args.config {
        Some(path) => CartConfig::from_toml_file(path)?,
        None => CartConfig::default(),
    };
    let loaded = load_corpus(&args.corpus)?;

    let trainer = WagonTrainer::from_config(&config.refinement);
    let builder = CartBuilder::new(config);
    let cart = builder.run(&loaded.corpus, &loaded.cepstra, &trainer)?;
    info!(
        nodes = cart.tree.node_count(),
        leaves = cart.tree.leaf_count(),
        height = cart.tree.height(),
        too_small = cart.report.too_small.len(),
        too_big = cart.report.too_big.len(),
        "tree finished"
    );
    if args.print_tree {
        eprint!("{}", format_tree(&cart.tree, cart.corpus.schema()));
    }

    let summaries = cart.leaf_summaries();
    match &args.output {
        Some(path) => {
            let mut out = BufWriter::new(File::create(path)?);
            serde_json::to_writer_pretty(&mut out, &summaries)?;
            out.flush()?;
            info!("Leaf listing written to {}", path.display());
        }
        None => {
            let stdout = io::stdout();
            let mut out = stdout.lock();
            serde_json::to_writer_pretty(&mut out, &summaries)?;
            writeln!(out)?;
        }
    }
    Ok(())
}
