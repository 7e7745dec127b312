use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use edaoogle_core::store::load_meta;
use edaoogle_core::{IndexPaths, IndexReader};
use edaoogle_indexer::{build_index, BuildOptions};
use tracing_subscriber::{fmt, EnvFilter};

use std::io::{self, BufWriter};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "indexer")]
#[command(about = "Build and inspect the keyword index", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build a new index generation from a corpus directory and publish it
    Build {
        /// Corpus directory; each file name becomes the document url
        #[arg(long, env = "EDAOOGLE_CORPUS")]
        input: PathBuf,
        /// Index root directory
        #[arg(long, env = "EDAOOGLE_INDEX")]
        output: PathBuf,
        /// Also index files in subdirectories, keyed by relative path
        #[arg(long, default_value_t = false)]
        recursive: bool,
    },
    /// Print every published posting as keyword<TAB>url<TAB>frequency
    Dump {
        #[arg(long, env = "EDAOOGLE_INDEX")]
        index: PathBuf,
    },
    /// Print metadata of the published generation
    Stats {
        #[arg(long, env = "EDAOOGLE_INDEX")]
        index: PathBuf,
    },
}

fn main() -> Result<()> {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Build { input, output, recursive } => {
            let cancel = Arc::new(AtomicBool::new(false));
            let flag = cancel.clone();
            ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst))
                .context("installing Ctrl-C handler")?;
            let options = BuildOptions { recursive, cancel: Some(cancel) };
            let report = build_index(&input, &output, &options).map_err(|e| {
                if e.is_configuration() {
                    tracing::error!(error = %e, "configuration error; no index published");
                }
                e
            })?;
            for doc in &report.skipped {
                eprintln!("skipped {}: {}", doc.path.display(), doc.reason);
            }
            println!(
                "published generation {} ({} documents, {} keywords, {} postings) in {:.3}s",
                report.meta.generation,
                report.meta.num_documents,
                report.meta.num_keywords,
                report.meta.num_postings,
                report.elapsed.as_secs_f64()
            );
            Ok(())
        }
        Commands::Dump { index } => {
            let reader = IndexReader::open(&index).with_context(|| format!("opening index {}", index.display()))?;
            let stdout = io::stdout();
            let rows = reader.export(BufWriter::new(stdout.lock()))?;
            tracing::info!(rows, "dumped postings");
            Ok(())
        }
        Commands::Stats { index } => {
            let paths = IndexPaths::new(&index);
            match paths.published_generation()? {
                None => println!("no published index under {}", index.display()),
                Some(generation) => {
                    let meta = load_meta(&paths, generation)?;
                    println!("{}", serde_json::to_string_pretty(&meta)?);
                }
            }
            Ok(())
        }
    }
}
