use anyhow::*;
use clap::Parser;
use colored::Colorize;
use log::*;
use std::collections::BTreeSet;

mod dataset;
mod dede;
mod delimit;
mod errors;
mod hasher;
mod pipeline;
mod render;
mod report;
mod synchronize;
mod tree;
mod tree_info;
mod utils;

use pipeline::{Mode, Paths, Settings};
use render::VisualStyle;
use synchronize::EmptyMatchPolicy;

#[derive(Parser, Debug)]
#[clap(author, version, about = "Interpret phylogenetic trees into species and synchronize placeholder names")]
struct Cli {
    #[clap(flatten)]
    verbose: clap_verbosity_flag::Verbosity,

    /// TSV of samples: hash, id, datatype, genus, species, then optional gene=species annotations
    #[clap(long)]
    samples: String,

    /// TSV of tree members: group, gene, role, member
    #[clap(long)]
    dataset: String,

    /// Directory holding tree/hash/ and alignment/; results are written there too
    #[clap(short, long)]
    outdir: String,

    #[clap(short, long, default_value = "run")]
    runname: String,

    /// Number of threads to use; 0 for all available
    #[clap(short = 'j', long, default_value_t = 0)]
    threads: usize,

    /// identification or validation
    #[clap(long, default_value = "identification")]
    mode: Mode,

    /// Do not rebuild flat clades before delimitation
    #[clap(long)]
    keep_flat: bool,

    /// Take every gene tree as final instead of the concatenated one; synchronization
    /// still needs a concatenated tree per group and fails without one
    #[clap(long)]
    no_concatenate: bool,

    /// Also interpret trees without query sample
    #[clap(long)]
    all_trees: bool,

    /// Maximal inner distance of a collapsed clade
    #[clap(long, default_value_t = 0.01)]
    collapse_cutoff: f64,

    /// What to do with placeholders matching nothing in the concatenated tree: keep or fail
    #[clap(long, default_value = "keep")]
    empty_match: EmptyMatchPolicy,

    /// Write genus names in full in collapsed trees
    #[clap(long)]
    full_genus: bool,

    /// Supports below this value are not drawn
    #[clap(long, default_value_t = 70.)]
    bootstrap_cutoff: f64,

    /// Color of query samples
    #[clap(long, default_value = "#bb0000")]
    highlight: String,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    let level = args.verbose.log_level_filter();
    buche::new()
        .quiet(level == LevelFilter::Off)
        .verbosity((level as usize).saturating_sub(1))
        .init()
        .context("failed to initialize logging")?;

    let settings = Settings {
        runname: args.runname.clone(),
        threads: args.threads,
        verbosity: level,
        mode: args.mode,
        solve_flat: !args.keep_flat,
        concatenate: !args.no_concatenate,
        query_only: !args.all_trees,
        collapse_distance_cutoff: args.collapse_cutoff,
        empty_match: args.empty_match,
        style: VisualStyle {
            highlight: args.highlight.clone(),
            full_genus: args.full_genus,
            bootstrap_cutoff: args.bootstrap_cutoff,
            ..Default::default()
        },
    };
    let paths = Paths::new(&args.outdir, &args.runname);

    let mut codec = hasher::HashCodec::new();
    let mut dataset = dataset::Dataset::load(&args.samples, &args.dataset, &mut codec)?;
    info!("{} hashes known; genera: {}", codec.len(), dataset.genus_list.join(", "));

    let (reports, _) = pipeline::run(&mut dataset, &paths, &settings)?;

    let genes = dataset
        .groups
        .values()
        .flat_map(|genes| genes.keys().cloned())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect::<Vec<_>>();
    report::write_reports(paths.report(), &reports)?;
    report::write_identification(paths.identification(), &dataset.registry, &genes)?;
    println!(
        "Reports written to {} and {}",
        paths.report().display().to_string().bold(),
        paths.identification().display().to_string().bold()
    );
    Ok(())
}
