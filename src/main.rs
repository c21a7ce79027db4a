use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process;
use std::str::FromStr;
use std::time::Instant;

use clap::Parser;
use rayon::ThreadPoolBuilder;
use serde_json::json;
use tracing::{error, info};
use tracing_subscriber::FmtSubscriber;

use codebook_builder::loader::InputSource;
use codebook_builder::{
    ClusterConfig, ClusterReport, CodebookBuilder, CodebookError, DescriptorLoader, Diagnostics,
    Dictionary, Initialization, Result as CodebookResult,
};

#[derive(Parser, Debug)]
#[command(name = "codebook-builder")]
#[command(about = "Builds a visual codebook from local image descriptors", long_about = None)]
struct Args {
    /// 'list:<textfile>' of descriptor files, or 'file:<descriptor file>'
    #[arg(long)]
    input: String,

    /// Output path for the dictionary (JSON)
    #[arg(short, long)]
    output: PathBuf,

    /// Number of clusters
    #[arg(short = 'k', long)]
    clusters: usize,

    /// Number of k-means iterations
    #[arg(short, long, default_value_t = 11)]
    iterations: usize,

    /// Accuracy of cluster assignment during k-means (1.0 = exact)
    #[arg(long, default_value_t = 1.0)]
    accuracy: f32,

    /// kmeans++, subsampled-kmeans++ or random
    #[arg(long, value_parser = parse_initialization, default_value = "kmeans++")]
    initialization: Initialization,

    /// Weighting of the spatial x and y dimensions during clustering
    #[arg(long, default_value_t = 0.0)]
    location_weighting: f32,

    /// Subsample so that roughly this many descriptors are loaded (0 = all)
    #[arg(long, default_value_t = 0)]
    max_descriptors: usize,

    /// Append the clustering metric and cluster sizes to this file
    #[arg(long)]
    stats_file: Option<PathBuf>,

    /// File touched once centroid initialization completes
    #[arg(long)]
    checkpoint_file: Option<PathBuf>,

    /// Optional run summary (JSON)
    #[arg(long)]
    report: Option<PathBuf>,

    /// RNG seed (defaults to OS entropy)
    #[arg(long)]
    seed: Option<u64>,

    /// Override Rayon global thread pool size
    #[arg(long)]
    threads: Option<usize>,

    /// Verbosity: set RUST_LOG style level (info, debug, warn)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() {
    let args = Args::parse();
    if let Err(err) = init_logging(&args.log_level) {
        eprintln!("failed to initialise logging: {err}");
    }

    if let Err(err) = run(args) {
        error!(error = %err, "codebook build failed");
        process::exit(1);
    }
}

fn init_logging(level: &str) -> Result<(), String> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(match level {
            "trace" => tracing::Level::TRACE,
            "debug" => tracing::Level::DEBUG,
            "warn" => tracing::Level::WARN,
            "error" => tracing::Level::ERROR,
            _ => tracing::Level::INFO,
        })
        .finish();
    tracing::subscriber::set_global_default(subscriber).map_err(|err| err.to_string())
}

fn run(args: Args) -> CodebookResult<()> {
    if let Some(threads) = args.threads {
        ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global()
            .map_err(|err| {
                CodebookError::InvalidArgument(format!(
                    "failed to configure rayon threadpool: {err}"
                ))
            })?;
        info!(threads, "configured rayon global thread pool");
    }

    let files = InputSource::parse(&args.input).files()?;
    if files.is_empty() {
        return Err(CodebookError::InvalidArgument(format!(
            "no descriptor files found for input '{}'",
            args.input
        )));
    }

    let keep_probability = if args.max_descriptors > 0 {
        let mut total = 0usize;
        for path in &files {
            total += DescriptorLoader::load(path)?.len();
        }
        let keep = if total == 0 {
            1.0
        } else {
            (args.max_descriptors as f64 / total as f64).min(1.0) as f32
        };
        info!(total, max = args.max_descriptors, keep, "subsampling descriptors");
        keep
    } else {
        1.0
    };

    let mut builder = match args.seed {
        Some(seed) => CodebookBuilder::with_seed(seed),
        None => CodebookBuilder::new(),
    };
    for path in &files {
        let descriptors = DescriptorLoader::load(path)?;
        info!(path = ?path, descriptors = descriptors.len(), "adding descriptors");
        builder.append(&descriptors, keep_probability, args.location_weighting)?;
    }
    info!(rows = builder.data_size(), "clustering descriptors");

    let config = ClusterConfig {
        k: args.clusters,
        iterations: args.iterations,
        accuracy: args.accuracy,
        initialization: args.initialization,
        checkpoint: args.checkpoint_file.clone(),
        diagnostics: if args.stats_file.is_some() {
            Diagnostics::ALL
        } else {
            Diagnostics::NONE
        },
        ..ClusterConfig::default()
    };

    let start = Instant::now();
    let report = builder.run(&config)?;
    let elapsed = start.elapsed();
    info!(
        k = args.clusters,
        empty_clusters = report.empty_clusters,
        took_seconds = elapsed.as_secs_f64(),
        "clustering finished"
    );
    if let Some(metric) = report.metric {
        info!(metric, "k-means metric");
    }

    let dictionary = builder.dictionary();
    dictionary.save_json(&args.output)?;
    info!(path = ?args.output, centroids = dictionary.len(), "wrote dictionary");

    if let Some(path) = &args.stats_file {
        let sizes = report.cluster_sizes.as_deref().unwrap_or_default();
        let line = stats_line(report.metric.unwrap_or_default(), sizes);
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(line.as_bytes())?;
        info!(path = ?path, "appended clustering stats");
    }

    if let Some(path) = &args.report {
        write_report(path, &args, &builder, &dictionary, &report, elapsed.as_secs_f64())?;
    }
    Ok(())
}

/// `"<metric>, <size>, <size>, ...\n"` with sizes largest first.
fn stats_line(metric: f64, sizes: &[usize]) -> String {
    let mut line = format!("{metric:.6}");
    for size in sizes {
        line.push_str(&format!(", {size}"));
    }
    line.push('\n');
    line
}

fn write_report(
    path: &Path,
    args: &Args,
    builder: &CodebookBuilder,
    dictionary: &Dictionary,
    report: &ClusterReport,
    elapsed_secs: f64,
) -> CodebookResult<()> {
    let dump = json!({
        "k": dictionary.len(),
        "dim": dictionary.dimensions(),
        "rows": builder.data_size(),
        "iterations": args.iterations,
        "accuracy": args.accuracy,
        "initialization": args.initialization,
        "location_weighting": dictionary.location_weighting,
        "seed": args.seed,
        "elapsed_seconds": elapsed_secs,
        "input": args.input,
        "output": args.output.display().to_string(),
        "empty_clusters": report.empty_clusters,
        "metric": report.metric,
        "cluster_sizes": report.cluster_sizes,
        "index": report.tuned,
    });
    std::fs::write(path, serde_json::to_string_pretty(&dump)?)?;
    info!(path = ?path, "wrote run summary");
    Ok(())
}

fn parse_initialization(raw: &str) -> Result<Initialization, String> {
    Initialization::from_str(raw).map_err(|err| err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_line_lists_metric_then_sizes() {
        assert_eq!(stats_line(12.5, &[40, 7, 3]), "12.500000, 40, 7, 3\n");
        assert_eq!(stats_line(0.0, &[]), "0.000000\n");
    }

    #[test]
    fn initialization_flag_accepts_upper_snake_case() {
        assert_eq!(
            parse_initialization("SUBSAMPLED_KMEANSPP").unwrap(),
            Initialization::SubsampledKMeansPlusPlus
        );
        assert!(parse_initialization("spectral").is_err());
    }
}
