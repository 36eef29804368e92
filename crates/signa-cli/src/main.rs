use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use rand::rngs::StdRng;
use rand::SeedableRng;
use signa_core::calibrate::{calibrate, ThresholdGrid};
use signa_core::pairs::{make_exhaustive_pairs, make_online_pairs, DEFAULT_NEGATIVE_CAP, EVALUATION_NEGATIVE_CAP};
use signa_core::train::train;
use signa_core::{NetworkConfig, NormalizeOptions, OperatorRegistry, SiameseModel, TrainConfig};
use signa_service::dataset::{analyze_dir, load_labeled_set, scan_identities};
use signa_service::{Config, VerificationService};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "signa", about = "Handwritten signature verification CLI")]
struct Cli {
    /// TOML configuration file (SIGNA_* environment variables override it)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Variant {
    /// 4 conv blocks, 128-d embedding
    Standard,
    /// 3 conv blocks with dropout, 64-d embedding
    Compact,
}

#[derive(Clone, Copy, ValueEnum)]
enum Pairing {
    /// One random positive and negative per image
    Online,
    /// Every positive, capped negatives per identity pair
    Exhaustive,
}

#[derive(Subcommand)]
enum Commands {
    /// Train a model on an identity-directory dataset
    Train {
        /// Dataset root: one sub-directory per identity
        #[arg(long)]
        data: PathBuf,
        /// Output artifact (default: configured model path)
        #[arg(long)]
        out: Option<PathBuf>,
        #[arg(long, value_enum, default_value = "standard")]
        variant: Variant,
        #[arg(long, value_enum, default_value = "online")]
        pairing: Pairing,
        #[arg(long)]
        epochs: Option<usize>,
        #[arg(long)]
        batch_size: Option<usize>,
        #[arg(long)]
        learning_rate: Option<f32>,
        #[arg(long)]
        seed: Option<u64>,
        /// Cross-identity cap for exhaustive pairing
        #[arg(long, default_value_t = DEFAULT_NEGATIVE_CAP)]
        negative_cap: usize,
    },
    /// Sweep thresholds on a labeled dataset and save the best one
    Calibrate {
        #[arg(long)]
        data: PathBuf,
        /// Model artifact (default: configured model path)
        #[arg(long)]
        model: Option<PathBuf>,
        /// Threshold file (default: configured threshold path)
        #[arg(long)]
        out: Option<PathBuf>,
        #[arg(long, default_value_t = EVALUATION_NEGATIVE_CAP)]
        negative_cap: usize,
    },
    /// Compare two signature images
    Verify { first: PathBuf, second: PathBuf },
    /// Rank enrolled identities against a candidate signature
    Match {
        candidate: PathBuf,
        /// Only compare against this identity
        #[arg(long)]
        identity: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Report pair counts and data problems of a dataset
    Analyze {
        #[arg(long)]
        data: PathBuf,
        #[arg(long, default_value_t = EVALUATION_NEGATIVE_CAP)]
        negative_cap: usize,
        #[arg(long)]
        json: bool,
    },
    /// List enrolled identities
    Enrolled,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref()).context("loading configuration")?;
    let registry = OperatorRegistry::default();

    match cli.command {
        Commands::Train {
            data,
            out,
            variant,
            pairing,
            epochs,
            batch_size,
            learning_rate,
            seed,
            negative_cap,
        } => {
            let defaults = TrainConfig::default();
            let train_config = TrainConfig {
                epochs: epochs.unwrap_or(defaults.epochs),
                batch_size: batch_size.unwrap_or(defaults.batch_size),
                learning_rate: learning_rate.unwrap_or(defaults.learning_rate),
                seed: seed.unwrap_or(defaults.seed),
                ..defaults
            };
            let network = match variant {
                Variant::Standard => NetworkConfig::standard(),
                Variant::Compact => NetworkConfig::compact(),
            };
            let out = out.unwrap_or_else(|| config.model_path.clone());
            run_train(&config, &data, &out, network, pairing, negative_cap, &train_config)?;
        }
        Commands::Calibrate {
            data,
            model,
            out,
            negative_cap,
        } => {
            let model_path = model.unwrap_or_else(|| config.model_path.clone());
            let out = out.unwrap_or_else(|| config.threshold_path.clone());
            run_calibrate(&config, &registry, &data, &model_path, &out, negative_cap)?;
        }
        Commands::Verify { first, second } => {
            let service = VerificationService::open(&config, &registry)?;
            let result = service.verify_files(&first, &second)?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::Match {
            candidate,
            identity,
            json,
        } => {
            let service = VerificationService::open(&config, &registry)?;
            let gallery = service.load_gallery(&config.enrollment_dir)?;
            let result = service.match_enrolled_file(&candidate, &gallery, identity.as_deref())?;
            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("threshold: {:.4}", result.threshold);
                for (rank, score) in result.ranking.iter().enumerate() {
                    println!(
                        "{:>2}. {:<24} min {:.4}  mean {:.4}  max {:.4}  matches {}/{}  {:?}",
                        rank + 1,
                        score.key,
                        score.min,
                        score.mean,
                        score.max,
                        score.matches,
                        score.total(),
                        score.verdict
                    );
                }
                match &result.best_match {
                    Some(key) => println!("best match: {key} (confidence {:.2})", result.confidence),
                    None => println!("signature not recognized"),
                }
            }
        }
        Commands::Analyze {
            data,
            negative_cap,
            json,
        } => {
            let report = analyze_dir(&data, negative_cap)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                for identity in &report.identities {
                    println!(
                        "{:<24} {:>3} images  {:>4} positive pairs",
                        identity.key, identity.images, identity.positive_pairs
                    );
                }
                println!(
                    "total: {} images, {} positive pairs, {} negative pairs (cap {})",
                    report.total_images, report.positive_pairs, report.negative_pairs, report.negative_cap
                );
                if report.issues.is_empty() {
                    println!("no problems found");
                }
                for issue in &report.issues {
                    let who = issue.identity.as_deref().unwrap_or("dataset");
                    println!("{:?}: {who}: {}", issue.severity, issue.message);
                }
            }
        }
        Commands::Enrolled => {
            if !config.enrollment_dir.is_dir() {
                println!("no enrolled signatures ({} does not exist)", config.enrollment_dir.display());
                return Ok(());
            }
            let identities = scan_identities(&config.enrollment_dir)?;
            if identities.is_empty() {
                println!("no enrolled signatures");
            }
            for identity in identities {
                println!("{:<24} {} sample(s)", identity.key, identity.files.len());
            }
        }
    }

    Ok(())
}

fn run_train(
    config: &Config,
    data: &Path,
    out: &Path,
    network: NetworkConfig,
    pairing: Pairing,
    negative_cap: usize,
    train_config: &TrainConfig,
) -> Result<()> {
    let options = config.normalize_options();
    let loaded = load_labeled_set(data, &options)?;
    let sampled = match pairing {
        Pairing::Online => make_online_pairs(&loaded.set, &mut StdRng::seed_from_u64(train_config.seed)),
        Pairing::Exhaustive => make_exhaustive_pairs(&loaded.set, negative_cap),
    };
    if sampled.positives() == 0 {
        bail!("no same-identity pairs could be built; every identity needs at least 2 images");
    }
    tracing::info!(
        positives = sampled.positives(),
        negatives = sampled.negatives(),
        insufficient = sampled.insufficient.len(),
        "pairs sampled"
    );

    let mut model = SiameseModel::new(options.height, options.width, network, train_config.seed)?;
    let report = train(&mut model, &loaded.set, &sampled.pairs, train_config)?;
    model.save(out)?;
    println!("{}", serde_json::to_string_pretty(&report.summary)?);
    Ok(())
}

fn run_calibrate(
    config: &Config,
    registry: &OperatorRegistry,
    data: &Path,
    model_path: &Path,
    out: &Path,
    negative_cap: usize,
) -> Result<()> {
    let model = SiameseModel::load(model_path, registry)?;
    let [height, width, _] = model.input_shape();
    let options = NormalizeOptions {
        height,
        width,
        ..config.normalize_options()
    };
    let loaded = load_labeled_set(data, &options)?;
    let sampled = make_exhaustive_pairs(&loaded.set, negative_cap);

    let embeddings = loaded
        .set
        .samples()
        .iter()
        .map(|s| model.embed(&s.image))
        .collect::<Result<Vec<_>, _>>()?;
    let distances: Vec<f32> = sampled
        .pairs
        .iter()
        .map(|p| model.distance_between(&embeddings[p.first], &embeddings[p.second]))
        .collect();

    let calibration = calibrate(&distances, &sampled.labels(), &ThresholdGrid::default())?;
    calibration.threshold.save(out)?;

    println!(
        "same-identity distances:      mean {:.4}  std {:.4}  (n={})",
        calibration.same.mean, calibration.same.std, calibration.same.count
    );
    println!(
        "different-identity distances: mean {:.4}  std {:.4}  (n={})",
        calibration.different.mean, calibration.different.std, calibration.different.count
    );
    println!("top thresholds:");
    for m in calibration.top(5) {
        println!(
            "  {:.4}  f1 {:.4}  accuracy {:.4}  precision {:.4}  recall {:.4}",
            m.threshold, m.f1, m.accuracy, m.precision, m.recall
        );
    }
    println!("saved threshold {} to {}", calibration.threshold, out.display());
    Ok(())
}
