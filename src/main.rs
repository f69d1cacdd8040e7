use clap::{ArgAction, Parser};
use derive_more::{Display, Error};
use exn::ResultExt;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use vitrine_config::{Config, Overrides, StoreConfig};
use vitrine_media::{CaptureDates, CodecGenerator, Ffmpeg};
use vitrine_pipeline::{Options, Pipeline, RunReport};
use vitrine_storage::StoreHandle;
use vitrine_storage::backend::{LocalBackend, S3Backend};

/// Ingest a tree of photos and videos into an object store and publish a
/// versioned catalog of it.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Configuration file (TOML, YAML or JSON).
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,
    /// Source root; each subdirectory is a section.
    #[arg(long, value_name = "DIR")]
    source: Option<PathBuf>,
    /// Maximum number of files processed at once.
    #[arg(long, value_name = "N", value_parser = clap::value_parser!(u64).range(1..))]
    concurrency: Option<u64>,
    /// Hash, name and deduplicate without uploading or publishing anything.
    #[arg(long)]
    dry_run: bool,
    /// Delete stored blobs the new catalog no longer references.
    #[arg(long)]
    prune: bool,
    /// More logging (-v debug, -vv trace).
    #[arg(short, long, action = ArgAction::Count, conflicts_with = "quiet")]
    verbose: u8,
    /// Only log warnings and errors.
    #[arg(short, long)]
    quiet: bool,
}

#[derive(Debug, Display, Error)]
enum ErrorKind {
    #[display("could not load configuration")]
    Config,
    #[display("could not open the object store")]
    Store,
    #[display("ingestion failed")]
    Run,
}

impl Cli {
    fn default_filter(&self) -> &'static str {
        match (self.quiet, self.verbose) {
            (true, _) => "warn",
            (false, 0) => "info",
            (false, 1) => "debug",
            (false, _) => "trace",
        }
    }

    fn overrides(&self) -> Overrides {
        Overrides {
            source: self.source.clone(),
            concurrency: self.concurrency.and_then(|n| usize::try_from(n).ok()),
            prune: self.prune.then_some(true),
        }
    }
}

async fn open_store(config: &StoreConfig) -> vitrine_storage::error::Result<StoreHandle> {
    let store: StoreHandle = match config {
        StoreConfig::S3 {
            bucket,
            region,
            endpoint,
            key_id,
            key_secret,
            prefix,
            public_url,
        } => Arc::new(
            S3Backend::new(
                "s3",
                bucket,
                prefix.clone(),
                region,
                endpoint.clone(),
                public_url.clone(),
                key_id,
                key_secret.expose(),
            )
            .await?,
        ),
        StoreConfig::Local { root, public_url } => Arc::new(LocalBackend::new("local", root, public_url.clone())?),
    };
    store.verify().await?;
    Ok(store)
}

async fn run(cli: &Cli) -> Result<RunReport, exn::Exn<ErrorKind>> {
    let config = Config::load(cli.config.as_deref(), &cli.overrides()).or_raise(|| ErrorKind::Config)?;
    let Some(store_config) = &config.store else {
        exn::bail!(ErrorKind::Config);
    };
    let store = open_store(store_config).await.or_raise(|| ErrorKind::Store)?;
    tracing::info!(
        store = store.name(),
        source = %config.source.display(),
        dry_run = cli.dry_run,
        "Starting ingestion"
    );

    let ffmpeg = match Ffmpeg::discover() {
        Ok(ffmpeg) => Some(Arc::new(ffmpeg)),
        Err(err) => {
            tracing::warn!(error = %err, "ffmpeg not available; videos will fail to process");
            None
        },
    };
    let generator = Arc::new(CodecGenerator::new(config.derivatives.clone(), ffmpeg));
    let options = Options {
        concurrency: config.pipeline.concurrency,
        dry_run: cli.dry_run,
        prune: config.prune,
        temp_root: config.pipeline.temp_dir.clone(),
    };
    let pipeline = Pipeline::new(store, generator, CaptureDates::standard(), options);
    pipeline.run(&config.source).await.or_raise(|| ErrorKind::Run)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli.default_filter())))
        .with_writer(std::io::stderr)
        .init();

    match run(&cli).await {
        Ok(report) => {
            println!("{report}");
            for failure in &report.failures {
                println!("  {failure}");
            }
            ExitCode::SUCCESS
        },
        Err(err) => {
            tracing::error!(error = ?err, "Run aborted");
            ExitCode::FAILURE
        },
    }
}
