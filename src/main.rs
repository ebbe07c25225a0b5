use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

mod api;
mod config;
mod events;
mod export;
mod images;
mod orchestrator;
mod prompt;
mod providers;

use config::AppCfg;
use events::RunEvent;
use images::{InlineImage, LOGO_SOFT_LIMIT, PRODUCT_SOFT_LIMIT};
use orchestrator::{start_batch, BatchParams, BatchRequest, Session};
use prompt::{AdFields, AspectRatio, Currency, Language, Template};
use providers::{AdCopyGenerator, AdImageGenerator, GeminiProvider, MockProvider};

#[derive(Parser)]
#[command(
    name = "adforge",
    version,
    about = "Branded ad-image generation from a product photo"
)]
struct Cli {
    /// Path to a YAML config file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Provider override: gemini | mock.
    #[arg(long, global = true)]
    provider: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP API for the browser frontend.
    Serve {
        #[arg(long)]
        bind: Option<String>,
    },
    /// Generate a batch of ad images from the command line.
    Generate(GenerateArgs),
    /// Suggest ad copy for a product description.
    Copy {
        #[arg(long)]
        description: String,
        #[arg(long, default_value = "en")]
        language: Language,
    },
}

#[derive(Args)]
struct GenerateArgs {
    /// Product photo (PNG or JPEG).
    #[arg(long)]
    product: PathBuf,
    /// Optional logo image, rendered subordinate to the product.
    #[arg(long)]
    logo: Option<PathBuf>,
    #[arg(long)]
    headline: String,
    #[arg(long, default_value = "")]
    subheadline: String,
    #[arg(long, default_value = "")]
    price: String,
    #[arg(long, default_value = "")]
    discount: String,
    #[arg(long, default_value = "")]
    cta: String,
    #[arg(long, default_value = "IDR")]
    currency: Currency,
    #[arg(long, default_value = "standard")]
    template: Template,
    /// Comma-separated aspect ratios, e.g. 1:1,16:9.
    #[arg(long, value_delimiter = ',', default_value = "1:1")]
    ratios: Vec<AspectRatio>,
    #[arg(long, default_value_t = 1)]
    batch_size: u32,
    #[arg(long, default_value = "#1d4ed8")]
    brand_color: String,
    /// Ask for a subtle brand watermark in the artwork.
    #[arg(long)]
    watermark: bool,
    /// Output directory; defaults to out/run-<timestamp>.
    #[arg(long)]
    out: Option<PathBuf>,
    /// Also write a zip archive of the batch.
    #[arg(long)]
    zip: bool,
}

fn default_out_dir() -> PathBuf {
    PathBuf::from("out").join(format!("run-{}", Utc::now().format("%Y%m%d_%H%M%S")))
}

fn build_providers(cfg: &AppCfg) -> (Arc<dyn AdCopyGenerator>, Arc<dyn AdImageGenerator>) {
    match cfg.provider.kind.as_str() {
        "mock" => {
            let provider = Arc::new(MockProvider);
            let copy: Arc<dyn AdCopyGenerator> = provider.clone();
            let images: Arc<dyn AdImageGenerator> = provider;
            (copy, images)
        }
        _ => {
            let key = cfg.api_key().unwrap_or_else(|| {
                tracing::warn!(
                    "{} is not set; generation requests will fail until it is provided",
                    cfg.provider.api_key_env
                );
                String::new()
            });
            let provider = Arc::new(GeminiProvider::new(
                key,
                cfg.provider.text_model.clone(),
                cfg.provider.image_model.clone(),
            ));
            let copy: Arc<dyn AdCopyGenerator> = provider.clone();
            let images: Arc<dyn AdImageGenerator> = provider;
            (copy, images)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut cfg = AppCfg::load(cli.config.as_deref())?;
    if let Some(kind) = cli.provider {
        cfg.provider.kind = kind;
    }

    match cli.command {
        Command::Serve { bind } => {
            if let Some(bind) = bind {
                cfg.server.bind = bind;
            }
            let (copy, images) = build_providers(&cfg);
            api::serve(cfg, copy, images).await
        }
        Command::Copy {
            description,
            language,
        } => {
            let (copy, _images) = build_providers(&cfg);
            let suggestion = copy
                .suggest(&description, language)
                .await
                .map_err(|e| anyhow::anyhow!(e.user_message()))?;
            println!("{}", serde_json::to_string_pretty(&suggestion)?);
            Ok(())
        }
        Command::Generate(args) => {
            let (_copy, images) = build_providers(&cfg);
            run_generate(args, &cfg, images).await
        }
    }
}

async fn run_generate(
    args: GenerateArgs,
    cfg: &AppCfg,
    provider: Arc<dyn AdImageGenerator>,
) -> Result<()> {
    let out_dir = args.out.clone().unwrap_or_else(default_out_dir);
    tokio::fs::create_dir_all(&out_dir)
        .await
        .with_context(|| format!("failed to create output directory {}", out_dir.display()))?;

    // Source images are read once here; every task in the batch shares the
    // same encoded payloads.
    let product = InlineImage::read(&args.product, PRODUCT_SOFT_LIMIT, "product").await?;
    let logo = match &args.logo {
        Some(path) => Some(InlineImage::read(path, LOGO_SOFT_LIMIT, "logo").await?),
        None => None,
    };

    let request = BatchRequest {
        fields: AdFields {
            headline: args.headline,
            subheadline: args.subheadline,
            price: args.price,
            discount: args.discount,
            cta: args.cta,
            currency: args.currency,
        },
        template: args.template,
        brand_color: args.brand_color,
        watermark: args.watermark,
        ratios: args.ratios,
        batch_size: args.batch_size,
        product,
        logo,
    };

    let session = Arc::new(Mutex::new(Session::default()));
    let (tx, _rx) = broadcast::channel::<RunEvent>(256);
    let mut rx = tx.subscribe();

    let handle = start_batch(
        provider,
        session.clone(),
        request,
        BatchParams {
            pacing: cfg.pacing(),
        },
        Some(tx.clone()),
    )?;

    let pb = ProgressBar::new(handle.total);
    pb.set_style(
        ProgressStyle::with_template("[{bar:40.cyan/blue}] {pos}/{len} {msg}")?
            .progress_chars("#>-"),
    );

    let pb_task = pb.clone();
    let listener = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(RunEvent::Progress {
                    dispatched, total, ..
                }) => {
                    pb_task.set_message(format!("generating {dispatched}/{total}"));
                }
                Ok(RunEvent::ResultReady { seq, ratio, .. }) => {
                    pb_task.set_position(seq);
                    pb_task.set_message(format!("{ratio} ready"));
                }
                Ok(RunEvent::Failed { error, .. }) => {
                    pb_task.abandon_with_message(error);
                }
                Ok(RunEvent::Finished { .. }) => {
                    pb_task.finish_with_message("done");
                }
                Ok(RunEvent::Started { .. }) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    handle.task.await.context("batch task panicked")?;
    drop(tx);
    listener.await.ok();

    let (results, error, prefix) = {
        let s = session.lock();
        (s.results.clone(), s.error.clone(), s.brand_prefix.clone())
    };

    for (i, result) in results.iter().enumerate() {
        let name = export::archive_entry_name(&prefix, result.ratio, i + 1);
        tokio::fs::write(out_dir.join(&name), result.image.decode()?)
            .await
            .with_context(|| format!("failed to write {name}"))?;
    }
    if args.zip && !results.is_empty() {
        let bytes = export::build_archive(&prefix, &results)?;
        let name = export::archive_name(&prefix);
        tokio::fs::write(out_dir.join(&name), bytes)
            .await
            .with_context(|| format!("failed to write {name}"))?;
    }

    if let Some(error) = error {
        bail!(
            "batch failed after {} of {} images: {error}",
            results.len(),
            handle.total
        );
    }
    println!("Wrote {} images to {}", results.len(), out_dir.display());
    Ok(())
}
