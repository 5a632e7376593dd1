use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tourney_core::ReviewKind;
use tourney_sync::{Pipeline, PipelineConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "tourney-cli")]
#[command(about = "Tournament source ingestion command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Sweep every active source, or one registered source.
    Sweep {
        #[arg(long)]
        source: Option<String>,
    },
    /// Search for official URLs of tournaments that lack one.
    DiscoverUrls {
        #[arg(long, default_value_t = 25)]
        limit: usize,
    },
    /// Rebuild score aggregates for one review kind, or all of them.
    RecomputeScores { kind: Option<String> },
    /// Re-resolve dead domains whose revisit window has passed.
    RevisitDomains,
    /// Upsert sources from a YAML manifest (defaults to `sources.yaml`).
    SeedSources {
        #[arg(long)]
        file: Option<std::path::PathBuf>,
    },
    /// Mark CHILD as a later occurrence of PARENT.
    LinkSeries { child: Uuid, parent: Uuid },
    Migrate,
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tourney=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn pipeline(config: PipelineConfig) -> Result<Pipeline> {
    let store = tourney_sync::connect_store(&config).await?;
    Pipeline::from_config(config, store)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    tracing::debug!(command = ?cli.command, "starting");
    let config = PipelineConfig::load();

    match cli.command.unwrap_or(Commands::Sweep { source: None }) {
        Commands::Sweep { source } => {
            let pipeline = pipeline(config).await?;
            let summary = match source {
                Some(url) => {
                    let record = pipeline
                        .registry
                        .get_by_url(&url)
                        .await?
                        .with_context(|| format!("source not registered: {url}"))?;
                    pipeline.sweep.run_sources(vec![record]).await?
                }
                None => pipeline.sweep.run_once().await?,
            };
            println!(
                "sweep complete: run_id={} sources={} failed={} inserted={} updated={} reports={}",
                summary.run_id,
                summary.processed,
                summary.failed,
                summary.inserted,
                summary.updated,
                summary.reports_dir
            );
        }
        Commands::DiscoverUrls { limit } => {
            let pipeline = pipeline(config).await?;
            let summary = pipeline.candidates.discover_urls_batch(limit).await?;
            println!(
                "url discovery complete: processed={} candidates={} auto_applied={} failed={}",
                summary.processed, summary.candidates_stored, summary.auto_applied, summary.failed
            );
        }
        Commands::RecomputeScores { kind } => {
            let pipeline = pipeline(config).await?;
            let summaries = match kind {
                Some(kind) => {
                    let kind: ReviewKind = kind.parse()?;
                    vec![pipeline.scores.recompute(kind).await?]
                }
                None => pipeline.scores.recompute_all().await?,
            };
            for s in summaries {
                println!(
                    "scores rebuilt: kind={} processed={} upserted={} deleted={}",
                    s.kind, s.processed, s.upserted, s.deleted
                );
            }
        }
        Commands::RevisitDomains => {
            let pipeline = pipeline(config).await?;
            let s = pipeline.domains.revisit().await?;
            println!(
                "dead domains revisited: checked={} recovered={} still_dead={} skipped={}",
                s.checked, s.recovered, s.still_dead, s.skipped
            );
        }
        Commands::SeedSources { file } => {
            let path = file.unwrap_or_else(|| config.sources_manifest());
            let pipeline = pipeline(config).await?;
            let s = pipeline.registry.seed_from_yaml(&path).await?;
            println!("sources seeded: seen={} upserted={} failed={}", s.seen, s.upserted, s.failed);
        }
        Commands::LinkSeries { child, parent } => {
            let pipeline = pipeline(config).await?;
            let linked = pipeline.resolver.link_series(child, parent).await?;
            println!("linked {} to series {}", linked.slug, parent);
        }
        Commands::Migrate => {
            let store = tourney_sync::connect_store(&config).await?;
            store.migrate().await.context("running migrations")?;
            println!("migrations applied to {}", tourney_sync::redact(&config.database_url));
        }
        Commands::Serve { port } => {
            let port = port.unwrap_or(config.web_port);
            let pipeline = pipeline(config).await?;
            tourney_web::serve(pipeline, port).await?;
        }
    }

    Ok(())
}
