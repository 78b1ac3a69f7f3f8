mod args;

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use args::{collect_filters, Cli, Command};
use async_openai::{config::OpenAIConfig, Client};
use clap::Parser;
use common::{
    storage::{qdrant::QdrantStore, vector_store::VectorStore},
    utils::{
        config::{get_config, AppConfig},
        embedding::{Embedder, EmbeddingProvider},
        generation::GenerationProvider,
    },
};
use retrieval_pipeline::{
    reranking::{RelevanceScorer, RerankerPool},
    AnswerPipeline, AnswerRequest, AnswerRun,
};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Get config
    let config = get_config().context("failed to load configuration")?;

    // Set up tracing; RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str()));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init()
        .ok();

    let store = QdrantStore::from_config(&config)?;

    match cli.command {
        Command::Ask {
            query,
            filters,
            summary,
            json,
            timings,
        } => {
            let pipeline = build_pipeline(&config, Arc::new(store)).await?;
            let mut request = AnswerRequest::new(query).with_filters(collect_filters(filters));
            if let Some(summary) = summary {
                request = request.with_summary(summary);
            }

            let run = pipeline.answer_with_timings(request).await?;
            print_answer(&run, json, timings)?;
        }
        Command::Stats => {
            match store.collection_info(&config.collection_name).await? {
                Some(info) => {
                    println!("collection:   {}", info.name);
                    println!("status:       {}", info.status);
                    println!("vector size:  {}", info.vector_size);
                    println!("points:       {}", info.points_count);
                }
                None => println!("collection `{}` does not exist", config.collection_name),
            }
        }
        Command::EnsureCollection => {
            let embedder = EmbeddingProvider::from_config(&config, openai_client(&config)).await?;
            let dimension = embedder.dimension();

            if let Some(existing) = store.collection_info(&config.collection_name).await? {
                if existing.vector_size != dimension {
                    bail!(
                        "collection `{}` stores {}-dimensional vectors but {} produces {}",
                        existing.name,
                        existing.vector_size,
                        embedder.model_code(),
                        dimension
                    );
                }
            }

            store
                .ensure_collection(&config.collection_name, dimension)
                .await?;
            info!(
                collection = %config.collection_name,
                dimension,
                "Collection ready"
            );
        }
        Command::DeleteCollection { yes } => {
            if !yes {
                bail!(
                    "refusing to delete `{}` without --yes",
                    config.collection_name
                );
            }
            store.delete_collection(&config.collection_name).await?;
            info!(collection = %config.collection_name, "Collection deleted");
        }
    }

    Ok(())
}

fn openai_client(config: &AppConfig) -> Option<Arc<Client<OpenAIConfig>>> {
    config.openai_key().map(|key| {
        Arc::new(Client::with_config(
            OpenAIConfig::new()
                .with_api_key(key)
                .with_api_base(&config.openai_base_url),
        ))
    })
}

/// Providers are chosen here, once, and shared for the life of the process.
async fn build_pipeline(config: &AppConfig, store: Arc<dyn VectorStore>) -> Result<AnswerPipeline> {
    let openai_client = openai_client(config);

    let embedder = EmbeddingProvider::from_config(config, openai_client.clone()).await?;
    let generator = GenerationProvider::from_config(config, openai_client)?;

    let scorer = RerankerPool::maybe_from_config(config)?
        .map(|pool| pool as Arc<dyn RelevanceScorer>);
    info!(reranking = scorer.is_some(), "Reranker initialized");

    Ok(AnswerPipeline::from_config(
        config,
        Arc::new(embedder),
        Arc::new(generator),
        store,
        scorer,
    ))
}

fn print_answer(run: &AnswerRun, json: bool, timings: bool) -> Result<()> {
    let stage_ms: Vec<(String, u128)> = run
        .stage_timings
        .clone()
        .into_vec()
        .into_iter()
        .map(|(kind, duration)| (format!("{kind:?}"), duration.as_millis()))
        .collect();

    if json {
        let mut output = serde_json::json!({ "result": run.result });
        if timings {
            output["stage_timings_ms"] = serde_json::json!(stage_ms);
            output["cache_hit"] = serde_json::json!(run.cache_hit);
        }
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    let result = &run.result;
    println!("{}\n", result.answer_text);

    if !result.sources.is_empty() {
        println!("Sources:");
        for (index, source) in result.sources.iter().enumerate() {
            let section = source
                .section
                .as_deref()
                .map(|s| format!(" > {s}"))
                .unwrap_or_default();
            println!(
                "  [{}] {}{} ({:.2})\n      {}",
                index + 1,
                source.title,
                section,
                source.score,
                source.url
            );
        }
        println!();
    }

    println!("Confidence: {:?}", result.confidence);

    if !result.follow_up_questions.is_empty() {
        println!("\nYou might also ask:");
        for question in &result.follow_up_questions {
            println!("  - {question}");
        }
    }

    if timings {
        println!("\nTimings (cache hit: {}):", run.cache_hit);
        for (stage, ms) in &stage_ms {
            println!("  {stage:<12} {ms} ms");
        }
        println!("  {:<12} {} ms", "Total", run.stage_timings.total().as_millis());
    }

    Ok(())
}
