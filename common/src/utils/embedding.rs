use std::{
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
};

use anyhow::{anyhow, Context};
use async_openai::{config::OpenAIConfig, types::CreateEmbeddingRequestArgs, Client};
use async_trait::async_trait;
use fastembed::{EmbeddingModel, ModelTrait, TextEmbedding, TextInitOptions};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use crate::{
    error::AppError,
    utils::{
        backoff::CallPolicy,
        config::{AppConfig, EmbeddingBackend},
    },
};

/// Text to fixed-length vector capability.
#[async_trait]
pub trait Embedder: Send + Sync {
    fn model_code(&self) -> String;
    fn dimension(&self) -> usize;
    async fn embed(&self, text: &str) -> Result<Vec<f32>, AppError>;
    async fn embed_batch(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, AppError>;
}

impl FromStr for EmbeddingBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAI),
            "hashed" => Ok(Self::Hashed),
            "fastembed" | "fast-embed" | "fast" => Ok(Self::FastEmbed),
            other => Err(anyhow!(
                "unknown embedding backend '{other}'. Expected 'openai', 'hashed', or 'fastembed'."
            )),
        }
    }
}

/// Local model knobs for the FastEmbed backend.
#[derive(Debug, Clone, Default)]
pub struct FastEmbedSettings {
    pub model: Option<String>,
    pub cache_dir: Option<PathBuf>,
    pub show_download_progress: bool,
    pub max_length: Option<usize>,
}

impl From<&AppConfig> for FastEmbedSettings {
    fn from(config: &AppConfig) -> Self {
        let cache_dir = config
            .fastembed_cache_dir
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| Path::new(&config.data_dir).join("fastembed").join("embedding"));

        Self {
            model: config.fastembed_model.clone(),
            cache_dir: Some(cache_dir),
            show_download_progress: config.fastembed_show_download_progress.unwrap_or(true),
            max_length: config.fastembed_max_length,
        }
    }
}

#[derive(Clone)]
pub struct EmbeddingProvider {
    inner: EmbeddingInner,
}

#[derive(Clone)]
enum EmbeddingInner {
    OpenAI {
        client: Arc<Client<OpenAIConfig>>,
        model: String,
        dimensions: u32,
        policy: CallPolicy,
    },
    Hashed {
        dimension: usize,
    },
    FastEmbed {
        model: Arc<Mutex<TextEmbedding>>,
        model_name: EmbeddingModel,
        dimension: usize,
    },
}

impl EmbeddingProvider {
    /// Select the backend once, at startup.
    pub async fn from_config(
        config: &AppConfig,
        openai_client: Option<Arc<Client<OpenAIConfig>>>,
    ) -> Result<Self, AppError> {
        let provider = match config.embedding_backend {
            EmbeddingBackend::OpenAI => {
                let client = openai_client.ok_or_else(|| {
                    AppError::Configuration(
                        "OpenAI embedding backend selected without an OpenAI client".into(),
                    )
                })?;
                Self::new_openai(
                    client,
                    config.embedding_model.clone(),
                    config.embedding_dimensions,
                    CallPolicy::from_config(config),
                )
            }
            EmbeddingBackend::FastEmbed => Self::new_fastembed(FastEmbedSettings::from(config))
                .await
                .map_err(|err| AppError::Configuration(format!("{err:#}")))?,
            EmbeddingBackend::Hashed => {
                Self::new_hashed(config.embedding_dimensions as usize)
            }
        };

        info!(
            backend = provider.backend_label(),
            dimension = provider.dimension(),
            "Embedding provider initialized"
        );
        Ok(provider)
    }

    pub fn backend_label(&self) -> &'static str {
        match self.inner {
            EmbeddingInner::Hashed { .. } => "hashed",
            EmbeddingInner::FastEmbed { .. } => "fastembed",
            EmbeddingInner::OpenAI { .. } => "openai",
        }
    }

    pub fn new_openai(
        client: Arc<Client<OpenAIConfig>>,
        model: String,
        dimensions: u32,
        policy: CallPolicy,
    ) -> Self {
        EmbeddingProvider {
            inner: EmbeddingInner::OpenAI {
                client,
                model,
                dimensions,
                policy,
            },
        }
    }

    pub async fn new_fastembed(settings: FastEmbedSettings) -> anyhow::Result<Self> {
        let model_name = if let Some(code) = settings.model {
            EmbeddingModel::from_str(&code).map_err(|err| anyhow!(err))?
        } else {
            EmbeddingModel::default()
        };

        let mut options = TextInitOptions::new(model_name.clone())
            .with_show_download_progress(settings.show_download_progress);
        if let Some(cache_dir) = settings.cache_dir {
            options = options.with_cache_dir(cache_dir);
        }
        if let Some(max_length) = settings.max_length {
            options = options.with_max_length(max_length);
        }
        let model_name_for_task = model_name.clone();
        let model_name_code = model_name.to_string();

        let (model, dimension) = tokio::task::spawn_blocking(move || -> anyhow::Result<_> {
            let model =
                TextEmbedding::try_new(options).context("initialising FastEmbed text model")?;
            let info = EmbeddingModel::get_model_info(&model_name_for_task)
                .ok_or_else(|| anyhow!("FastEmbed model metadata missing for {model_name_code}"))?;
            Ok((model, info.dim))
        })
        .await
        .context("joining FastEmbed initialisation task")??;

        Ok(EmbeddingProvider {
            inner: EmbeddingInner::FastEmbed {
                model: Arc::new(Mutex::new(model)),
                model_name,
                dimension,
            },
        })
    }

    pub fn new_hashed(dimension: usize) -> Self {
        EmbeddingProvider {
            inner: EmbeddingInner::Hashed {
                dimension: dimension.max(1),
            },
        }
    }
}

#[async_trait]
impl Embedder for EmbeddingProvider {
    fn model_code(&self) -> String {
        match &self.inner {
            EmbeddingInner::FastEmbed { model_name, .. } => model_name.to_string(),
            EmbeddingInner::OpenAI { model, .. } => model.clone(),
            EmbeddingInner::Hashed { dimension } => format!("hashed-{dimension}"),
        }
    }

    fn dimension(&self) -> usize {
        match &self.inner {
            EmbeddingInner::Hashed { dimension } | EmbeddingInner::FastEmbed { dimension, .. } => {
                *dimension
            }
            EmbeddingInner::OpenAI { dimensions, .. } => *dimensions as usize,
        }
    }

    #[instrument(level = "debug", skip_all, fields(backend = self.backend_label()))]
    async fn embed(&self, text: &str) -> Result<Vec<f32>, AppError> {
        let mut vectors = self.embed_batch(vec![text.to_owned()]).await?;
        if vectors.is_empty() {
            return Err(AppError::LLMParsing(
                "No embedding data received for input".into(),
            ));
        }
        Ok(vectors.swap_remove(0))
    }

    async fn embed_batch(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, AppError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        match &self.inner {
            EmbeddingInner::Hashed { dimension } => Ok(texts
                .iter()
                .map(|text| hashed_embedding(text, *dimension))
                .collect()),
            EmbeddingInner::FastEmbed { model, .. } => {
                let model = model.clone();
                tokio::task::spawn_blocking(move || {
                    let mut guard = model.blocking_lock();
                    guard
                        .embed(texts, None)
                        .context("generating fastembed batch embeddings")
                })
                .await?
                .map_err(AppError::from)
            }
            EmbeddingInner::OpenAI {
                client,
                model,
                dimensions,
                policy,
            } => {
                let expected = texts.len();
                let embeddings = policy
                    .run("openai_embedding", || {
                        let texts = texts.clone();
                        async move {
                            let request = CreateEmbeddingRequestArgs::default()
                                .model(model.clone())
                                .input(texts)
                                .dimensions(*dimensions)
                                .build()?;

                            let response = client.embeddings().create(request).await?;
                            Ok::<_, AppError>(
                                response
                                    .data
                                    .into_iter()
                                    .map(|item| item.embedding)
                                    .collect::<Vec<Vec<f32>>>(),
                            )
                        }
                    })
                    .await?;

                if embeddings.len() != expected {
                    return Err(AppError::LLMParsing(format!(
                        "Expected {expected} embeddings from OpenAI, received {}",
                        embeddings.len()
                    )));
                }
                debug!(count = embeddings.len(), "Embeddings created");
                Ok(embeddings)
            }
        }
    }
}

/// Signed feature hashing over lowercase word tokens, L2-normalised.
/// Buckets come from SHA-256, so vectors are stable across processes and
/// toolchains.
fn hashed_embedding(text: &str, dimension: usize) -> Vec<f32> {
    let mut vector = vec![0.0f32; dimension.max(1)];
    for token in tokens(text) {
        let (index, sign) = bucket(&token, vector.len());
        if let Some(slot) = vector.get_mut(index) {
            *slot += sign;
        }
    }

    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        vector.iter_mut().for_each(|value| *value /= norm);
    }
    vector
}

fn tokens(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(str::to_lowercase)
}

fn bucket(token: &str, dimension: usize) -> (usize, f32) {
    let digest = Sha256::digest(token.as_bytes());
    let mut head = [0u8; 8];
    for (dst, src) in head.iter_mut().zip(digest.iter()) {
        *dst = *src;
    }
    let index = u64::from_le_bytes(head) % dimension as u64;
    let sign = if digest.get(8).is_some_and(|byte| byte & 1 == 1) {
        -1.0
    } else {
        1.0
    };
    (index as usize, sign)
}

/// Cosine similarity of two vectors; zero when either is empty, zero-norm or
/// the lengths differ.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}
