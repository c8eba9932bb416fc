//! Text encoders
//!
//! The encoder turns texts into vectors batch by batch. With a spill
//! directory each batch is written to a scratch file as soon as it is
//! encoded, so only one batch of vectors is held in memory while the
//! backend runs; the files are read back in order once every batch is done.

use super::{FitTransform, ModelError, ModelInput, ModelOutput, ModelResult, TransformOptions};
use crate::config::{EmbeddingConfig, HashingArgs};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Trait for embedding text into vectors.
///
/// Implementations handle model loading and inference.
pub trait Embedder: Send + Sync {
    /// Embed a batch of texts, returning one vector per text.
    fn embed_batch(&self, texts: &[&str]) -> ModelResult<Vec<Vec<f32>>>;
}

/// Deterministic feature-hashing embedder.
///
/// Hashes whole words and padded character n-grams into a fixed number of
/// signed buckets, then L2-normalizes. Texts sharing vocabulary land close
/// together under cosine distance.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    args: HashingArgs,
}

/// 64-bit FNV-1a. Stable across platforms and releases, unlike `DefaultHasher`.
fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

impl HashingEmbedder {
    pub fn new(args: HashingArgs) -> Self {
        Self { args }
    }

    fn add_feature(&self, vector: &mut [f32], feature: &str, weight: f32) {
        let hash = fnv1a(feature.as_bytes());
        let bucket = (hash % vector.len() as u64) as usize;
        let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
        vector[bucket] += sign * weight;
    }

    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.args.dimensions];
        let lower = text.to_lowercase();

        for word in lower.split(|c: char| !c.is_alphanumeric()).filter(|w| !w.is_empty()) {
            self.add_feature(&mut vector, &format!("w:{}", word), 1.0);

            let padded: Vec<char> = format!("<{}>", word).chars().collect();
            if padded.len() >= self.args.ngram {
                for gram in padded.windows(self.args.ngram) {
                    let gram: String = gram.iter().collect();
                    self.add_feature(&mut vector, &format!("g:{}", gram), 0.5);
                }
            }
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

impl Embedder for HashingEmbedder {
    fn embed_batch(&self, texts: &[&str]) -> ModelResult<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

#[cfg(feature = "embeddings")]
mod fastembed_impl {
    use super::{Embedder, ModelError, ModelResult};
    use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
    use std::sync::Mutex;

    /// Production embedder backed by fastembed (ONNX Runtime).
    ///
    /// `TextEmbedding::embed` takes `&mut self`, hence the `Mutex`.
    pub struct FastEmbedEmbedder {
        model: Mutex<TextEmbedding>,
    }

    impl FastEmbedEmbedder {
        pub fn new(model: EmbeddingModel) -> ModelResult<Self> {
            let options = InitOptions::new(model).with_show_download_progress(false);
            let embedding = TextEmbedding::try_new(options)
                .map_err(|e| ModelError::Unavailable(e.to_string()))?;
            Ok(Self {
                model: Mutex::new(embedding),
            })
        }

        /// Resolve a model by its short name.
        pub fn from_name(name: &str) -> ModelResult<Self> {
            let model = match name {
                "nomic-embed-text-v1.5" => EmbeddingModel::NomicEmbedTextV15,
                "all-minilm-l6-v2" => EmbeddingModel::AllMiniLML6V2,
                "bge-small-en-v1.5" => EmbeddingModel::BGESmallENV15,
                other => {
                    return Err(ModelError::Unavailable(format!(
                        "unknown fastembed model '{}'",
                        other
                    )))
                }
            };
            Self::new(model)
        }
    }

    impl Embedder for FastEmbedEmbedder {
        fn embed_batch(&self, texts: &[&str]) -> ModelResult<Vec<Vec<f32>>> {
            if texts.is_empty() {
                return Ok(Vec::new());
            }
            let mut model = self
                .model
                .lock()
                .map_err(|_| ModelError::Backend("fastembed model lock poisoned".into()))?;
            model
                .embed(texts.to_vec(), None)
                .map_err(|e| ModelError::Backend(e.to_string()))
        }
    }
}

#[cfg(feature = "embeddings")]
pub use fastembed_impl::FastEmbedEmbedder;

/// Embedding-stage model. Stateless apart from its configuration; the
/// backend is built on first use and not persisted.
#[derive(Serialize, Deserialize)]
pub struct Encoder {
    config: EmbeddingConfig,
    #[serde(skip)]
    backend: OnceLock<Box<dyn Embedder>>,
}

impl fmt::Debug for Encoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Encoder")
            .field("config", &self.config)
            .field("loaded", &self.backend.get().is_some())
            .finish()
    }
}

impl Encoder {
    pub fn new(config: EmbeddingConfig) -> Self {
        Self {
            config,
            backend: OnceLock::new(),
        }
    }

    /// Use a caller-supplied backend instead of the configured one.
    pub fn with_backend(config: EmbeddingConfig, backend: Box<dyn Embedder>) -> Self {
        let encoder = Self::new(config);
        let _ = encoder.backend.set(backend);
        encoder
    }

    pub fn config(&self) -> &EmbeddingConfig {
        &self.config
    }

    fn build_backend(&self) -> ModelResult<Box<dyn Embedder>> {
        match &self.config {
            EmbeddingConfig::Hashing(args) => Ok(Box::new(HashingEmbedder::new(args.clone()))),
            #[cfg(feature = "embeddings")]
            EmbeddingConfig::FastEmbed(args) => Ok(Box::new(FastEmbedEmbedder::from_name(&args.model)?)),
            #[cfg(not(feature = "embeddings"))]
            EmbeddingConfig::FastEmbed(args) => Err(ModelError::Unavailable(format!(
                "fastembed model '{}' requires the `embeddings` feature",
                args.model
            ))),
        }
    }

    fn backend(&self) -> ModelResult<&dyn Embedder> {
        if self.backend.get().is_none() {
            let built = self.build_backend()?;
            // A concurrent caller may have won the race; either backend is equivalent.
            let _ = self.backend.set(built);
        }
        self.backend
            .get()
            .map(|b| &**b)
            .ok_or_else(|| ModelError::Unavailable("encoder backend failed to initialize".into()))
    }

    fn embed_chunk(backend: &dyn Embedder, chunk: &[String]) -> ModelResult<Vec<Vec<f32>>> {
        let texts: Vec<&str> = chunk.iter().map(String::as_str).collect();
        let vectors = backend.embed_batch(&texts)?;
        if vectors.len() != chunk.len() {
            return Err(ModelError::Backend(format!(
                "backend returned {} vectors for {} texts",
                vectors.len(),
                chunk.len()
            )));
        }
        Ok(vectors)
    }

    fn encode_in_memory(
        backend: &dyn Embedder,
        texts: &[String],
        batch_size: usize,
    ) -> ModelResult<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(batch_size) {
            out.extend(Self::embed_chunk(backend, chunk)?);
        }
        Ok(out)
    }

    fn encode_spilled(
        backend: &dyn Embedder,
        texts: &[String],
        batch_size: usize,
        spill_root: &Path,
    ) -> ModelResult<Vec<Vec<f32>>> {
        let scratch = ScratchDir::create(spill_root)?;
        let mut files = Vec::new();

        for (index, chunk) in texts.chunks(batch_size).enumerate() {
            let vectors = Self::embed_chunk(backend, chunk)?;
            let path = scratch.path.join(format!("batch_{:06}.bin", index));
            write_batch(&path, &vectors)?;
            tracing::debug!(batch = index, rows = vectors.len(), "spilled embedding batch");
            files.push(path);
        }

        let mut out = Vec::with_capacity(texts.len());
        for path in &files {
            out.extend(read_batch(path)?);
        }
        Ok(out)
    }
}

impl FitTransform for Encoder {
    fn is_fitted(&self) -> bool {
        true
    }

    fn needs_fit(&self) -> bool {
        false
    }

    fn fit(&mut self, input: ModelInput<'_>) -> ModelResult<()> {
        if input.is_empty() {
            return Err(ModelError::EmptyInput);
        }
        Ok(())
    }

    fn transform(&self, input: ModelInput<'_>, options: &TransformOptions) -> ModelResult<ModelOutput> {
        let texts = match input {
            ModelInput::Texts(texts) => texts,
            other => {
                return Err(ModelError::InputMismatch(format!(
                    "encoder expects texts, got {}",
                    other.kind()
                )))
            }
        };
        if texts.is_empty() {
            return Err(ModelError::EmptyInput);
        }

        let backend = self.backend()?;
        let batch_size = options.batch_size.max(1);
        let vectors = match &options.spill_dir {
            Some(dir) => Self::encode_spilled(backend, texts, batch_size, dir)?,
            None => Self::encode_in_memory(backend, texts, batch_size)?,
        };
        Ok(ModelOutput::Vectors(vectors))
    }
}

/// A per-run scratch directory, removed on drop.
struct ScratchDir {
    path: PathBuf,
}

impl ScratchDir {
    fn create(root: &Path) -> std::io::Result<Self> {
        let path = root.join(format!("embed-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&path)?;
        Ok(Self { path })
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir_all(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to remove scratch dir");
        }
    }
}

/// Batch file: row count and dimension as little-endian u32, then the rows
/// as little-endian f32.
fn write_batch(path: &Path, vectors: &[Vec<f32>]) -> ModelResult<()> {
    let dim = vectors.first().map(Vec::len).unwrap_or(0);
    let mut writer = BufWriter::new(File::create(path)?);
    writer.write_all(&(vectors.len() as u32).to_le_bytes())?;
    writer.write_all(&(dim as u32).to_le_bytes())?;
    for vector in vectors {
        if vector.len() != dim {
            return Err(ModelError::Dimension {
                expected: dim,
                found: vector.len(),
            });
        }
        for value in vector {
            writer.write_all(&value.to_le_bytes())?;
        }
    }
    writer.flush()?;
    Ok(())
}

fn read_batch(path: &Path) -> ModelResult<Vec<Vec<f32>>> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut word = [0u8; 4];

    reader.read_exact(&mut word)?;
    let rows = u32::from_le_bytes(word) as usize;
    reader.read_exact(&mut word)?;
    let dim = u32::from_le_bytes(word) as usize;

    let mut out = Vec::with_capacity(rows);
    for _ in 0..rows {
        let mut vector = Vec::with_capacity(dim);
        for _ in 0..dim {
            reader.read_exact(&mut word)?;
            vector.push(f32::from_le_bytes(word));
        }
        out.push(vector);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn texts(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn cosine(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(x, y)| x * y).sum()
    }

    fn encode(encoder: &Encoder, input: &[String], options: &TransformOptions) -> Vec<Vec<f32>> {
        match encoder.transform(ModelInput::Texts(input), options).unwrap() {
            ModelOutput::Vectors(v) => v,
            other => panic!("unexpected output {:?}", other),
        }
    }

    #[test]
    fn hashing_is_deterministic_and_normalized() {
        let embedder = HashingEmbedder::new(HashingArgs::default());
        let a = embedder.embed_one("The quick brown fox");
        let b = embedder.embed_one("The quick brown fox");
        assert_eq!(a, b);
        assert_eq!(a.len(), 256);
        let norm: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn shared_vocabulary_is_closer() {
        let embedder = HashingEmbedder::new(HashingArgs::default());
        let base = embedder.embed_one("the cat sat on the mat");
        let near = embedder.embed_one("the cat sat on a mat");
        let far = embedder.embed_one("quantum chromodynamics lecture notes");
        assert!(cosine(&base, &near) > cosine(&base, &far));
    }

    #[test]
    fn empty_text_embeds_to_zero_vector() {
        let embedder = HashingEmbedder::new(HashingArgs {
            dimensions: 8,
            ngram: 3,
        });
        assert_eq!(embedder.embed_one("  ... "), vec![0.0; 8]);
    }

    #[test]
    fn batch_size_does_not_change_output() {
        let encoder = Encoder::new(EmbeddingConfig::default());
        let input = texts(&["alpha", "beta gamma", "delta", "epsilon zeta eta", "theta"]);
        let whole = encode(&encoder, &input, &TransformOptions { batch_size: 100, spill_dir: None });
        let batched = encode(&encoder, &input, &TransformOptions { batch_size: 2, spill_dir: None });
        assert_eq!(whole, batched);
    }

    #[test]
    fn spilled_output_is_bit_identical_and_cleaned_up() {
        let dir = tempdir().unwrap();
        let encoder = Encoder::new(EmbeddingConfig::default());
        let input = texts(&["one", "two three", "four", "five six seven", "eight", "nine"]);

        let memory = encode(&encoder, &input, &TransformOptions { batch_size: 4, spill_dir: None });
        let spilled = encode(
            &encoder,
            &input,
            &TransformOptions {
                batch_size: 4,
                spill_dir: Some(dir.path().to_path_buf()),
            },
        );

        let bits = |vs: &[Vec<f32>]| -> Vec<Vec<u32>> {
            vs.iter().map(|v| v.iter().map(|f| f.to_bits()).collect()).collect()
        };
        assert_eq!(bits(&memory), bits(&spilled));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn empty_input_is_an_error() {
        let encoder = Encoder::new(EmbeddingConfig::default());
        let err = encoder
            .transform(ModelInput::Texts(&[]), &TransformOptions::default())
            .unwrap_err();
        assert!(matches!(err, ModelError::EmptyInput));
    }

    #[test]
    fn custom_backend_is_used() {
        struct Constant;
        impl Embedder for Constant {
            fn embed_batch(&self, texts: &[&str]) -> ModelResult<Vec<Vec<f32>>> {
                Ok(texts.iter().map(|_| vec![7.0, 7.0]).collect())
            }
        }

        let encoder = Encoder::with_backend(EmbeddingConfig::default(), Box::new(Constant));
        let out = encode(&encoder, &texts(&["x", "y"]), &TransformOptions::default());
        assert_eq!(out, vec![vec![7.0, 7.0], vec![7.0, 7.0]]);
    }

    #[test]
    fn short_backend_output_is_rejected() {
        struct Short;
        impl Embedder for Short {
            fn embed_batch(&self, _texts: &[&str]) -> ModelResult<Vec<Vec<f32>>> {
                Ok(vec![vec![1.0]])
            }
        }

        let encoder = Encoder::with_backend(EmbeddingConfig::default(), Box::new(Short));
        let err = encoder
            .transform(ModelInput::Texts(&texts(&["a", "b"])), &TransformOptions::default())
            .unwrap_err();
        assert!(matches!(err, ModelError::Backend(_)));
    }
}
