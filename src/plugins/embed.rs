//! Embedding capability.
//!
//! Ships deterministic feature-hashing models so queries can produce vectors
//! without any external model server. Every model emits L2-normalized
//! vectors of the configured dimension, which makes them directly usable
//! with `vdb` under the cosine metric.

use base64::Engine as _;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;

use super::traits::{Args, Capability, FunctionTable, QueryContext};
use crate::config::EmbedConfig;
use crate::error::{Error, Result};
use crate::value::HostValue;

const FUNCTIONS: &[&str] = &["dimension", "embed", "embed_image", "models", "use_model"];

/// Built-in model names.
pub const MODELS: &[&str] = &["hash-words", "hash-ngrams"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HashModel {
    /// Whitespace tokens, lowercased.
    Words,
    /// Character trigrams of the lowercased text.
    Ngrams,
}

impl HashModel {
    fn from_name(name: &str) -> Result<Self> {
        match name {
            "hash-words" => Ok(Self::Words),
            "hash-ngrams" => Ok(Self::Ngrams),
            _ => Err(Error::invalid_argument(format!(
                "unknown model '{name}', available: {}",
                MODELS.join(", ")
            ))),
        }
    }

    fn features(self, text: &str) -> Vec<String> {
        let lowered = text.to_lowercase();
        match self {
            Self::Words => lowered.split_whitespace().map(str::to_string).collect(),
            Self::Ngrams => {
                let chars: Vec<char> = lowered.chars().collect();
                if chars.len() < 3 {
                    return vec![lowered];
                }
                chars.windows(3).map(|w| w.iter().collect()).collect()
            }
        }
    }
}

/// Hash `features` into a signed bag of size `dimension`, then normalize.
fn hash_features<I, B>(features: I, dimension: usize) -> Vec<f32>
where
    I: IntoIterator<Item = B>,
    B: AsRef<[u8]>,
{
    let mut vector = vec![0.0f32; dimension];
    for feature in features {
        let digest = Sha256::digest(feature.as_ref());
        let mut bucket = [0u8; 8];
        bucket.copy_from_slice(&digest[..8]);
        let index = (u64::from_le_bytes(bucket) % dimension as u64) as usize;
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        vector[index] += sign;
    }

    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        vector.iter_mut().for_each(|x| *x /= norm);
    }
    vector
}

fn vector_value(vector: Vec<f32>) -> HostValue {
    HostValue::Sequence(vector.into_iter().map(HostValue::from).collect())
}

/// Image payloads arrive as base64 text or as a raw byte string. Binary
/// script strings are already base64 by the time they reach the host.
fn image_bytes(args: &Args) -> Result<Vec<u8>> {
    let raw = args.string(0, "image")?;
    match base64::engine::general_purpose::STANDARD.decode(raw.trim()) {
        Ok(decoded) => Ok(decoded),
        Err(_) => Ok(raw.into_bytes()),
    }
}

struct Models {
    dimension: usize,
    default_model: HashModel,
    /// Model chosen via `use_model`, per namespace.
    selected: RwLock<HashMap<String, HashModel>>,
}

impl Models {
    fn model_for(&self, namespace: &str) -> HashModel {
        self.selected
            .read()
            .get(namespace)
            .copied()
            .unwrap_or(self.default_model)
    }

    fn embed_text(&self, namespace: &str, text: &str) -> Vec<f32> {
        hash_features(self.model_for(namespace).features(text), self.dimension)
    }

    /// Raw image bytes, hashed in 16-byte chunks.
    fn embed_bytes(&self, bytes: &[u8]) -> Vec<f32> {
        hash_features(bytes.chunks(16), self.dimension)
    }

    fn select(&self, namespace: &str, name: &str) -> Result<()> {
        let model = HashModel::from_name(name)?;
        self.selected.write().insert(namespace.to_string(), model);
        tracing::info!(namespace = %namespace, model = %name, "Embedding model selected");
        Ok(())
    }
}

/// Text and image embeddings.
pub struct EmbedCapability {
    models: Arc<Models>,
}

impl EmbedCapability {
    pub fn new(config: EmbedConfig) -> Result<Self> {
        if config.dimension == 0 {
            return Err(Error::Config("embedding dimension must be positive".into()));
        }
        let default_model = HashModel::from_name(&config.default_model)
            .map_err(|e| Error::Config(e.to_string()))?;
        Ok(Self {
            models: Arc::new(Models {
                dimension: config.dimension,
                default_model,
                selected: RwLock::new(HashMap::new()),
            }),
        })
    }

    pub fn dimension(&self) -> usize {
        self.models.dimension
    }

    /// Embed `text` with the model selected for `namespace`.
    pub fn embed_text(&self, namespace: &str, text: &str) -> Vec<f32> {
        self.models.embed_text(namespace, text)
    }
}

impl Capability for EmbedCapability {
    fn capability_name(&self) -> &str {
        "embed"
    }

    fn description(&self) -> &str {
        "Deterministic text and image embeddings"
    }

    fn function_names(&self) -> &'static [&'static str] {
        FUNCTIONS
    }

    fn initialize(&self, _ctx: &QueryContext) -> Result<()> {
        Ok(())
    }

    fn exposed_functions(&self, ctx: &QueryContext) -> FunctionTable {
        let namespace: Arc<str> = Arc::from(ctx.namespace.as_str());
        let dimension = self.models.dimension;

        let (models, ns) = (Arc::clone(&self.models), Arc::clone(&namespace));
        let embed = move |args: Args| -> Result<HostValue> {
            let text = args.string(0, "text")?;
            Ok(vector_value(models.embed_text(&ns, &text)))
        };

        let models = Arc::clone(&self.models);
        let embed_image = move |args: Args| -> Result<HostValue> {
            Ok(vector_value(models.embed_bytes(&image_bytes(&args)?)))
        };

        let (models, ns) = (Arc::clone(&self.models), namespace);
        let use_model = move |args: Args| -> Result<HostValue> {
            models.select(&ns, &args.string(0, "name")?)?;
            Ok(HostValue::from(true))
        };

        FunctionTable::new()
            .with("embed", embed)
            .with("embed_image", embed_image)
            .with("models", |_| Ok(HostValue::from(MODELS.to_vec())))
            .with("use_model", use_model)
            .with("dimension", move |_| Ok(HostValue::from(dimension)))
    }
}

impl std::fmt::Debug for EmbedCapability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbedCapability")
            .field("dimension", &self.models.dimension)
            .field("default_model", &self.models.default_model)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn capability(dimension: usize) -> EmbedCapability {
        EmbedCapability::new(EmbedConfig {
            dimension,
            default_model: "hash-words".into(),
        })
        .unwrap()
    }

    fn functions(embed: &EmbedCapability, namespace: &str) -> FunctionTable {
        let ctx = QueryContext::new(namespace, Arc::new(MemoryStorage::new(namespace)));
        embed.initialize(&ctx).unwrap();
        embed.exposed_functions(&ctx)
    }

    fn norm(v: &[f32]) -> f32 {
        v.iter().map(|x| x * x).sum::<f32>().sqrt()
    }

    #[test]
    fn embeddings_are_deterministic_and_normalized() {
        let embed = capability(64);
        let a = embed.embed_text("ns", "the quick brown fox");
        let b = embed.embed_text("ns", "The Quick  brown fox");
        assert_eq!(a.len(), 64);
        assert_eq!(a, b);
        assert!((norm(&a) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn empty_text_yields_zero_vector() {
        let embed = capability(8);
        assert_eq!(embed.embed_text("ns", "   "), vec![0.0; 8]);
    }

    #[test]
    fn script_functions() {
        let embed = capability(16);
        let f = functions(&embed, "ns");
        let vector = f.call("embed", vec![HostValue::from("hello")]).unwrap();
        assert_eq!(vector.as_sequence().unwrap().len(), 16);
        assert_eq!(f.call("dimension", vec![]).unwrap(), HostValue::Integer(16));
        assert_eq!(
            f.call("models", vec![]).unwrap(),
            HostValue::from(vec!["hash-words", "hash-ngrams"])
        );
    }

    #[test]
    fn image_accepts_base64_or_raw_bytes() {
        let embed = capability(16);
        let f = functions(&embed, "ns");
        let encoded = base64::engine::general_purpose::STANDARD.encode(b"pixels");
        let from_base64 = f.call("embed_image", vec![HostValue::from(encoded)]).unwrap();
        let from_raw = f.call("embed_image", vec![HostValue::from("pixels")]).unwrap();
        assert_eq!(from_base64, from_raw);
    }

    #[test]
    fn model_selection_is_per_namespace() {
        let embed = capability(32);
        let before = embed.embed_text("a", "liath");
        functions(&embed, "a")
            .call("use_model", vec![HostValue::from("hash-ngrams")])
            .unwrap();
        assert_ne!(embed.embed_text("a", "liath"), before);
        assert_eq!(embed.embed_text("b", "liath"), before);
    }

    #[test]
    fn unknown_model_is_rejected() {
        let embed = capability(8);
        let err = functions(&embed, "ns")
            .call("use_model", vec![HostValue::from("gpt")])
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert!(EmbedCapability::new(EmbedConfig {
            dimension: 8,
            default_model: "nope".into()
        })
        .is_err());
    }
}
