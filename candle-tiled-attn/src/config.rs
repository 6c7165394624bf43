//! Tile configuration and its selection policy.
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::Mutex;

use candle::Result;
use serde::{Deserialize, Serialize};

/// Head dimensions the kernel computes with, other sizes are zero-padded up to the next one.
pub const SUPPORTED_HEAD_DIMS: [usize; 4] = [32, 64, 128, 256];

/// Smallest supported head dimension that holds `head_size`, `None` above 256.
pub fn padded_head_dim(head_size: usize) -> Option<usize> {
    SUPPORTED_HEAD_DIMS
        .iter()
        .copied()
        .find(|&d| d >= head_size)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TileConfig {
    /// Query rows per tile.
    pub block_m: usize,
    /// Key columns per tile.
    pub block_n: usize,
    /// Load the value tile together with the key tile rather than after the scores.
    #[serde(default)]
    pub pre_load_v: bool,
}

impl Default for TileConfig {
    fn default() -> Self {
        Self::new(64, 64)
    }
}

impl TileConfig {
    pub fn new(block_m: usize, block_n: usize) -> Self {
        Self {
            block_m,
            block_n,
            pre_load_v: false,
        }
    }

    pub fn with_pre_load_v(self, pre_load_v: bool) -> Self {
        Self { pre_load_v, ..self }
    }

    pub fn validate(&self) -> Result<()> {
        if self.block_m == 0 || self.block_n == 0 {
            candle::bail!(
                "tile sizes must be non-zero, got block_m={} block_n={}",
                self.block_m,
                self.block_n
            )
        }
        Ok(())
    }
}

/// Problem features a tile configuration is chosen for.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TuningKey {
    pub causal: bool,
    pub dropout_p: f32,
    pub padded_head_dim: usize,
}

impl PartialEq for TuningKey {
    fn eq(&self, other: &Self) -> bool {
        self.causal == other.causal
            && self.dropout_p.to_bits() == other.dropout_p.to_bits()
            && self.padded_head_dim == other.padded_head_dim
    }
}

impl Eq for TuningKey {}

impl Hash for TuningKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.causal.hash(state);
        self.dropout_p.to_bits().hash(state);
        self.padded_head_dim.hash(state);
    }
}

pub trait TilePolicy: Send + Sync {
    fn select(&self, key: &TuningKey) -> TileConfig;
}

impl TilePolicy for TileConfig {
    fn select(&self, _key: &TuningKey) -> TileConfig {
        *self
    }
}

/// Static lookup from padded head dimension to tile configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefaultTilePolicy {
    pub by_head_dim: BTreeMap<usize, TileConfig>,
    /// Used for head dimensions missing from the table.
    #[serde(default)]
    pub fallback: TileConfig,
    /// Configuration for causal problems, keyed like `by_head_dim`.
    #[serde(default)]
    pub causal: BTreeMap<usize, TileConfig>,
}

impl Default for DefaultTilePolicy {
    fn default() -> Self {
        let by_head_dim = BTreeMap::from([
            (32, TileConfig::new(128, 64).with_pre_load_v(true)),
            (64, TileConfig::new(128, 64)),
            (128, TileConfig::new(64, 64)),
            (256, TileConfig::new(32, 32)),
        ]);
        let causal = BTreeMap::from([
            (32, TileConfig::new(64, 64).with_pre_load_v(true)),
            (64, TileConfig::new(64, 64)),
            (128, TileConfig::new(64, 32)),
            (256, TileConfig::new(32, 32)),
        ]);
        Self {
            by_head_dim,
            fallback: TileConfig::default(),
            causal,
        }
    }
}

impl DefaultTilePolicy {
    /// Parses a table such as
    /// `{"by_head_dim": {"64": {"block_m": 128, "block_n": 64}}}`.
    pub fn from_json(json: &str) -> Result<Self> {
        let policy: Self = serde_json::from_str(json).map_err(candle::Error::wrap)?;
        for cfg in policy
            .by_head_dim
            .values()
            .chain(policy.causal.values())
            .chain(std::iter::once(&policy.fallback))
        {
            cfg.validate()?;
        }
        Ok(policy)
    }
}

impl TilePolicy for DefaultTilePolicy {
    fn select(&self, key: &TuningKey) -> TileConfig {
        let causal = if key.causal {
            self.causal.get(&key.padded_head_dim)
        } else {
            None
        };
        causal
            .or_else(|| self.by_head_dim.get(&key.padded_head_dim))
            .copied()
            .unwrap_or(self.fallback)
    }
}

/// Resolves every key once through the inner policy and remembers the answer.
pub struct CachedTilePolicy<P> {
    inner: P,
    cache: Mutex<HashMap<TuningKey, TileConfig>>,
}

impl<P: TilePolicy> CachedTilePolicy<P> {
    pub fn new(inner: P) -> Self {
        Self {
            inner,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }

    pub fn len(&self) -> usize {
        self.cache.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<P: TilePolicy> TilePolicy for CachedTilePolicy<P> {
    fn select(&self, key: &TuningKey) -> TileConfig {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        *cache.entry(*key).or_insert_with(|| {
            let cfg = self.inner.select(key);
            tracing::debug!(?key, ?cfg, "resolved tile configuration");
            cfg
        })
    }
}

impl<P: std::fmt::Debug> std::fmt::Debug for CachedTilePolicy<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedTilePolicy")
            .field("inner", &self.inner)
            .finish_non_exhaustive()
    }
}
