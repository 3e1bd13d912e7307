//! Process-wide engine resources tied to one context

use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::cache::TileCache;
use crate::config::Config;
use crate::error::Result;
use crate::io::Vfs;

struct ContextInner {
    config: Config,
    vfs: Vfs,
    tile_cache: TileCache,
    codec_permits: Arc<Semaphore>,
}

/// Entry point holding the shared resources of the engine: configuration,
/// the filesystem registry, the decoded tile cache, and the bounded permit
/// pool for parallel codec work. Cloning is cheap; all clones share one
/// resource set, and everything is torn down when the last clone drops.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    pub fn new(config: Config) -> Result<Self> {
        let vfs = Vfs::new(config.clone());
        let tile_cache = TileCache::new(config.tile_cache_budget);
        let codec_permits = Arc::new(Semaphore::new(config.codec_parallelism.max(1)));
        Ok(Self {
            inner: Arc::new(ContextInner {
                config,
                vfs,
                tile_cache,
                codec_permits,
            }),
        })
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn vfs(&self) -> &Vfs {
        &self.inner.vfs
    }

    pub fn tile_cache(&self) -> &TileCache {
        &self.inner.tile_cache
    }

    /// Permits bounding concurrent tile compressions.
    pub fn codec_permits(&self) -> Arc<Semaphore> {
        self.inner.codec_permits.clone()
    }
}
