use async_trait::async_trait;

use crate::error::Result;

pub mod ffprobe;

/// Measures the playable duration of an asset.
///
/// Probing is slow (it usually opens the asset over the network), so callers are
/// expected to cache results for as long as a playlist stays loaded.
#[async_trait]
pub trait Probe: Send + Sync {
    /// Duration of `reference` in seconds.
    async fn duration(&self, reference: &str) -> Result<f64>;
}
