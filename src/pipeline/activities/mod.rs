// src/pipeline/activities/mod.rs

mod classify;
mod extract;
mod parse;
mod update_product;
mod validate;

pub use classify::ClassifyDocument;
pub use extract::ExtractText;
pub use parse::ParseDocument;
pub use update_product::{parsed_result_key, UpdateProduct};
pub use validate::ValidateDocument;

use std::time::Duration;

use crate::error::ActivityError;
use crate::services::StoragePool;

/// Reads one object through a pooled storage client; the client goes back
/// to the pool before this returns.
pub(crate) async fn fetch_object(
    storage: &StoragePool,
    key: &str,
    acquire_timeout: Duration,
) -> Result<Vec<u8>, ActivityError> {
    let client = storage.acquire(acquire_timeout).await?;
    client.get(key).await
}
