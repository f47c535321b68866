use std::sync::Arc;

use async_trait::async_trait;

use crate::types::{Classification, ImageRef, VisionError};

/// The classification seam. The orchestrator depends on this trait, never on
/// a concrete client, so tests run scripted classifiers with no network.
#[async_trait]
pub trait VisionClassifier: Send + Sync {
    async fn classify(&self, image: &ImageRef) -> Result<Classification, VisionError>;
}

// Shared handles classify too, so a caller can keep its own reference to a
// client it hands into a wrapper.
#[async_trait]
impl<T: VisionClassifier + ?Sized> VisionClassifier for Arc<T> {
    async fn classify(&self, image: &ImageRef) -> Result<Classification, VisionError> {
        (**self).classify(image).await
    }
}
