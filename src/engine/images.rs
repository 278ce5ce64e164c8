//! Per-turn image dedupe and cap.

use sha2::{Digest, Sha256};
use std::collections::HashSet;

use super::types::ImageData;

/// Stable content-derived key for an image.
pub fn image_key(image: &ImageData) -> String {
    let mut hasher = Sha256::new();
    hasher.update(image.media_type.as_bytes());
    hasher.update([0u8]);
    hasher.update(image.data.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Lets each distinct image through once, up to `cap` images per turn.
#[derive(Debug)]
pub struct ImageFilter {
    seen: HashSet<String>,
    cap: usize,
}

impl ImageFilter {
    pub fn new(cap: usize) -> Self {
        Self {
            seen: HashSet::new(),
            cap,
        }
    }

    /// Returns true if the image should be surfaced.
    pub fn admit(&mut self, image: &ImageData) -> bool {
        if self.seen.len() >= self.cap {
            log::debug!("image cap reached: cap={}", self.cap);
            return false;
        }
        self.seen.insert(image_key(image))
    }

    #[cfg(test)]
    pub fn admitted(&self) -> usize {
        self.seen.len()
    }
}
