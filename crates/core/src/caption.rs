//! Image captioning with a persistent, content-addressed cache.
//!
//! The cache is built once per batch, handed by `&mut` to whatever step needs
//! a caption, and flushed to disk when the batch ends.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::Result;
use crate::trajectory::ImageRef;

/// Produces a short textual description of an image.
pub trait Captioner {
    fn caption(&self, image: &[u8]) -> Result<String>;
}

impl<T: Captioner + ?Sized> Captioner for &T {
    fn caption(&self, image: &[u8]) -> Result<String> {
        (*self).caption(image)
    }
}

/// Captions keyed by the SHA-256 of the image bytes.
#[derive(Debug, Default)]
pub struct CaptionCache {
    path: Option<PathBuf>,
    entries: BTreeMap<String, String>,
    dirty: bool,
}

impl CaptionCache {
    /// A cache that is never persisted.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load the cache stored at `path`, or start an empty one there.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = if path.exists() {
            let text = fs::read_to_string(&path)?;
            serde_json::from_str(&text)?
        } else {
            BTreeMap::new()
        };
        debug!(path = %path.display(), entries = entries.len(), "opened caption cache");
        Ok(Self {
            path: Some(path),
            entries,
            dirty: false,
        })
    }

    pub fn key(image: &[u8]) -> String {
        hex::encode(Sha256::digest(image))
    }

    pub fn get(&self, image: &[u8]) -> Option<&str> {
        self.entries.get(&Self::key(image)).map(String::as_str)
    }

    pub fn insert(&mut self, image: &[u8], caption: impl Into<String>) {
        self.entries.insert(Self::key(image), caption.into());
        self.dirty = true;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Return the cached caption, calling the captioner only on a miss.
    pub fn caption_with<C: Captioner + ?Sized>(
        &mut self,
        captioner: &C,
        image: &[u8],
    ) -> Result<String> {
        if let Some(hit) = self.get(image) {
            return Ok(hit.to_string());
        }
        let caption = captioner.caption(image)?;
        self.insert(image, caption.clone());
        Ok(caption)
    }

    /// Write the cache back to its file if anything changed.
    pub fn flush(&mut self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if !self.dirty {
            return Ok(());
        }
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(&self.entries)?)?;
        self.dirty = false;
        info!(path = %path.display(), entries = self.entries.len(), "saved caption cache");
        Ok(())
    }
}

fn image_bytes(image: &ImageRef) -> Result<std::borrow::Cow<'_, [u8]>> {
    Ok(match image {
        ImageRef::Inline(bytes) => std::borrow::Cow::Borrowed(bytes.as_slice()),
        ImageRef::Path(path) => std::borrow::Cow::Owned(fs::read(path)?),
    })
}

/// Caption every image of a task, in order.
pub fn caption_images<C: Captioner + ?Sized>(
    images: &[ImageRef],
    cache: &mut CaptionCache,
    captioner: &C,
) -> Result<Vec<String>> {
    images
        .iter()
        .map(|image| {
            let bytes = image_bytes(image)?;
            cache.caption_with(captioner, &bytes)
        })
        .collect()
}

/// Default cache location inside an output directory.
pub fn default_cache_path(output_dir: &Path) -> PathBuf {
    output_dir.join("caption_cache.json")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use std::cell::Cell;
    use tempfile::TempDir;

    struct CountingCaptioner {
        calls: Cell<usize>,
    }

    impl Captioner for CountingCaptioner {
        fn caption(&self, image: &[u8]) -> Result<String> {
            self.calls.set(self.calls.get() + 1);
            Ok(format!("{} bytes", image.len()))
        }
    }

    struct FailingCaptioner;

    impl Captioner for FailingCaptioner {
        fn caption(&self, _image: &[u8]) -> Result<String> {
            Err(Error::ExternalCall("service unavailable".into()))
        }
    }

    #[test]
    fn test_cache_hits_skip_captioner() {
        let captioner = CountingCaptioner { calls: Cell::new(0) };
        let mut cache = CaptionCache::in_memory();
        let images = vec![
            ImageRef::Inline(vec![1, 2, 3]),
            ImageRef::Inline(vec![1, 2, 3]),
            ImageRef::Inline(vec![4]),
        ];
        let captions = caption_images(&images, &mut cache, &captioner).unwrap();
        assert_eq!(captions, vec!["3 bytes", "3 bytes", "1 bytes"]);
        assert_eq!(captioner.calls.get(), 2);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_cache_persists_across_runs() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested/captions.json");

        let mut cache = CaptionCache::open(&path).unwrap();
        cache.insert(b"png", "a cat");
        cache.flush().unwrap();

        let reopened = CaptionCache::open(&path).unwrap();
        assert_eq!(reopened.get(b"png"), Some("a cat"));
        assert_eq!(reopened.len(), 1);
    }

    #[test]
    fn test_failure_is_not_cached() {
        let mut cache = CaptionCache::in_memory();
        let images = vec![ImageRef::Inline(vec![9])];
        assert!(caption_images(&images, &mut cache, &FailingCaptioner).is_err());
        assert!(cache.is_empty());
    }
}
