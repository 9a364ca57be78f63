//! Image decoding plus the URL-keyed thumbnail fetch/cache capability.

use std::collections::hash_map::DefaultHasher;
use std::fs;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use image::{DynamicImage, ImageFormat};
use log::{debug, warn};
use zune_core::{colorspace::ColorSpace, options::DecoderOptions};
use zune_jpeg::JpegDecoder;

use crate::http_transport::{BytesTransport, TransportError};

/// Bumped whenever the normalized cache encoding changes.
const CACHE_KEY_VERSION: &str = "thumb-v1";
const CACHE_FILE_EXTENSION: &str = "png";

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FetchError {
    #[error("thumbnail request failed: {0}")]
    Request(#[from] TransportError),
    #[error("thumbnail response was empty")]
    EmptyBody,
    #[error("thumbnail is not a supported image format")]
    UnsupportedFormat,
    #[error("thumbnail could not be decoded")]
    Decode,
}

/// "Fetch and cache an image for a URL" capability. Implementations may block.
pub trait ThumbnailFetcher: Send + Sync {
    fn fetch_image(&self, url: &str) -> Result<DynamicImage, FetchError>;
}

/// Image container recognized from leading magic bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    Png,
    Jpeg,
    Webp,
    Gif,
    Bmp,
}

impl ImageKind {
    pub fn sniff(bytes: &[u8]) -> Option<Self> {
        const PNG_SIGNATURE: &[u8] = b"\x89PNG\r\n\x1a\n";
        if bytes.starts_with(PNG_SIGNATURE) {
            Some(Self::Png)
        } else if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
            Some(Self::Jpeg)
        } else if bytes.starts_with(b"RIFF") && bytes.get(8..12) == Some(b"WEBP".as_slice()) {
            Some(Self::Webp)
        } else if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
            Some(Self::Gif)
        } else if bytes.starts_with(b"BM") {
            Some(Self::Bmp)
        } else {
            None
        }
    }

    fn format(self) -> ImageFormat {
        match self {
            Self::Png => ImageFormat::Png,
            Self::Jpeg => ImageFormat::Jpeg,
            Self::Webp => ImageFormat::WebP,
            Self::Gif => ImageFormat::Gif,
            Self::Bmp => ImageFormat::Bmp,
        }
    }
}

/// Tolerates truncated or slightly corrupt JPEG streams.
fn decode_jpeg_lenient(bytes: &[u8]) -> Option<DynamicImage> {
    let options = DecoderOptions::new_cmd()
        .set_strict_mode(false)
        .jpeg_set_out_colorspace(ColorSpace::RGBA);
    let mut decoder = JpegDecoder::new_with_options(bytes, options);
    let rgba = decoder.decode().ok()?;
    let (width, height) = decoder.dimensions()?;
    image::RgbaImage::from_raw(u32::try_from(width).ok()?, u32::try_from(height).ok()?, rgba)
        .map(DynamicImage::ImageRgba8)
}

/// Decodes `bytes`, retrying JPEG input with the lenient decoder.
pub fn decode_image_bytes(bytes: &[u8]) -> Option<DynamicImage> {
    let kind = ImageKind::sniff(bytes);
    let primary = match kind {
        Some(kind) => image::load_from_memory_with_format(bytes, kind.format()),
        None => image::load_from_memory(bytes),
    };
    match primary {
        Ok(image) => Some(image),
        Err(error) if kind == Some(ImageKind::Jpeg) || kind.is_none() => {
            debug!("Primary decode failed ({}), trying lenient JPEG decode", error);
            decode_jpeg_lenient(bytes)
        }
        Err(_) => None,
    }
}

/// Loads a user-supplied image from disk.
pub fn load_image_from_path(path: &Path) -> Result<DynamicImage, String> {
    let bytes =
        fs::read(path).map_err(|error| format!("Failed to read {}: {error}", path.display()))?;
    decode_image_bytes(&bytes)
        .ok_or_else(|| format!("Failed to decode image {}", path.display()))
}

/// Default on-disk thumbnail cache location.
pub fn thumbnail_cache_dir() -> Option<PathBuf> {
    dirs::cache_dir().map(|path| path.join("whatflower").join("thumbnails"))
}

/// Flat directory of normalized PNG thumbnails named by URL hash.
pub struct ThumbnailCache {
    root: PathBuf,
    budget_bytes: u64,
}

impl ThumbnailCache {
    /// A zero budget is raised to one megabyte.
    pub fn new(root: PathBuf, max_size_mb: u32) -> Self {
        Self {
            root,
            budget_bytes: u64::from(max_size_mb.max(1)) << 20,
        }
    }

    pub fn path_for(&self, url: &str) -> PathBuf {
        let mut hasher = DefaultHasher::new();
        CACHE_KEY_VERSION.hash(&mut hasher);
        url.hash(&mut hasher);
        self.root
            .join(format!("{:016x}.{CACHE_FILE_EXTENSION}", hasher.finish()))
    }

    pub fn load(&self, url: &str) -> Option<DynamicImage> {
        let path = self.path_for(url);
        let bytes = fs::read(&path).ok()?;
        match image::load_from_memory_with_format(&bytes, ImageFormat::Png) {
            Ok(image) => Some(image),
            Err(error) => {
                warn!("Dropping unreadable cached thumbnail {}: {}", path.display(), error);
                let _ = fs::remove_file(&path);
                None
            }
        }
    }

    /// Writes through a temporary file so readers never see a partial PNG.
    pub fn store(&self, url: &str, image: &DynamicImage) -> std::io::Result<()> {
        fs::create_dir_all(&self.root)?;
        let target = self.path_for(url);
        let staging = target.with_extension("part");
        image
            .save_with_format(&staging, ImageFormat::Png)
            .map_err(std::io::Error::other)?;
        fs::rename(&staging, &target)
    }

    /// Removes least recently written entries until the cache fits its budget.
    pub fn prune(&self) -> Vec<PathBuf> {
        let Ok(entries) = fs::read_dir(&self.root) else {
            return Vec::new();
        };
        let mut cached: Vec<(SystemTime, u64, PathBuf)> = entries
            .filter_map(Result::ok)
            .filter_map(|entry| {
                let metadata = entry.metadata().ok()?;
                metadata.is_file().then(|| {
                    let written = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                    (written, metadata.len(), entry.path())
                })
            })
            .collect();

        let mut used: u64 = cached.iter().map(|(_, len, _)| len).sum();
        if used <= self.budget_bytes {
            return Vec::new();
        }
        cached.sort_by(|a, b| a.0.cmp(&b.0));

        let mut evicted = Vec::new();
        for (_, len, path) in cached {
            if used <= self.budget_bytes {
                break;
            }
            match fs::remove_file(&path) {
                Ok(()) => {
                    used = used.saturating_sub(len);
                    evicted.push(path);
                }
                Err(error) => debug!("Could not evict {}: {}", path.display(), error),
            }
        }
        evicted
    }
}

/// Downloads thumbnails, keeping normalized copies in an optional disk cache.
pub struct CachedThumbnailFetcher {
    transport: Box<dyn BytesTransport>,
    cache: Option<ThumbnailCache>,
}

impl CachedThumbnailFetcher {
    pub fn new(transport: Box<dyn BytesTransport>, cache: Option<ThumbnailCache>) -> Self {
        Self { transport, cache }
    }

    fn remember(&self, url: &str, image: &DynamicImage) {
        let Some(cache) = self.cache.as_ref() else {
            return;
        };
        if let Err(error) = cache.store(url, image) {
            warn!("Failed to cache thumbnail for {}: {}", url, error);
            return;
        }
        let evicted = cache.prune();
        if !evicted.is_empty() {
            debug!("Evicted {} cached thumbnails", evicted.len());
        }
    }
}

impl ThumbnailFetcher for CachedThumbnailFetcher {
    fn fetch_image(&self, url: &str) -> Result<DynamicImage, FetchError> {
        if let Some(image) = self.cache.as_ref().and_then(|cache| cache.load(url)) {
            debug!("Thumbnail cache hit for {}", url);
            return Ok(image);
        }

        let bytes = self.transport.get_bytes(url)?;
        if bytes.is_empty() {
            return Err(FetchError::EmptyBody);
        }
        if ImageKind::sniff(&bytes).is_none() {
            return Err(FetchError::UnsupportedFormat);
        }
        let image = decode_image_bytes(&bytes).ok_or(FetchError::Decode)?;
        self.remember(url, &image);
        Ok(image)
    }
}
