//! A directory-backed media library serving as both asset source and content fetcher.

use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::IndexedRandom;
use tracing::{debug, info, instrument};
use walkdir::{DirEntry, WalkDir};

use crate::error::{Error, FetchError};
use crate::events::{AssetRef, DecodedImage, MediaKind, Page, PlaybackLocator};
use crate::source::{AssetSource, ContentFetcher};

const IMAGE_EXTS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp", "bmp", "tif", "tiff"];
const VIDEO_EXTS: &[&str] = &["mp4", "mov", "m4v"];

/// Media kind implied by the file extension, if it is one we serve.
#[must_use]
pub fn media_kind(path: &Path) -> Option<MediaKind> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    if IMAGE_EXTS.contains(&ext.as_str()) {
        Some(MediaKind::Image)
    } else if VIDEO_EXTS.contains(&ext.as_str()) {
        Some(MediaKind::Video)
    } else {
        None
    }
}

#[derive(Debug)]
pub struct LocalLibrary {
    root: PathBuf,
    assets: Vec<AssetRef>,
    rng: Mutex<StdRng>,
}

impl LocalLibrary {
    /// Scan `root` recursively. Ids are paths relative to `root`, in sorted order.
    ///
    /// # Errors
    /// [`Error::BadDir`] when `root` is not a directory, [`Error::EmptyScan`] when it holds no
    /// supported media.
    #[instrument(skip_all, fields(root = %root.as_ref().display()))]
    pub fn scan(root: impl AsRef<Path>, seed: Option<u64>) -> Result<Self, Error> {
        let root = root.as_ref();
        if !root.is_dir() {
            return Err(Error::BadDir(root.to_string_lossy().into_owned()));
        }
        let root = root.canonicalize()?;

        let mut found: Vec<(String, MediaKind)> = WalkDir::new(&root)
            .follow_links(true)
            .into_iter()
            .filter_entry(|e| !is_hidden_dir(e))
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| {
                let kind = media_kind(e.path())?;
                let rel = e.path().strip_prefix(&root).ok()?;
                Some((rel.to_string_lossy().into_owned(), kind))
            })
            .collect();
        found.sort_by(|a, b| a.0.cmp(&b.0));
        if found.is_empty() {
            return Err(Error::EmptyScan);
        }

        let assets: Vec<AssetRef> = found
            .into_iter()
            .enumerate()
            .map(|(idx, (id, kind))| match kind {
                MediaKind::Image => AssetRef::image(id, idx as i64),
                MediaKind::Video => AssetRef::video(id, idx as i64),
            })
            .collect();
        info!(discovered = assets.len(), "library scan complete");

        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Ok(Self {
            root,
            assets,
            rng: Mutex::new(rng),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn assets(&self) -> &[AssetRef] {
        &self.assets
    }

    fn path_of(&self, asset: &AssetRef) -> PathBuf {
        self.root.join(&asset.id.0)
    }
}

fn is_hidden_dir(entry: &DirEntry) -> bool {
    // the root itself may be a dot-directory (temp dirs)
    entry.depth() > 0
        && entry.file_type().is_dir()
        && entry.file_name().to_str().is_some_and(|n| n.starts_with('.'))
}

#[async_trait]
impl AssetSource for LocalLibrary {
    async fn fetch_page(&self, page: usize, page_size: usize) -> Result<Page, FetchError> {
        if page == 0 || page_size == 0 {
            return Ok(Page::default());
        }
        let start = (page - 1).saturating_mul(page_size).min(self.assets.len());
        let end = start.saturating_add(page_size).min(self.assets.len());
        Ok(Page {
            items: self.assets[start..end].to_vec(),
            has_more: end < self.assets.len(),
        })
    }

    async fn fetch_random(&self, limit: usize) -> Result<Vec<AssetRef>, FetchError> {
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(self
            .assets
            .choose_multiple(&mut *rng, limit)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ContentFetcher for LocalLibrary {
    async fn decode_image(&self, asset: &AssetRef) -> Result<DecodedImage, FetchError> {
        if !asset.is_image() {
            return Err(FetchError::Decode(format!("{} is not an image", asset.id)));
        }
        let path = self.path_of(asset);
        let rgba = tokio::task::spawn_blocking(move || decode_rgba8_apply_exif(&path))
            .await
            .map_err(|err| FetchError::Decode(err.to_string()))??;
        let (width, height) = rgba.dimensions();
        Ok(DecodedImage {
            width,
            height,
            pixels: rgba.into_raw(),
        })
    }

    async fn resolve_playback_locator(
        &self,
        asset: &AssetRef,
        use_fallback: bool,
    ) -> Result<PlaybackLocator, FetchError> {
        if use_fallback {
            return Err(FetchError::Unavailable(
                "local library has no alternate endpoint".to_owned(),
            ));
        }
        let path = self.path_of(asset);
        if !path.is_file() {
            return Err(FetchError::NotFound(asset.id.to_string()));
        }
        Ok(PlaybackLocator {
            url: format!("file://{}", path.display()),
            headers: Vec::new(),
        })
    }
}

fn io_error(path: &Path, err: io::Error) -> FetchError {
    match err.kind() {
        io::ErrorKind::NotFound => FetchError::NotFound(path.display().to_string()),
        _ => FetchError::Unavailable(format!("{}: {err}", path.display())),
    }
}

/// Decode to RGBA8 and apply the EXIF orientation, if any.
fn decode_rgba8_apply_exif(path: &Path) -> Result<image::RgbaImage, FetchError> {
    let decoded = image::ImageReader::open(path)
        .map_err(|err| io_error(path, err))?
        .with_guessed_format()
        .map_err(|err| io_error(path, err))?
        .decode()
        .map_err(|err| FetchError::Decode(format!("{}: {err}", path.display())))?;
    let img = decoded.to_rgba8();

    use image::imageops::{flip_horizontal, flip_vertical, rotate90, rotate180, rotate270};
    let img = match read_orientation(path).unwrap_or(1) {
        2 => flip_horizontal(&img),
        3 => rotate180(&img),
        4 => flip_vertical(&img),
        5 => flip_horizontal(&rotate90(&img)),
        6 => rotate90(&img),
        7 => flip_horizontal(&rotate270(&img)),
        8 => rotate270(&img),
        _ => img,
    };
    Ok(img)
}

fn read_orientation(path: &Path) -> Option<u32> {
    let mut reader = BufReader::new(File::open(path).ok()?);
    let exif = exif::Reader::new().read_from_container(&mut reader).ok()?;
    let orientation = exif
        .get_field(exif::Tag::Orientation, exif::In::PRIMARY)?
        .value
        .get_uint(0)?;
    debug!(orientation, path = %path.display(), "exif orientation");
    Some(orientation)
}
