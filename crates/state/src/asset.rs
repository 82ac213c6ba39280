use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AssetId(Uuid);

impl AssetId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for AssetId {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Video,
    Audio,
    Image,
}

/// A handle to an imported source file with cached probe metadata.
/// Video/audio files are probed only; images are pre-decoded to RGBA
/// at import and keep their pixels here for the compositor.
#[derive(Debug, Clone)]
pub struct MediaAsset {
    pub id: AssetId,
    pub path: PathBuf,
    pub kind: MediaKind,
    pub duration: f64,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub sample_rate: u32,
    pub channels: u32,
    pub has_video: bool,
    pub has_audio: bool,
    pub image_data: Option<Arc<Vec<u8>>>,
}

impl MediaAsset {
    pub fn from_path(path: PathBuf, kind: MediaKind) -> Self {
        Self {
            id: AssetId::new(),
            path,
            kind,
            duration: 0.0,
            width: 0,
            height: 0,
            fps: 0.0,
            sample_rate: 0,
            channels: 0,
            has_video: false,
            has_audio: false,
            image_data: None,
        }
    }
}
