use uuid::Uuid;

use crate::clip::ClipId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TrackId(Uuid);

impl TrackId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TrackId {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Video,
    Audio,
    Image,
}

#[derive(Debug, Clone)]
pub struct Track {
    pub id: TrackId,
    pub name: String,
    pub kind: TrackKind,
    /// Ordered by clip timeline_start, maintained by the timeline.
    pub clip_ids: Vec<ClipId>,
    pub muted: bool,
    pub visible: bool,
    pub volume: f32,
}

impl Track {
    pub fn new(name: impl Into<String>, kind: TrackKind) -> Self {
        Self {
            id: TrackId::new(),
            name: name.into(),
            kind,
            clip_ids: Vec::new(),
            muted: false,
            visible: true,
            volume: 1.0,
        }
    }
}
