use uuid::Uuid;

use crate::asset::AssetId;
use crate::track::TrackId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClipId(Uuid);

impl ClipId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClipId {
    fn default() -> Self {
        Self::new()
    }
}

/// A segment of a media asset placed on the timeline. All times in seconds.
#[derive(Debug, Clone)]
pub struct Clip {
    pub id: ClipId,
    pub asset_id: AssetId,
    pub track_id: TrackId,
    pub timeline_start: f64,
    pub source_in: f64,
    pub source_out: f64,
}

impl Clip {
    pub fn duration(&self) -> f64 {
        self.source_out - self.source_in
    }

    pub fn timeline_end(&self) -> f64 {
        self.timeline_start + self.duration()
    }

    /// Map a timeline time onto source time. Only meaningful while
    /// `contains(timeline_time)` holds, but callers may probe slightly
    /// outside the clip during activation.
    pub fn to_source_time(&self, timeline_time: f64) -> f64 {
        (timeline_time - self.timeline_start) + self.source_in
    }

    pub fn contains(&self, timeline_time: f64) -> bool {
        timeline_time >= self.timeline_start && timeline_time < self.timeline_end()
    }
}
