use std::collections::HashMap;

use crate::asset::{AssetId, MediaAsset, MediaKind};
use crate::clip::{Clip, ClipId};
use crate::track::{Track, TrackId, TrackKind};

/// Owns all assets, tracks and clips, plus the display order of tracks.
/// Pure data: no I/O and no knowledge of decoding.
#[derive(Debug, Clone, Default)]
pub struct Timeline {
    assets: HashMap<AssetId, MediaAsset>,
    tracks: HashMap<TrackId, Track>,
    clips: HashMap<ClipId, Clip>,
    track_order: Vec<TrackId>,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// The starter layout new projects get: two video tracks and one audio
    /// track.
    pub fn with_default_tracks() -> Self {
        let mut timeline = Self::new();
        timeline.add_track("V1", TrackKind::Video);
        timeline.add_track("V2", TrackKind::Video);
        timeline.add_track("A1", TrackKind::Audio);
        timeline
    }

    pub fn add_track(&mut self, name: impl Into<String>, kind: TrackKind) -> TrackId {
        let track = Track::new(name, kind);
        let id = track.id;
        self.tracks.insert(id, track);
        self.track_order.push(id);
        id
    }

    pub fn track(&self, id: TrackId) -> Option<&Track> {
        self.tracks.get(&id)
    }

    pub fn track_mut(&mut self, id: TrackId) -> Option<&mut Track> {
        self.tracks.get_mut(&id)
    }

    pub fn track_order(&self) -> &[TrackId] {
        &self.track_order
    }

    pub fn swap_tracks(&mut self, index_a: usize, index_b: usize) {
        if index_a < self.track_order.len() && index_b < self.track_order.len() {
            self.track_order.swap(index_a, index_b);
        }
    }

    pub fn find_track_of_kind(&self, kind: TrackKind) -> Option<TrackId> {
        self.track_order
            .iter()
            .copied()
            .find(|id| self.tracks.get(id).is_some_and(|t| t.kind == kind))
    }

    pub fn add_asset(&mut self, asset: MediaAsset) -> AssetId {
        let id = asset.id;
        self.assets.insert(id, asset);
        id
    }

    pub fn asset(&self, id: AssetId) -> Option<&MediaAsset> {
        self.assets.get(&id)
    }

    /// Place a segment of an asset on a track. Rejects source ranges that
    /// violate `0 <= source_in < source_out <= asset.duration` (image assets
    /// accept any positive range since their duration is synthetic).
    pub fn add_clip(
        &mut self,
        track_id: TrackId,
        asset_id: AssetId,
        timeline_start: f64,
        source_in: f64,
        source_out: f64,
    ) -> Option<ClipId> {
        if !self.tracks.contains_key(&track_id) {
            return None;
        }
        let asset = self.assets.get(&asset_id)?;
        if source_in < 0.0 || source_in >= source_out {
            return None;
        }
        if asset.kind != MediaKind::Image && source_out > asset.duration + 1e-9 {
            return None;
        }

        let clip = Clip {
            id: ClipId::new(),
            asset_id,
            track_id,
            timeline_start,
            source_in,
            source_out,
        };
        let id = clip.id;
        self.clips.insert(id, clip);
        self.tracks
            .get_mut(&track_id)
            .expect("track checked above")
            .clip_ids
            .push(id);
        self.sort_track_clips(track_id);
        Some(id)
    }

    pub fn clip(&self, id: ClipId) -> Option<&Clip> {
        self.clips.get(&id)
    }

    pub fn remove_clip(&mut self, id: ClipId) {
        let Some(clip) = self.clips.remove(&id) else {
            return;
        };
        if let Some(track) = self.tracks.get_mut(&clip.track_id) {
            track.clip_ids.retain(|c| *c != id);
        }
    }

    pub fn move_clip(&mut self, id: ClipId, new_track: TrackId, new_start: f64) {
        let Some(clip) = self.clips.get_mut(&id) else {
            return;
        };
        let old_track = clip.track_id;
        clip.timeline_start = new_start;

        if old_track != new_track && self.tracks.contains_key(&new_track) {
            self.clips.get_mut(&id).expect("present").track_id = new_track;
            if let Some(track) = self.tracks.get_mut(&old_track) {
                track.clip_ids.retain(|c| *c != id);
            }
            if let Some(track) = self.tracks.get_mut(&new_track) {
                track.clip_ids.push(id);
            }
            self.sort_track_clips(new_track);
        } else {
            self.sort_track_clips(old_track);
        }
    }

    /// First clip on the track containing `time`. Video and image tracks
    /// allow at most one active clip at a time; on audio tracks overlaps are
    /// legal and this returns the earliest-starting one.
    pub fn active_clip_on_track(&self, track_id: TrackId, time: f64) -> Option<&Clip> {
        let track = self.tracks.get(&track_id)?;
        track
            .clip_ids
            .iter()
            .filter_map(|id| self.clips.get(id))
            .find(|clip| clip.contains(time))
    }

    /// One active clip per track in display order.
    pub fn active_clips(&self, time: f64) -> Vec<&Clip> {
        self.track_order
            .iter()
            .filter_map(|track_id| self.active_clip_on_track(*track_id, time))
            .collect()
    }

    pub fn clips_on_track(&self, track_id: TrackId) -> Vec<&Clip> {
        self.tracks
            .get(&track_id)
            .map(|track| {
                track
                    .clip_ids
                    .iter()
                    .filter_map(|id| self.clips.get(id))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn all_clips(&self) -> impl Iterator<Item = &Clip> {
        self.clips.values()
    }

    pub fn total_duration(&self) -> f64 {
        self.clips
            .values()
            .map(|clip| clip.timeline_end())
            .fold(0.0, f64::max)
    }

    fn sort_track_clips(&mut self, track_id: TrackId) {
        let Some(track) = self.tracks.get_mut(&track_id) else {
            return;
        };
        let clips = &self.clips;
        track.clip_ids.sort_by(|a, b| {
            let sa = clips.get(a).map(|c| c.timeline_start).unwrap_or(0.0);
            let sb = clips.get(b).map(|c| c.timeline_start).unwrap_or(0.0);
            sa.partial_cmp(&sb).unwrap_or(std::cmp::Ordering::Equal)
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn video_asset(duration: f64) -> MediaAsset {
        let mut asset = MediaAsset::from_path(PathBuf::from("test.mp4"), MediaKind::Video);
        asset.duration = duration;
        asset.has_video = true;
        asset.has_audio = true;
        asset
    }

    #[test]
    fn default_tracks_layout() {
        let timeline = Timeline::with_default_tracks();
        assert_eq!(timeline.track_order().len(), 3);
        assert!(timeline.find_track_of_kind(TrackKind::Video).is_some());
        assert!(timeline.find_track_of_kind(TrackKind::Audio).is_some());
        assert!(timeline.find_track_of_kind(TrackKind::Image).is_none());
    }

    #[test]
    fn empty_timeline_has_zero_duration() {
        let timeline = Timeline::new();
        assert_eq!(timeline.total_duration(), 0.0);
        assert!(timeline.active_clips(0.0).is_empty());
    }

    #[test]
    fn total_duration_is_max_clip_end() {
        let mut timeline = Timeline::new();
        let track = timeline.add_track("V1", TrackKind::Video);
        let asset = timeline.add_asset(video_asset(10.0));
        timeline.add_clip(track, asset, 0.0, 0.0, 4.0).unwrap();
        timeline.add_clip(track, asset, 7.0, 0.0, 2.0).unwrap();
        assert_eq!(timeline.total_duration(), 9.0);
    }

    #[test]
    fn add_clip_rejects_bad_source_range() {
        let mut timeline = Timeline::new();
        let track = timeline.add_track("V1", TrackKind::Video);
        let asset = timeline.add_asset(video_asset(5.0));
        assert!(timeline.add_clip(track, asset, 0.0, -1.0, 2.0).is_none());
        assert!(timeline.add_clip(track, asset, 0.0, 3.0, 3.0).is_none());
        assert!(timeline.add_clip(track, asset, 0.0, 0.0, 6.0).is_none());
        assert!(timeline.add_clip(track, asset, 0.0, 0.0, 5.0).is_some());
    }

    #[test]
    fn track_clips_stay_sorted_by_start() {
        let mut timeline = Timeline::new();
        let track = timeline.add_track("V1", TrackKind::Video);
        let asset = timeline.add_asset(video_asset(10.0));
        let late = timeline.add_clip(track, asset, 6.0, 0.0, 2.0).unwrap();
        let early = timeline.add_clip(track, asset, 1.0, 0.0, 2.0).unwrap();
        assert_eq!(timeline.track(track).unwrap().clip_ids, vec![early, late]);

        timeline.move_clip(late, track, 0.0);
        assert_eq!(timeline.track(track).unwrap().clip_ids, vec![late, early]);
    }

    #[test]
    fn active_clip_lookup() {
        let mut timeline = Timeline::new();
        let track = timeline.add_track("V1", TrackKind::Video);
        let asset = timeline.add_asset(video_asset(10.0));
        let a = timeline.add_clip(track, asset, 0.0, 0.0, 2.0).unwrap();
        let b = timeline.add_clip(track, asset, 5.0, 0.0, 2.0).unwrap();

        assert_eq!(timeline.active_clip_on_track(track, 1.0).unwrap().id, a);
        assert!(timeline.active_clip_on_track(track, 3.0).is_none());
        assert_eq!(timeline.active_clip_on_track(track, 5.0).unwrap().id, b);
        // end boundary is exclusive
        assert!(timeline.active_clip_on_track(track, 7.0).is_none());
    }

    #[test]
    fn move_clip_across_tracks() {
        let mut timeline = Timeline::new();
        let v1 = timeline.add_track("V1", TrackKind::Video);
        let v2 = timeline.add_track("V2", TrackKind::Video);
        let asset = timeline.add_asset(video_asset(10.0));
        let clip = timeline.add_clip(v1, asset, 0.0, 0.0, 3.0).unwrap();

        timeline.move_clip(clip, v2, 4.0);
        assert!(timeline.track(v1).unwrap().clip_ids.is_empty());
        assert_eq!(timeline.track(v2).unwrap().clip_ids, vec![clip]);
        assert_eq!(timeline.clip(clip).unwrap().timeline_start, 4.0);
    }

    #[test]
    fn swap_tracks_reorders_display() {
        let mut timeline = Timeline::new();
        let a = timeline.add_track("V1", TrackKind::Video);
        let b = timeline.add_track("A1", TrackKind::Audio);
        timeline.swap_tracks(0, 1);
        assert_eq!(timeline.track_order(), &[b, a]);
        // out-of-range indices are ignored
        timeline.swap_tracks(0, 5);
        assert_eq!(timeline.track_order(), &[b, a]);
    }

    #[test]
    fn remove_clip_detaches_from_track() {
        let mut timeline = Timeline::new();
        let track = timeline.add_track("V1", TrackKind::Video);
        let asset = timeline.add_asset(video_asset(10.0));
        let clip = timeline.add_clip(track, asset, 0.0, 0.0, 3.0).unwrap();
        timeline.remove_clip(clip);
        assert!(timeline.clip(clip).is_none());
        assert!(timeline.track(track).unwrap().clip_ids.is_empty());
        assert_eq!(timeline.total_duration(), 0.0);
    }
}
