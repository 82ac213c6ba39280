use std::path::Path;
use std::sync::Arc;

use rushes_media::media_file;
use rushes_state::asset::{AssetId, MediaAsset, MediaKind};
use rushes_state::timeline::Timeline;
use rushes_state::track::TrackKind;

use crate::constants::IMAGE_DEFAULT_DURATION;

/// Imports a file into the timeline, auto-placing clips at the current end.
///
/// Recognized image extensions decode to RGBA immediately and land on the
/// first Image track (created on demand). Everything else is probed through
/// the codec backend: a video clip goes on the first Video track and an
/// audio clip on the first Audio track. Returns None when the file cannot
/// be opened; the timeline is left untouched in that case.
pub fn import_file(timeline: &mut Timeline, path: &Path) -> Option<AssetId> {
    if is_image_path(path) {
        return import_image(timeline, path);
    }

    let info = match media_file::probe(path) {
        Ok(info) => info,
        Err(e) => {
            eprintln!("[IMPORT] could not open {}: {e}", path.display());
            return None;
        }
    };
    if info.video.is_none() && info.audio.is_none() {
        eprintln!("[IMPORT] no playable streams in {}", path.display());
        return None;
    }

    let kind = if info.video.is_some() {
        MediaKind::Video
    } else {
        MediaKind::Audio
    };
    let mut asset = MediaAsset::from_path(path.to_path_buf(), kind);
    asset.duration = info.duration;
    if let Some(video) = info.video {
        asset.has_video = true;
        asset.width = video.width;
        asset.height = video.height;
        asset.fps = video.fps;
    }
    if let Some(audio) = info.audio {
        asset.has_audio = true;
        asset.sample_rate = audio.sample_rate;
        asset.channels = audio.channels;
    }

    let duration = asset.duration;
    let has_video = asset.has_video;
    let has_audio = asset.has_audio;
    let asset_id = timeline.add_asset(asset);
    let place_at = timeline.total_duration();

    if has_video {
        if let Some(track) = timeline.find_track_of_kind(TrackKind::Video) {
            timeline.add_clip(track, asset_id, place_at, 0.0, duration);
        }
    }
    if has_audio {
        if let Some(track) = timeline.find_track_of_kind(TrackKind::Audio) {
            timeline.add_clip(track, asset_id, place_at, 0.0, duration);
        }
    }

    Some(asset_id)
}

fn import_image(timeline: &mut Timeline, path: &Path) -> Option<AssetId> {
    let decoded = match image::open(path) {
        Ok(img) => img.to_rgba8(),
        Err(e) => {
            eprintln!("[IMPORT] failed to load image {}: {e}", path.display());
            return None;
        }
    };
    let (width, height) = decoded.dimensions();

    let mut asset = MediaAsset::from_path(path.to_path_buf(), MediaKind::Image);
    asset.duration = IMAGE_DEFAULT_DURATION;
    asset.width = width;
    asset.height = height;
    asset.image_data = Some(Arc::new(decoded.into_raw()));

    let asset_id = timeline.add_asset(asset);

    let track = timeline
        .find_track_of_kind(TrackKind::Image)
        .unwrap_or_else(|| timeline.add_track("Image 1", TrackKind::Image));
    let place_at = timeline.total_duration();
    timeline.add_clip(track, asset_id, place_at, 0.0, IMAGE_DEFAULT_DURATION);

    Some(asset_id)
}

fn is_image_path(path: &Path) -> bool {
    let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
        return false;
    };
    matches!(
        ext.to_ascii_lowercase().as_str(),
        "png" | "jpg" | "jpeg" | "bmp" | "tga"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_png(name: &str) -> PathBuf {
        let path = std::env::temp_dir().join(name);
        let img = image::RgbaImage::from_pixel(6, 4, image::Rgba([10, 20, 30, 255]));
        img.save(&path).unwrap();
        path
    }

    #[test]
    fn image_extensions_are_recognized() {
        assert!(is_image_path(Path::new("a.png")));
        assert!(is_image_path(Path::new("b.JPG")));
        assert!(is_image_path(Path::new("c.jpeg")));
        assert!(is_image_path(Path::new("d.bmp")));
        assert!(is_image_path(Path::new("e.tga")));
        assert!(!is_image_path(Path::new("f.mp4")));
        assert!(!is_image_path(Path::new("noext")));
    }

    #[test]
    fn image_import_creates_track_asset_and_clip() {
        let path = temp_png("rushes_import_basic.png");
        let mut timeline = Timeline::new();

        let asset_id = import_file(&mut timeline, &path).unwrap();
        let asset = timeline.asset(asset_id).unwrap();
        assert_eq!(asset.kind, MediaKind::Image);
        assert_eq!((asset.width, asset.height), (6, 4));
        assert_eq!(asset.duration, IMAGE_DEFAULT_DURATION);
        let pixels = asset.image_data.as_ref().unwrap();
        assert_eq!(pixels.len(), 6 * 4 * 4);
        assert_eq!(&pixels[..4], &[10, 20, 30, 255]);

        let track = timeline.find_track_of_kind(TrackKind::Image).unwrap();
        let clips = timeline.clips_on_track(track);
        assert_eq!(clips.len(), 1);
        assert_eq!(clips[0].timeline_start, 0.0);
        assert_eq!(clips[0].duration(), IMAGE_DEFAULT_DURATION);

        std::fs::remove_file(path).ok();
    }

    #[test]
    fn repeated_imports_append_at_timeline_end() {
        let path = temp_png("rushes_import_append.png");
        let mut timeline = Timeline::new();

        import_file(&mut timeline, &path).unwrap();
        import_file(&mut timeline, &path).unwrap();

        let track = timeline.find_track_of_kind(TrackKind::Image).unwrap();
        let clips = timeline.clips_on_track(track);
        assert_eq!(clips.len(), 2);
        assert_eq!(clips[1].timeline_start, IMAGE_DEFAULT_DURATION);
        assert_eq!(timeline.total_duration(), 2.0 * IMAGE_DEFAULT_DURATION);

        std::fs::remove_file(path).ok();
    }

    #[test]
    fn missing_file_leaves_timeline_untouched() {
        let mut timeline = Timeline::new();
        timeline.add_track("V1", TrackKind::Video);
        assert!(import_file(&mut timeline, Path::new("/nonexistent/clip.mp4")).is_none());
        assert_eq!(timeline.total_duration(), 0.0);
        assert!(timeline.all_clips().next().is_none());
    }
}
