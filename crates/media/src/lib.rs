pub mod audio_decoder;
pub mod audio_frame_queue;
pub mod clip_player;
pub mod clock;
pub mod media_file;
pub mod packet_queue;
pub mod video_decoder;
pub mod video_frame_queue;

use std::sync::Once;

use ffmpeg_the_third as ffmpeg;

pub fn init_once() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        ffmpeg::init().expect("failed to initialize ffmpeg");
        unsafe {
            ffmpeg::ffi::av_log_set_level(ffmpeg::ffi::AV_LOG_FATAL);
        }
    });
}
