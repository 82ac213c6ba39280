use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct ExportSettings {
    pub output_path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Export range start in timeline seconds.
    pub start_time: f64,
    /// Export range end; 0 means the full timeline.
    pub end_time: f64,
}

impl Default for ExportSettings {
    fn default() -> Self {
        Self {
            output_path: PathBuf::from("export.mp4"),
            width: 1920,
            height: 1080,
            fps: 30,
            start_time: 0.0,
            end_time: 0.0,
        }
    }
}

impl ExportSettings {
    /// H.264 in YUV420P needs even dimensions; everything else is a user
    /// input error surfaced before any file is touched.
    pub fn validate(&self) -> Result<(), String> {
        if self.width == 0 || self.height == 0 {
            return Err("Output resolution must be non-zero".into());
        }
        if self.width % 2 != 0 || self.height % 2 != 0 {
            return Err("Output resolution must be even".into());
        }
        if self.fps == 0 {
            return Err("Frame rate must be non-zero".into());
        }
        if self.start_time < 0.0 {
            return Err("Export start must not be negative".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_are_valid() {
        assert!(ExportSettings::default().validate().is_ok());
    }

    #[test]
    fn odd_dimensions_are_rejected() {
        let settings = ExportSettings {
            width: 1921,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn zero_fps_is_rejected() {
        let settings = ExportSettings {
            fps: 0,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn negative_start_is_rejected() {
        let settings = ExportSettings {
            start_time: -1.0,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }
}
