//! Encoder argument fragments appended to quality-search and encode invocations.

use crate::config::RulesConfig;
use crate::models::Video;

/// What the arguments are for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purpose {
    CrfSearch,
    Encode,
}

/// Source of opaque encoder-tuning flags for a video.
pub trait Rules: Send + Sync {
    fn args(&self, video: &Video, purpose: Purpose) -> Vec<String>;
}

/// Flags derived from the `[rules]` config section and the video's properties.
#[derive(Debug, Clone)]
pub struct DefaultRules {
    config: RulesConfig,
}

impl DefaultRules {
    pub fn new(config: RulesConfig) -> Self {
        Self { config }
    }
}

impl Rules for DefaultRules {
    fn args(&self, video: &Video, purpose: Purpose) -> Vec<String> {
        let mut args = vec![
            "--encoder".to_string(),
            self.config.encoder.clone(),
            "--preset".to_string(),
            self.config.preset.to_string(),
            "--pix-format".to_string(),
            self.config.pixel_format.clone(),
        ];

        if video.has_hdr() {
            args.push("--svt".to_string());
            args.push("enable-hdr=1".to_string());
        }

        if purpose == Purpose::Encode {
            args.push("--acodec".to_string());
            args.push("copy".to_string());
        }

        args.extend(self.config.extra_args.iter().cloned());
        args
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ContentSource, VideoState};
    use std::path::PathBuf;

    fn video(hdr: Option<&str>) -> Video {
        Video {
            id: 7,
            path: PathBuf::from("/media/movies/dune.mkv"),
            title: None,
            size: Some(20_000_000_000),
            state: VideoState::Analyzed,
            bitrate: Some(30_000_000),
            width: Some(3840),
            height: Some(2160),
            duration: Some(9_300.0),
            frame_rate: Some(23.976),
            video_codecs: vec!["hevc".to_string()],
            audio_codecs: vec!["truehd".to_string()],
            hdr: hdr.map(str::to_string),
            content_source: ContentSource::Movies,
            library_id: 2,
            content_group: None,
            chosen_quality_result_id: None,
            version: 3,
            created_at: 0,
            updated_at: 0,
        }
    }

    fn has_pair(args: &[String], flag: &str, value: &str) -> bool {
        args.windows(2).any(|pair| pair[0] == flag && pair[1] == value)
    }

    #[test]
    fn test_default_rules_use_config_values() {
        let rules = DefaultRules::new(RulesConfig::default());
        let args = rules.args(&video(None), Purpose::CrfSearch);

        assert!(has_pair(&args, "--encoder", "svt-av1"));
        assert!(has_pair(&args, "--preset", "6"));
        assert!(has_pair(&args, "--pix-format", "yuv420p10le"));
        assert!(!args.contains(&"--svt".to_string()));
        assert!(!args.contains(&"--acodec".to_string()));
    }

    #[test]
    fn test_hdr_source_keeps_hdr_metadata() {
        let rules = DefaultRules::new(RulesConfig::default());
        let args = rules.args(&video(Some("Dolby Vision")), Purpose::CrfSearch);
        assert!(has_pair(&args, "--svt", "enable-hdr=1"));
    }

    #[test]
    fn test_encode_copies_audio_and_appends_extra_args() {
        let config = RulesConfig {
            extra_args: vec!["--keyint".to_string(), "10s".to_string()],
            ..RulesConfig::default()
        };
        let args = DefaultRules::new(config).args(&video(None), Purpose::Encode);

        assert!(has_pair(&args, "--acodec", "copy"));
        assert_eq!(&args[args.len() - 2..], &["--keyint".to_string(), "10s".to_string()]);
    }
}
