//! FFprobe stream information.

use serde::Deserialize;
use std::ffi::OsStr;
use std::path::Path;

use crate::command::run_tool;
use crate::error::{MediaError, MediaResult};

/// What a media file contains.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaInfo {
    /// Duration in seconds (0 when unknown)
    pub duration: f64,
    pub has_video: bool,
    pub has_audio: bool,
    /// Width of the first video stream
    pub width: Option<u32>,
    /// Height of the first video stream
    pub height: Option<u32>,
    /// Codec of the first audio stream
    pub audio_codec: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    format: Option<FfprobeFormat>,
    #[serde(default)]
    streams: Vec<FfprobeStream>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: String,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
}

/// Probe a media file.
pub async fn probe_media(path: impl AsRef<Path>) -> MediaResult<MediaInfo> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(MediaError::FileNotFound(path.to_path_buf()));
    }

    let args = [
        OsStr::new("-v"),
        OsStr::new("quiet"),
        OsStr::new("-print_format"),
        OsStr::new("json"),
        OsStr::new("-show_format"),
        OsStr::new("-show_streams"),
        path.as_os_str(),
    ];
    let stdout = run_tool("ffprobe", args, None).await?;

    parse_probe_output(&stdout)
}

fn parse_probe_output(stdout: &[u8]) -> MediaResult<MediaInfo> {
    let probe: FfprobeOutput = serde_json::from_slice(stdout)?;
    let video = probe.streams.iter().find(|s| s.codec_type == "video");
    let audio = probe.streams.iter().find(|s| s.codec_type == "audio");

    Ok(MediaInfo {
        duration: probe
            .format
            .and_then(|f| f.duration)
            .and_then(|d| d.parse().ok())
            .unwrap_or(0.0),
        has_video: video.is_some(),
        has_audio: audio.is_some(),
        width: video.and_then(|v| v.width),
        height: video.and_then(|v| v.height),
        audio_codec: audio.and_then(|a| a.codec_name.clone()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_video_with_audio() {
        let json = br#"{
            "streams": [
                {"codec_type": "video", "width": 320, "height": 240},
                {"codec_type": "audio", "codec_name": "ac3"}
            ],
            "format": {"duration": "12.5"}
        }"#;
        let info = parse_probe_output(json).unwrap();
        assert!(info.has_video && info.has_audio);
        assert_eq!(info.width, Some(320));
        assert_eq!(info.duration, 12.5);
        assert_eq!(info.audio_codec.as_deref(), Some("ac3"));
    }

    #[test]
    fn test_parse_silent_video() {
        let json = br#"{"streams": [{"codec_type": "video"}], "format": {}}"#;
        let info = parse_probe_output(json).unwrap();
        assert!(!info.has_audio);
        assert_eq!(info.audio_codec, None);
        assert_eq!(info.duration, 0.0);
    }

    #[tokio::test]
    async fn test_missing_file() {
        let err = probe_media("/nonexistent/file.mp4").await.unwrap_err();
        assert!(matches!(err, MediaError::FileNotFound(_)));
    }
}
