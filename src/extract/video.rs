//! Video extraction: audio track → transcript + structural outline.
//!
//! The provider extracts the audio with ffmpeg, then calls two external
//! capability providers concurrently: a speech-to-text service returning
//! timed transcript segments, and an outliner returning titled sections
//! with time ranges. Each section becomes one extracted unit whose text is
//! the transcript slice overlapping its range.

use async_trait::async_trait;
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::config::MediaConfig;
use crate::error::{EngineError, Result};
use crate::extract::Extractor;
use crate::models::{DocumentKind, ExtractedUnit, Locator, UnitMetadata};

/// One timed piece of the transcript.
#[derive(Debug, Clone, Deserialize)]
pub struct TranscriptSegment {
    pub start_secs: f64,
    pub end_secs: f64,
    pub text: String,
}

/// One titled section of the outline.
#[derive(Debug, Clone, Deserialize)]
pub struct OutlineSection {
    pub title: String,
    pub start_secs: u64,
    pub end_secs: u64,
}

#[async_trait]
pub trait SpeechToText: Send + Sync {
    async fn transcribe(&self, audio: &Path) -> Result<Vec<TranscriptSegment>>;
}

#[async_trait]
pub trait Outliner: Send + Sync {
    async fn outline(&self, audio: &Path) -> Result<Vec<OutlineSection>>;
}

fn media_err(e: impl std::fmt::Display) -> EngineError {
    EngineError::Extraction(format!("media service error: {}", e))
}

async fn upload_audio(client: &reqwest::Client, url: &str, audio: &Path) -> Result<reqwest::Response> {
    let bytes = tokio::fs::read(audio).await?;
    let part = reqwest::multipart::Part::bytes(bytes)
        .file_name("audio.wav")
        .mime_str("audio/wav")
        .map_err(media_err)?;
    let form = reqwest::multipart::Form::new().part("file", part);

    let response = client.post(url).multipart(form).send().await.map_err(media_err)?;
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(media_err(format!("{}: {}", status, body)));
    }
    Ok(response)
}

/// Speech-to-text over HTTP: uploads the audio and expects
/// `{"segments": [{"start_secs", "end_secs", "text"}]}`.
pub struct HttpSpeechToText {
    url: String,
    client: reqwest::Client,
}

impl HttpSpeechToText {
    pub fn new(url: String) -> Self {
        Self {
            url,
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(600))
                .build()
                .unwrap_or_default(),
        }
    }
}

#[derive(Deserialize)]
struct TranscribeResponse {
    segments: Vec<TranscriptSegment>,
}

#[async_trait]
impl SpeechToText for HttpSpeechToText {
    async fn transcribe(&self, audio: &Path) -> Result<Vec<TranscriptSegment>> {
        let response = upload_audio(&self.client, &self.url, audio).await?;
        let parsed: TranscribeResponse = response.json().await.map_err(media_err)?;
        Ok(parsed.segments)
    }
}

/// Outliner over HTTP: uploads the audio and expects
/// `{"sections": [{"title", "start_secs", "end_secs"}]}`.
pub struct HttpOutliner {
    url: String,
    client: reqwest::Client,
}

impl HttpOutliner {
    pub fn new(url: String) -> Self {
        Self {
            url,
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(600))
                .build()
                .unwrap_or_default(),
        }
    }
}

#[derive(Deserialize)]
struct OutlineResponse {
    sections: Vec<OutlineSection>,
}

#[async_trait]
impl Outliner for HttpOutliner {
    async fn outline(&self, audio: &Path) -> Result<Vec<OutlineSection>> {
        let response = upload_audio(&self.client, &self.url, audio).await?;
        let parsed: OutlineResponse = response.json().await.map_err(media_err)?;
        Ok(parsed.sections)
    }
}

// ============ Composite video provider ============

pub struct VideoExtractor {
    ffmpeg_bin: String,
    speech: Option<Arc<dyn SpeechToText>>,
    outliner: Option<Arc<dyn Outliner>>,
}

impl VideoExtractor {
    pub fn from_config(media: &MediaConfig) -> Self {
        Self {
            ffmpeg_bin: media.ffmpeg_bin.clone(),
            speech: media
                .transcribe_url
                .clone()
                .map(|url| Arc::new(HttpSpeechToText::new(url)) as Arc<dyn SpeechToText>),
            outliner: media
                .outline_url
                .clone()
                .map(|url| Arc::new(HttpOutliner::new(url)) as Arc<dyn Outliner>),
        }
    }

    pub fn with_providers(
        ffmpeg_bin: String,
        speech: Arc<dyn SpeechToText>,
        outliner: Arc<dyn Outliner>,
    ) -> Self {
        Self {
            ffmpeg_bin,
            speech: Some(speech),
            outliner: Some(outliner),
        }
    }

    /// Extract the audio track to a mono 16 kHz wav suitable for
    /// transcription.
    async fn extract_audio(&self, video: &Path, out: &Path) -> Result<()> {
        let status = tokio::process::Command::new(&self.ffmpeg_bin)
            .arg("-y")
            .arg("-i")
            .arg(video)
            .args(["-vn", "-acodec", "pcm_s16le", "-ar", "16000", "-ac", "1"])
            .arg(out)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .await
            .map_err(|e| EngineError::Extraction(format!("failed to run ffmpeg: {}", e)))?;

        if !status.success() {
            return Err(EngineError::Extraction(format!(
                "ffmpeg exited with {} for {}",
                status,
                video.display()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Extractor for VideoExtractor {
    fn kind(&self) -> DocumentKind {
        DocumentKind::Video
    }

    async fn extract(&self, path: &Path) -> Result<Vec<ExtractedUnit>> {
        let (speech, outliner) = match (&self.speech, &self.outliner) {
            (Some(s), Some(o)) => (s.clone(), o.clone()),
            _ => {
                return Err(EngineError::Extraction(
                    "video ingestion requires media.transcribe_url and media.outline_url".into(),
                ))
            }
        };

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let workdir = tempfile::tempdir()?;
        let audio = workdir.path().join("audio.wav");
        self.extract_audio(path, &audio).await?;

        // Transcript and outline are independent calls against the same audio
        let (segments, sections) =
            tokio::try_join!(speech.transcribe(&audio), outliner.outline(&audio))?;

        Ok(attach_transcript(&sections, &segments, &file_name))
    }
}

/// Turn outline sections into units carrying their transcript slice. When
/// the outline is empty the whole transcript becomes a single unit.
pub fn attach_transcript(
    sections: &[OutlineSection],
    segments: &[TranscriptSegment],
    file_name: &str,
) -> Vec<ExtractedUnit> {
    if sections.is_empty() {
        let text = segments
            .iter()
            .map(|s| s.text.trim())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        return vec![ExtractedUnit::plain(text, file_name)];
    }

    sections
        .iter()
        .map(|section| {
            let text = segments
                .iter()
                .filter(|seg| {
                    seg.start_secs < section.end_secs as f64
                        && seg.end_secs > section.start_secs as f64
                })
                .map(|seg| seg.text.trim())
                .filter(|t| !t.is_empty())
                .collect::<Vec<_>>()
                .join(" ");

            ExtractedUnit {
                text,
                metadata: UnitMetadata {
                    file_name: file_name.to_string(),
                    locator: Some(Locator::TimeRange {
                        start_secs: section.start_secs,
                        end_secs: section.end_secs,
                    }),
                    summary: Some(section.title.clone()),
                },
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(start: f64, end: f64, text: &str) -> TranscriptSegment {
        TranscriptSegment {
            start_secs: start,
            end_secs: end,
            text: text.to_string(),
        }
    }

    #[test]
    fn sections_get_their_transcript_slice() {
        let sections = vec![
            OutlineSection {
                title: "Intro".into(),
                start_secs: 0,
                end_secs: 60,
            },
            OutlineSection {
                title: "Main".into(),
                start_secs: 60,
                end_secs: 120,
            },
        ];
        let segments = vec![
            seg(0.0, 30.0, "Welcome to the lecture."),
            seg(30.0, 59.0, "Today we cover ingestion."),
            seg(61.0, 110.0, "The pipeline has five stages."),
        ];

        let units = attach_transcript(&sections, &segments, "lecture.mp4");
        assert_eq!(units.len(), 2);
        assert!(units[0].text.contains("Welcome"));
        assert!(units[0].text.contains("ingestion"));
        assert!(!units[0].text.contains("five stages"));
        assert!(units[1].text.contains("five stages"));
        assert_eq!(units[0].metadata.summary.as_deref(), Some("Intro"));
        assert_eq!(
            units[1].metadata.locator,
            Some(Locator::TimeRange {
                start_secs: 60,
                end_secs: 120
            })
        );
    }

    #[test]
    fn empty_outline_falls_back_to_full_transcript() {
        let segments = vec![seg(0.0, 5.0, "Hello."), seg(5.0, 9.0, "World.")];
        let units = attach_transcript(&[], &segments, "clip.mp4");
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].text, "Hello. World.");
    }

    #[test]
    fn boundary_segment_lands_in_both_sections() {
        let sections = vec![
            OutlineSection {
                title: "A".into(),
                start_secs: 0,
                end_secs: 10,
            },
            OutlineSection {
                title: "B".into(),
                start_secs: 10,
                end_secs: 20,
            },
        ];
        let segments = vec![seg(8.0, 12.0, "Straddles the cut.")];
        let units = attach_transcript(&sections, &segments, "v.mp4");
        assert!(units[0].text.contains("Straddles"));
        assert!(units[1].text.contains("Straddles"));
    }

    #[tokio::test]
    async fn unconfigured_providers_fail_fast() {
        let extractor = VideoExtractor::from_config(&MediaConfig::default());
        let err = extractor
            .extract(Path::new("/tmp/nope.mp4"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Extraction(_)));
    }
}
