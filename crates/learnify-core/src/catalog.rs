//! Share catalog: the videos a device offers to nearby peers, and the
//! metadata documents served for them.
//!
//! Field names follow the JSON the transfer server puts on the wire
//! (`channelTitle`, `duration`, `hasTranscript`), so these types serialize
//! directly into response bodies.

use serde::{Deserialize, Serialize};

/// One timed line of a transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptSegment {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    pub language: String,
    pub segments: Vec<TranscriptSegment>,
}

/// Full metadata for a single video, including its transcript.
///
/// Served by `GET /video/{id}/meta` and handed to the library together with
/// the downloaded file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoMeta {
    pub id: String,
    pub title: String,
    pub channel_title: String,
    /// Duration in seconds.
    pub duration: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcript: Option<Transcript>,
}

/// A locally stored video that is being offered to peers.
///
/// The catalog is a read-only snapshot: it is replaced wholesale, never
/// edited in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedVideo {
    pub meta: VideoMeta,
}

impl SharedVideo {
    pub fn new(meta: VideoMeta) -> Self {
        Self { meta }
    }

    pub fn id(&self) -> &str {
        &self.meta.id
    }

    /// Listing entry for `GET /videos`.
    pub fn entry(&self) -> ShareCatalogEntry {
        ShareCatalogEntry {
            id: self.meta.id.clone(),
            title: self.meta.title.clone(),
            channel_title: self.meta.channel_title.clone(),
            duration: self.meta.duration,
            has_transcript: self.meta.transcript.is_some(),
        }
    }
}

/// Catalog listing entry, what a peer sees before choosing a download.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShareCatalogEntry {
    pub id: String,
    pub title: String,
    /// Owner channel title.
    pub channel_title: String,
    /// Duration in seconds.
    pub duration: u32,
    pub has_transcript: bool,
}

/// Body of `GET /info`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub name: String,
    pub video_count: u32,
}

/// Body of `GET /videos`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoList {
    pub videos: Vec<ShareCatalogEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(transcript: bool) -> VideoMeta {
        VideoMeta {
            id: "abc".into(),
            title: "Ownership in five minutes".into(),
            channel_title: "Rustaceans".into(),
            duration: 300,
            transcript: transcript.then(|| Transcript {
                language: "en".into(),
                segments: vec![TranscriptSegment {
                    start: 0.0,
                    end: 1.5,
                    text: "hello".into(),
                }],
            }),
        }
    }

    #[test]
    fn entry_reports_transcript_presence() {
        assert!(SharedVideo::new(meta(true)).entry().has_transcript);
        assert!(!SharedVideo::new(meta(false)).entry().has_transcript);
    }

    #[test]
    fn catalog_entry_uses_wire_field_names() {
        let json = serde_json::to_value(SharedVideo::new(meta(false)).entry()).unwrap();
        assert_eq!(json["channelTitle"], "Rustaceans");
        assert_eq!(json["duration"], 300);
        assert_eq!(json["hasTranscript"], false);
    }

    #[test]
    fn meta_without_transcript_omits_field() {
        let json = serde_json::to_string(&meta(false)).unwrap();
        assert!(!json.contains("transcript"));
        let back: VideoMeta = serde_json::from_str(&json).unwrap();
        assert!(back.transcript.is_none());
    }

    #[test]
    fn info_serializes_video_count_camel_case() {
        let info = PeerInfo {
            name: "Pixel".into(),
            video_count: 4,
        };
        assert_eq!(
            serde_json::to_string(&info).unwrap(),
            r#"{"name":"Pixel","videoCount":4}"#
        );
    }
}
