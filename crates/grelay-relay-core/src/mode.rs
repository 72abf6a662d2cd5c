use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayMode {
    ChatCompletions,
    Completions,
    Embeddings,
    Moderations,
    ImagesGenerations,
    Edits,
    AudioSpeech,
    AudioTranscription,
    AudioTranslation,
    Rerank,
    ParsePdf,
}

impl RelayMode {
    pub const ALL: [RelayMode; 11] = [
        RelayMode::ChatCompletions,
        RelayMode::Completions,
        RelayMode::Embeddings,
        RelayMode::Moderations,
        RelayMode::ImagesGenerations,
        RelayMode::Edits,
        RelayMode::AudioSpeech,
        RelayMode::AudioTranscription,
        RelayMode::AudioTranslation,
        RelayMode::Rerank,
        RelayMode::ParsePdf,
    ];

    /// Classifies an inbound path. Query strings must already be stripped.
    pub fn from_path(path: &str) -> Option<Self> {
        let path = path.trim_end_matches('/');
        let mode = match path {
            "/v1/chat/completions" => RelayMode::ChatCompletions,
            "/v1/completions" => RelayMode::Completions,
            "/v1/embeddings" => RelayMode::Embeddings,
            "/v1/moderations" => RelayMode::Moderations,
            "/v1/images/generations" => RelayMode::ImagesGenerations,
            "/v1/images/edits" | "/v1/edits" => RelayMode::Edits,
            "/v1/audio/speech" => RelayMode::AudioSpeech,
            "/v1/audio/transcriptions" => RelayMode::AudioTranscription,
            "/v1/audio/translations" => RelayMode::AudioTranslation,
            "/v1/rerank" => RelayMode::Rerank,
            "/v1/parse/pdf" => RelayMode::ParsePdf,
            _ if path.starts_with("/v1/engines/") && path.ends_with("/embeddings") => {
                RelayMode::Embeddings
            }
            _ => return None,
        };
        Some(mode)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RelayMode::ChatCompletions => "chat_completions",
            RelayMode::Completions => "completions",
            RelayMode::Embeddings => "embeddings",
            RelayMode::Moderations => "moderations",
            RelayMode::ImagesGenerations => "images_generations",
            RelayMode::Edits => "edits",
            RelayMode::AudioSpeech => "audio_speech",
            RelayMode::AudioTranscription => "audio_transcription",
            RelayMode::AudioTranslation => "audio_translation",
            RelayMode::Rerank => "rerank",
            RelayMode::ParsePdf => "parse_pdf",
        }
    }

    /// Stable numeric code stored on consumption records.
    pub fn code(self) -> i32 {
        match self {
            RelayMode::ChatCompletions => 1,
            RelayMode::Completions => 2,
            RelayMode::Embeddings => 3,
            RelayMode::Moderations => 4,
            RelayMode::ImagesGenerations => 5,
            RelayMode::Edits => 6,
            RelayMode::AudioSpeech => 7,
            RelayMode::AudioTranscription => 8,
            RelayMode::AudioTranslation => 9,
            RelayMode::Rerank => 10,
            RelayMode::ParsePdf => 11,
        }
    }

    /// Modes whose inbound body is a multipart form rather than JSON.
    pub fn is_multipart(self) -> bool {
        matches!(
            self,
            RelayMode::AudioTranscription | RelayMode::AudioTranslation | RelayMode::ParsePdf
        )
    }
}

impl fmt::Display for RelayMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
