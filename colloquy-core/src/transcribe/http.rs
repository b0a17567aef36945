//! Whisper-style HTTP recognition client.
//!
//! POSTs the utterance as multipart WAV to an OpenAI-compatible
//! `/audio/transcriptions` endpoint and parses `{ "text": … }`.

use std::time::Duration;

use reqwest::blocking::{multipart, Client};
use serde::Deserialize;
use tracing::debug;

use crate::error::{ColloquyError, Result};
use crate::segment::Utterance;
use crate::transcribe::{wav_bytes, SpeechRecognizer};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    text: String,
}

/// Recognition over HTTP against a Whisper-style transcription API.
pub struct HttpRecognizer {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
}

impl HttpRecognizer {
    /// # Errors
    /// Returns `ColloquyError::Recognition` if the HTTP client fails to build.
    pub fn new(
        endpoint: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<String>,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ColloquyError::Recognition(e.to_string()))?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key,
            model: model.into(),
        })
    }
}

impl SpeechRecognizer for HttpRecognizer {
    fn transcribe(&mut self, utterance: &Utterance, language: &str) -> Result<String> {
        let wav = wav_bytes(utterance)?;
        debug!(
            bytes = wav.len(),
            duration_ms = utterance.duration_ms(),
            "uploading utterance for recognition"
        );

        let form = multipart::Form::new()
            .part(
                "file",
                multipart::Part::bytes(wav)
                    .file_name("utterance.wav")
                    .mime_str("audio/wav")
                    .map_err(|e| ColloquyError::Recognition(e.to_string()))?,
            )
            .text("model", self.model.clone())
            .text("language", language.to_owned());

        let mut request = self.client.post(&self.endpoint).multipart(form);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .map_err(|e| ColloquyError::Recognition(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(ColloquyError::Recognition(format!(
                "recognition API error {status}: {body}"
            )));
        }

        let parsed: TranscriptionResponse = response
            .json()
            .map_err(|e| ColloquyError::Recognition(e.to_string()))?;

        Ok(parsed.text)
    }
}
