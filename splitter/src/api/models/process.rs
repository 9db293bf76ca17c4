use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use utoipa::ToSchema;

/// Request payload for separating a track.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ProcessRequest {
    /// Publicly fetchable URL of the source audio
    #[schema(example = "https://cdn.example.com/uploads/my-song.mp3")]
    pub url: String,
}

/// Public URL of every produced stem, keyed by stem name, e.g.
/// `{"vocals": ".../processed/vocals_my-song.wav", "accompaniment": ".../processed/accompaniment_my-song.wav"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(transparent)]
pub struct ProcessResponse(pub BTreeMap<String, String>);

impl From<BTreeMap<String, String>> for ProcessResponse {
    fn from(urls: BTreeMap<String, String>) -> Self {
        Self(urls)
    }
}
