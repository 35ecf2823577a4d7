use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShortenPayload {
    #[serde(default)]
    pub original_url: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveQuery {
    #[serde(default)]
    pub short_url: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShortenedUrl {
    /// `scheme://host/{short_code}`
    pub short_url: String,
    pub short_code: String,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
}

#[derive(Serialize)]
pub struct ResolvedUrl {
    pub original_url: String,
    #[serde(rename = "expiresAt", with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
}

#[derive(Serialize)]
pub struct Error {
    pub error: String,
    pub error_id: String,
}
