//! API request and response models.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize};

use crate::store::StagedArtifact;

/// Parameters of `/convert`, from the query string or a JSON body.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConvertParams {
    pub url: Option<String>,
    pub format: Option<String>,
    pub proxy: Option<String>,
}

/// How `/download` hands the staged result back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Delivery {
    /// Stream the whole file, then evict it.
    #[default]
    File,
    /// Keep the artifact and describe it as JSON.
    Artifact,
}

/// Parameters of `/download`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DownloadParams {
    pub url: Option<String>,
    pub format: Option<String>,
    pub proxy: Option<String>,
    #[serde(default, deserialize_with = "deserialize_flag")]
    pub extract_audio: Option<bool>,
    #[serde(default)]
    pub delivery: Option<Delivery>,
}

/// Parameters of `/info`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InfoParams {
    pub url: Option<String>,
    #[serde(default, deserialize_with = "deserialize_flag")]
    pub full: Option<bool>,
    pub proxy: Option<String>,
}

/// A staged artifact as reported to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactResponse {
    pub id: String,
    pub path: String,
    pub content_type: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
    /// Where the artifact can be fetched from this service.
    pub url: String,
}

impl From<&StagedArtifact> for ArtifactResponse {
    fn from(artifact: &StagedArtifact) -> Self {
        Self {
            id: artifact.id.clone(),
            path: artifact.path.to_string_lossy().into_owned(),
            content_type: artifact.content_type.clone(),
            size: artifact.size,
            created_at: artifact.created_at,
            url: format!("/artifacts/{}", artifact.id),
        }
    }
}

/// Liveness report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
}

/// Interpret a user-supplied boolean flag.
///
/// Accepts booleans, `0`/`1`, and the strings `true/false/1/0/yes/no/on/off`
/// in any case. An empty string is `false`.
pub fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

fn deserialize_flag<'de, D>(deserializer: D) -> Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    struct FlagVisitor;

    impl<'de> Visitor<'de> for FlagVisitor {
        type Value = Option<bool>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a boolean flag (true/false, 1/0, yes/no, on/off)")
        }

        fn visit_bool<E: de::Error>(self, v: bool) -> Result<Self::Value, E> {
            Ok(Some(v))
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
            match v {
                0 => Ok(Some(false)),
                1 => Ok(Some(true)),
                _ => Err(E::invalid_value(de::Unexpected::Unsigned(v), &self)),
            }
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
            match v {
                0 => Ok(Some(false)),
                1 => Ok(Some(true)),
                _ => Err(E::invalid_value(de::Unexpected::Signed(v), &self)),
            }
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
            parse_flag(v)
                .map(Some)
                .ok_or_else(|| E::invalid_value(de::Unexpected::Str(v), &self))
        }

        fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
            Ok(None)
        }

        fn visit_none<E: de::Error>(self) -> Result<Self::Value, E> {
            Ok(None)
        }
    }

    deserializer.deserialize_any(FlagVisitor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_strings() {
        for v in ["true", "TRUE", " yes ", "1", "On"] {
            assert_eq!(parse_flag(v), Some(true), "{v}");
        }
        for v in ["false", "No", "0", "off", ""] {
            assert_eq!(parse_flag(v), Some(false), "{v}");
        }
        assert_eq!(parse_flag("maybe"), None);
    }

    #[test]
    fn json_flags() {
        let p: DownloadParams = serde_json::from_str(r#"{"url":"u","extract_audio":false}"#).unwrap();
        assert_eq!(p.extract_audio, Some(false));
        let p: DownloadParams = serde_json::from_str(r#"{"url":"u","extract_audio":1}"#).unwrap();
        assert_eq!(p.extract_audio, Some(true));
        let p: DownloadParams = serde_json::from_str(r#"{"url":"u","extract_audio":"no"}"#).unwrap();
        assert_eq!(p.extract_audio, Some(false));
        let p: DownloadParams = serde_json::from_str(r#"{"url":"u","extract_audio":null}"#).unwrap();
        assert_eq!(p.extract_audio, None);
        let p: DownloadParams = serde_json::from_str(r#"{"url":"u"}"#).unwrap();
        assert_eq!(p.extract_audio, None);
        assert_eq!(p.delivery, None);

        assert!(serde_json::from_str::<DownloadParams>(r#"{"extract_audio":2}"#).is_err());
        assert!(serde_json::from_str::<InfoParams>(r#"{"full":"sometimes"}"#).is_err());
    }

    #[test]
    fn delivery_modes() {
        let p: DownloadParams = serde_json::from_str(r#"{"delivery":"artifact"}"#).unwrap();
        assert_eq!(p.delivery, Some(Delivery::Artifact));
        assert!(serde_json::from_str::<DownloadParams>(r#"{"delivery":"email"}"#).is_err());
    }
}
