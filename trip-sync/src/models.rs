use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use supaclient::Row;

use crate::SyncError;

/// A trip branch ("direction" on the server).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Destination {
    pub id: String,
    pub title: String,
    pub country: String,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub cover_url: Option<String>,
    #[serde(rename = "user_id")]
    pub owner_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub cost: Option<String>,
    #[serde(default)]
    pub source_url: Option<String>,
    /// Tag names. Not a column: filled in from `locations_tags`.
    #[serde(default)]
    pub tags: Vec<String>,
    pub direction_id: String,
    #[serde(rename = "user_id")]
    pub owner_id: String,
    pub created_at: DateTime<Utc>,
    /// Server-side favourite flag for the current user, when the read computed one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_favourite: Option<bool>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub id: String,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Favourite {
    pub user_id: String,
    pub location_id: String,
}

/// The slim location shown on a destination card.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CardLocation {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub image_url: Option<String>,
    pub direction_id: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ImageFile {
    pub name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

impl ImageFile {
    /// The text after the last `.` of the file name, or the whole name if there is none.
    pub fn extension(&self) -> &str {
        self.name.rsplit('.').next().unwrap_or(&self.name)
    }
}

/// Tags as a form hands them over: either a list or one comma-separated string.
#[derive(Clone, Debug, PartialEq)]
pub enum TagInput {
    List(Vec<String>),
    Text(String),
}

impl Default for TagInput {
    fn default() -> Self {
        TagInput::List(Vec::new())
    }
}

impl From<&str> for TagInput {
    fn from(text: &str) -> Self {
        TagInput::Text(text.to_string())
    }
}

impl From<Vec<String>> for TagInput {
    fn from(list: Vec<String>) -> Self {
        TagInput::List(list)
    }
}

impl<const N: usize> From<[&str; N]> for TagInput {
    fn from(list: [&str; N]) -> Self {
        TagInput::List(list.iter().map(|tag| tag.to_string()).collect())
    }
}

impl TagInput {
    /// Trimmed names, empties dropped, first occurrence kept.
    pub fn names(&self) -> Vec<String> {
        match self {
            TagInput::List(list) => normalize_tags(list.iter().map(String::as_str)),
            TagInput::Text(text) => normalize_tags(text.split(',')),
        }
    }
}

pub fn normalize_tags<'a>(raw: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for name in raw.into_iter().map(str::trim) {
        if !name.is_empty() && !names.iter().any(|seen| seen == name) {
            names.push(name.to_string());
        }
    }
    names
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct NewDestination {
    pub title: String,
    pub country: String,
    pub city: Option<String>,
    /// Required; kept optional so a missing cover is reported as a validation error.
    pub cover: Option<ImageFile>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct DestinationUpdate {
    pub title: String,
    pub country: String,
    pub city: Option<String>,
    /// A replacement cover, if the user picked one.
    pub cover: Option<ImageFile>,
    pub old_cover_url: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct LocationDraft {
    pub title: String,
    pub description: Option<String>,
    pub address: Option<String>,
    pub cost: Option<String>,
    pub source_url: Option<String>,
    pub tags: TagInput,
    pub image: Option<ImageFile>,
    /// Destination to add to. `None` uses the active destination.
    pub direction_id: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct LocationUpdate {
    pub title: String,
    pub description: Option<String>,
    pub address: Option<String>,
    pub cost: Option<String>,
    pub source_url: Option<String>,
    pub tags: TagInput,
    pub image: Option<ImageFile>,
    pub old_image_url: Option<String>,
}

pub(crate) fn from_row<T: DeserializeOwned>(row: Row) -> Result<T, SyncError> {
    Ok(serde_json::from_value(serde_json::Value::Object(row))?)
}

pub(crate) fn from_rows<T: DeserializeOwned>(rows: Vec<Row>) -> Result<Vec<T>, SyncError> {
    rows.into_iter().map(from_row).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tag_text_is_split_and_trimmed() {
        assert_eq!(
            TagInput::from(" beach, food ,, beach,").names(),
            vec!["beach".to_string(), "food".to_string()]
        );
        assert!(TagInput::from("  ").names().is_empty());
    }

    #[test]
    fn test_location_reads_server_row() {
        let row = json!({
            "id": "loc-1",
            "title": "Narikala",
            "direction_id": "tbilisi",
            "user_id": "alice",
            "created_at": "2024-05-01T10:00:00.000001+00:00",
            "cost": null,
        });
        let location: Location = serde_json::from_value(row).unwrap();
        assert_eq!(location.owner_id, "alice");
        assert!(location.tags.is_empty());
        assert_eq!(location.is_favourite, None);
    }

    #[test]
    fn test_extension() {
        let image = ImageFile {
            name: "cover.final.PNG".into(),
            content_type: "image/png".into(),
            bytes: vec![],
        };
        assert_eq!(image.extension(), "PNG");
    }
}
