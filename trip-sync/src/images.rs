use chrono::{DateTime, Utc};
use rand::Rng;
use rand::distr::Alphanumeric;
use supaclient::BlobStore;

use crate::SyncError;
use crate::models::ImageFile;

/// `{user}/{millis}-{random}.{ext}`, with every character of the user id outside
/// `[A-Za-z0-9_-]` replaced by `_`.
pub(crate) fn image_path(user_id: &str, image: &ImageFile, now: DateTime<Utc>) -> String {
    let folder: String = user_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let suffix: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect();
    format!(
        "{folder}/{}-{suffix}.{}",
        now.timestamp_millis(),
        image.extension()
    )
}

/// Uploads `image` into the user's folder and returns its public URL.
pub(crate) async fn upload_image<B: BlobStore>(
    store: &B,
    user_id: &str,
    image: &ImageFile,
) -> Result<String, SyncError> {
    let path = image_path(user_id, image, Utc::now());
    store
        .upload(&path, image.bytes.clone(), &image.content_type)
        .await
        .map_err(|e| {
            log::error!("Upload of {path} failed: {e}");
            SyncError::Upload(e)
        })?;
    Ok(store.public_url(&path))
}

/// Removes the blob behind a public URL. Failures are logged, never returned.
pub(crate) async fn remove_image<B: BlobStore>(store: &B, url: &str) {
    let Some(path) = store.path_from_public_url(url) else {
        log::warn!("Cannot find a storage path in {url}, leaving it");
        return;
    };
    if let Err(e) = store.remove(vec![path.clone()]).await {
        log::error!("Failed to remove image {path}: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_path_sanitizes_user_folder() {
        let image = ImageFile {
            name: "photo.jpeg".into(),
            content_type: "image/jpeg".into(),
            bytes: vec![],
        };
        let now = DateTime::from_timestamp_millis(1_714_557_600_000).unwrap();
        let path = image_path("nino@tbilisi.ge", &image, now);

        let (folder, file) = path.split_once('/').unwrap();
        assert_eq!(folder, "nino_tbilisi_ge");
        assert!(file.starts_with("1714557600000-"));
        assert!(file.ends_with(".jpeg"));
        let random = &file["1714557600000-".len()..file.len() - ".jpeg".len()];
        assert_eq!(random.len(), 6);
        assert!(random.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }
}
