use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::id::AssetId;

/// JPEG start-of-image marker followed by the first marker prefix.
pub const JPEG_SIGNATURE: [u8; 3] = [0xFF, 0xD8, 0xFF];

/// The fixed 8-byte PNG file signature.
pub const PNG_SIGNATURE: [u8; 8] = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];

/// Number of leading bytes that must be read to check any known signature.
pub const SIGNATURE_PROBE_LEN: usize = 16;

/// An image format accepted by the upload pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum ImageType {
    /// `image/jpeg` (also declared as `image/jpg` by some clients).
    Jpeg,
    /// `image/png`.
    Png,
}

impl ImageType {
    /// Every accepted type, in the order signatures are probed.
    pub const ALL: [ImageType; 2] = [ImageType::Png, ImageType::Jpeg];

    /// Maps a declared MIME type onto the whitelist.
    ///
    /// Parameters such as `; charset=binary` are ignored and the comparison is
    /// case-insensitive.
    ///
    /// # Errors
    /// Returns [`CoreError::UnsupportedMediaType`] for anything other than
    /// `image/jpeg`, `image/jpg` or `image/png`.
    pub fn from_mime(mime: &str) -> Result<Self, CoreError> {
        let essence = mime.split(';').next().unwrap_or_default().trim();
        match essence.to_ascii_lowercase().as_str() {
            "image/jpeg" | "image/jpg" => Ok(Self::Jpeg),
            "image/png" => Ok(Self::Png),
            _ => Err(CoreError::UnsupportedMediaType { mime: mime.to_owned() }),
        }
    }

    /// Canonical MIME type.
    #[must_use]
    pub fn mime(self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
        }
    }

    /// File extension used for stored uploads, including the leading dot.
    #[must_use]
    pub fn extension(self) -> &'static str {
        match self {
            Self::Jpeg => ".jpg",
            Self::Png => ".png",
        }
    }

    /// Magic-number sequences that identify this format.
    #[must_use]
    pub fn signatures(self) -> &'static [&'static [u8]] {
        match self {
            Self::Jpeg => &[&JPEG_SIGNATURE],
            Self::Png => &[&PNG_SIGNATURE],
        }
    }

    /// Returns `true` if `head` starts with one of this type's signatures.
    #[must_use]
    pub fn matches_signature(self, head: &[u8]) -> bool {
        self.signatures().iter().any(|sig| head.starts_with(sig))
    }

    /// Identifies the format from leading bytes alone, ignoring any label.
    #[must_use]
    pub fn detect(head: &[u8]) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.matches_signature(head))
    }
}

impl fmt::Display for ImageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mime())
    }
}

/// A client upload that has been accepted and stored inside the upload root.
///
/// Exactly one exists per request that reaches storage. The `path` is the
/// confined absolute location; `original_name` is a display label only and is
/// never interpreted as a path.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[non_exhaustive]
pub struct UploadedAsset {
    /// Unique identifier for this upload.
    pub id: AssetId,
    /// Absolute path of the stored bytes, inside the upload root.
    pub path: PathBuf,
    /// Declared (and signature-verified) content type.
    pub content_type: ImageType,
    /// Stored size in bytes.
    pub size: u64,
    /// Client-supplied filename, sanitised for display.
    pub original_name: String,
    /// When the upload finished storing.
    pub stored_at: DateTime<Utc>,
}

impl UploadedAsset {
    /// Create a new asset record stamped with the current time.
    #[must_use]
    pub fn new(
        id: AssetId,
        path: PathBuf,
        content_type: ImageType,
        size: u64,
        original_name: String,
    ) -> Self {
        Self {
            id,
            path,
            content_type,
            size,
            original_name,
            stored_at: Utc::now(),
        }
    }
}

/// Reduce a client-supplied filename to a printable display label.
///
/// Keeps only the final path component, drops control characters and caps
/// the length. The result is never used to build a filesystem path.
#[must_use]
pub fn display_label(raw: &str) -> String {
    const MAX_LABEL_CHARS: usize = 255;

    let last = raw.rsplit(['/', '\\']).next().unwrap_or_default();
    let label: String = last
        .chars()
        .filter(|c| !c.is_control())
        .take(MAX_LABEL_CHARS)
        .collect();
    if label.trim().is_empty() {
        "upload".to_owned()
    } else {
        label
    }
}
