//! Streaming upload validation and storage.
//!
//! Checks run in a fixed order: the declared MIME type before anything is
//! written, the streaming size ceiling while bytes arrive, then the stored
//! size bounds and the magic-byte signature read back from disk. The stored
//! file is owned by a [`CleanupGuard`] from the moment its path is chosen.

use axum::extract::multipart::{Field, Multipart, MultipartError};
use axum::http::StatusCode;
use chrono::Utc;
use numeral_core::{display_label, AssetId, ImageType, UploadedAsset, SIGNATURE_PROBE_LEN};
use numeral_executor::{CleanupGuard, PathSandbox, SandboxedPath};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::config::UploadLimits;
use crate::error::{GatewayError, ValidationError};

/// Multipart field carrying the image.
pub const IMAGE_FIELD: &str = "image";

/// Multipart field carrying the client correlation token.
pub const FILE_KEY_FIELD: &str = "fileKey";

/// Longest accepted `fileKey`, in bytes.
pub const MAX_FILE_KEY_BYTES: usize = 1024;

/// An upload that passed every check and is stored inside the upload root.
#[derive(Debug)]
pub struct AcceptedUpload {
    /// Record of the stored file.
    pub asset: UploadedAsset,
    /// Owner of the stored file. Release it once the response is known.
    pub guard: CleanupGuard,
    /// Client correlation token, echoed back verbatim.
    pub file_key: Option<String>,
}

/// Bytes written for the `image` field, before the post-storage checks.
struct Stored {
    id: AssetId,
    content_type: ImageType,
    size: u64,
    original_name: String,
}

/// Validates and stores `/predict` uploads.
#[derive(Debug, Clone)]
pub struct UploadValidator {
    sandbox: PathSandbox,
    limits: UploadLimits,
}

impl UploadValidator {
    /// Create a validator storing into `sandbox`.
    #[must_use]
    pub fn new(sandbox: PathSandbox, limits: UploadLimits) -> Self {
        Self { sandbox, limits }
    }

    /// Size bounds in force.
    #[must_use]
    pub fn limits(&self) -> UploadLimits {
        self.limits
    }

    /// Read the multipart body, store the image and run every check.
    ///
    /// On failure at any stage the partially written file, if any, has been
    /// deleted by the time this returns.
    ///
    /// # Errors
    /// - [`GatewayError::Validation`] for a missing, duplicated, mistyped,
    ///   mis-sized or mis-signed image, or a malformed body.
    /// - [`GatewayError::Security`] if the generated name escapes the root.
    /// - [`GatewayError::Io`] if the file cannot be written.
    pub async fn accept(&self, multipart: &mut Multipart) -> Result<AcceptedUpload, GatewayError> {
        let mut guard = None;
        match self.receive(multipart, &mut guard).await {
            Ok((stored, file_key)) => match guard.take() {
                Some(guard) => {
                    let asset = UploadedAsset::new(
                        stored.id,
                        guard.path().as_path().to_owned(),
                        stored.content_type,
                        stored.size,
                        stored.original_name,
                    );
                    Ok(AcceptedUpload { asset, guard, file_key })
                }
                None => Err(GatewayError::Internal("stored upload has no owner".to_owned())),
            },
            Err(e) => {
                if let Some(guard) = guard.take() {
                    if let Err(cleanup) = guard.release().await {
                        tracing::error!(error = %cleanup, "failed to remove rejected upload");
                    }
                }
                Err(e)
            }
        }
    }

    async fn receive(
        &self,
        multipart: &mut Multipart,
        guard: &mut Option<CleanupGuard>,
    ) -> Result<(Stored, Option<String>), GatewayError> {
        let mut stored = None;
        let mut file_key = None;

        while let Some(field) =
            multipart.next_field().await.map_err(|e| self.multipart_error(&e))?
        {
            match field.name() {
                Some(IMAGE_FIELD) => {
                    if guard.is_some() {
                        return Err(ValidationError::MultipleFiles.into());
                    }
                    stored = Some(self.store(field, guard).await?);
                }
                Some(FILE_KEY_FIELD) => {
                    let text = field.text().await.map_err(|e| self.multipart_error(&e))?;
                    if text.len() > MAX_FILE_KEY_BYTES {
                        return Err(ValidationError::FileKeyTooLong.into());
                    }
                    file_key = Some(text);
                }
                other => {
                    tracing::debug!(field = ?other, "ignoring unknown multipart field");
                }
            }
        }

        let Some(stored) = stored else {
            return Err(ValidationError::MissingFile.into());
        };
        let Some(owner) = guard.as_ref() else {
            return Err(GatewayError::Internal("stored upload has no owner".to_owned()));
        };

        if stored.size < self.limits.min_bytes {
            let min = self.limits.min_bytes;
            return Err(ValidationError::TooSmall { min, actual: stored.size }.into());
        }
        if stored.size > self.limits.max_bytes {
            return Err(ValidationError::TooLarge { limit: self.limits.max_bytes }.into());
        }

        let head = read_head(owner.path()).await?;
        if !stored.content_type.matches_signature(&head) {
            tracing::warn!(
                asset_id = %stored.id,
                declared = stored.content_type.mime(),
                detected = ?ImageType::detect(&head),
                "upload signature does not match declared type"
            );
            return Err(ValidationError::SignatureMismatch {
                declared: stored.content_type.mime().to_owned(),
            }
            .into());
        }

        Ok((stored, file_key))
    }

    /// Stream one `image` field to a freshly named file inside the root.
    async fn store(
        &self,
        mut field: Field<'_>,
        guard: &mut Option<CleanupGuard>,
    ) -> Result<Stored, GatewayError> {
        let declared = field.content_type().unwrap_or_default().to_owned();
        let content_type = ImageType::from_mime(&declared).map_err(|_| {
            ValidationError::UnsupportedMediaType { declared: declared.clone() }
        })?;
        let original_name = display_label(field.file_name().unwrap_or_default());

        let id = AssetId::new();
        let path = self.sandbox.confine(stored_name(id, content_type))?;
        let owner = guard.insert(CleanupGuard::acquire(path));

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(owner.path().as_path())
            .await?;

        let mut hasher = Sha256::new();
        let mut size: u64 = 0;
        while let Some(chunk) = field.chunk().await.map_err(|e| self.multipart_error(&e))? {
            size += chunk.len() as u64;
            if size > self.limits.max_bytes {
                let limit = self.limits.max_bytes;
                tracing::warn!(asset_id = %id, limit, "upload exceeded size limit");
                return Err(ValidationError::TooLarge { limit: self.limits.max_bytes }.into());
            }
            hasher.update(&chunk);
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        drop(file);

        tracing::info!(
            asset_id = %id,
            content_type = content_type.mime(),
            size,
            sha256 = %hex(&hasher.finalize()),
            original_name = %original_name,
            "upload stored"
        );
        Ok(Stored { id, content_type, size, original_name })
    }

    fn multipart_error(&self, err: &MultipartError) -> GatewayError {
        if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
            ValidationError::TooLarge { limit: self.limits.max_bytes }.into()
        } else {
            ValidationError::Malformed(err.body_text()).into()
        }
    }
}

/// Server-generated storage name. Never derived from client input.
fn stored_name(id: AssetId, content_type: ImageType) -> String {
    format!(
        "upload-{}-{}{}",
        Utc::now().format("%Y%m%d%H%M%S%9f"),
        id.as_uuid().simple(),
        content_type.extension()
    )
}

async fn read_head(path: &SandboxedPath) -> Result<Vec<u8>, GatewayError> {
    let file = tokio::fs::File::open(path.as_path()).await?;
    let mut head = Vec::with_capacity(SIGNATURE_PROBE_LEN);
    file.take(SIGNATURE_PROBE_LEN as u64).read_to_end(&mut head).await?;
    Ok(head)
}

fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write as _;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}
