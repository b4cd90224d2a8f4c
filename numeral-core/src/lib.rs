//! Core types for the numeral upload-and-inference pipeline.
//!
//! Defines the domain types shared by the executor and the gateway:
//! stored uploads and their image signatures, validated inference results,
//! and the security-violation taxonomy.

#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]

pub mod asset;
pub mod error;
pub mod id;
pub mod inference;
pub mod violation;

pub use asset::{
    display_label, ImageType, UploadedAsset, JPEG_SIGNATURE, PNG_SIGNATURE, SIGNATURE_PROBE_LEN,
};
pub use error::CoreError;
pub use id::{AssetId, ClientKey};
pub use inference::{Confidence, Digit, InferenceResult};
pub use violation::SecurityViolation;
