//! HTTP surface of the numeral inference service.
//!
//! Accepts untrusted image uploads on `POST /predict`, gates them on
//! credentials and a per-client rate limit, validates and stores them inside
//! the upload root, runs the inference worker and deletes the upload before
//! responding.

#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]

pub mod auth;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod rate_limit;
pub mod routes;
pub mod upload;
