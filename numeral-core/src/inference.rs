use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// A recognised digit label in `0..=9`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "u8")]
#[non_exhaustive]
pub struct Digit(u8);

impl Digit {
    /// Creates a `Digit` from a worker-reported integer.
    ///
    /// # Errors
    /// Returns [`CoreError::InvalidDigit`] if `value` is outside `0..=9`.
    pub fn new(value: i64) -> Result<Self, CoreError> {
        match u8::try_from(value) {
            Ok(d) if d <= 9 => Ok(Self(d)),
            _ => Err(CoreError::InvalidDigit { value }),
        }
    }

    /// Returns the label as a plain integer.
    #[must_use]
    pub fn value(self) -> u8 {
        self.0
    }
}

impl TryFrom<i64> for Digit {
    type Error = CoreError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Digit> for u8 {
    fn from(d: Digit) -> Self {
        d.0
    }
}

impl fmt::Display for Digit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A normalised confidence score in the range `[0.0, 1.0]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
#[non_exhaustive]
pub struct Confidence(f64);

impl Confidence {
    /// Creates a `Confidence` from a value in `[0.0, 1.0]`.
    ///
    /// # Errors
    /// Returns [`CoreError::InvalidConfidence`] if `value` is NaN or outside
    /// `[0.0, 1.0]`.
    pub fn new(value: f64) -> Result<Self, CoreError> {
        if value.is_nan() || !(0.0..=1.0).contains(&value) {
            return Err(CoreError::InvalidConfidence { value });
        }
        Ok(Self(value))
    }

    /// Returns the inner `f64` value.
    #[must_use]
    pub fn value(self) -> f64 {
        self.0
    }
}

impl TryFrom<f64> for Confidence {
    type Error = CoreError;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Confidence> for f64 {
    fn from(c: Confidence) -> Self {
        c.0
    }
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.4}", self.0)
    }
}

/// The validated outcome of one worker invocation.
///
/// Immutable once built; only range-checked values can be stored here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct InferenceResult {
    /// Predicted digit.
    pub digit: Digit,
    /// Worker confidence in the prediction.
    pub confidence: Confidence,
    /// Whatever the worker wrote to stderr; server-side diagnostics only.
    pub diagnostics: String,
}

impl InferenceResult {
    /// Bundle a validated digit and confidence with the worker's diagnostics.
    #[must_use]
    pub fn new(digit: Digit, confidence: Confidence, diagnostics: String) -> Self {
        Self { digit, confidence, diagnostics }
    }
}
