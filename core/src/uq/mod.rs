//! Uncertainty quantification (SNNE)
//!
//! Paraphrase samples of the draft are embedded and compared pairwise;
//! tight agreement means low semantic entropy and high confidence. The
//! normalized score `s1` lives in [0,1] with higher = more confident.

pub mod calibration;
pub mod sampling;
pub mod snne;

use serde::{Deserialize, Serialize};

/// One uncertainty reading for a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UqReading {
    /// Raw SNNE (typically negative; more negative = tighter agreement).
    pub raw: Option<f64>,
    /// Normalized confidence in [0,1].
    pub s1: f64,
    pub sample_count: usize,
}

impl UqReading {
    /// Reading for the degenerate single-sample case: maximum
    /// uncertainty.
    pub fn degenerate() -> Self {
        Self {
            raw: None,
            s1: 0.0,
            sample_count: 1,
        }
    }
}
