//! Fingerprint comparison, change classification, and forensic evidence.
//!
//! Comparison and the decision rule live in `sitewatch-diff`; this module
//! wires them to fingerprints, renders the safe diff, and keeps compressed
//! before/after evidence that can be replayed later with current
//! algorithms for audit or dispute.

use std::io::{Read, Write};

use anyhow::{Context, Result};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use sitewatch_diff::{ChangeType, SafeDiff, SimilarityMetrics, classify, compare, safe_diff};

use crate::types::{ForensicSnapshot, WeightedFingerprint};

/// Outcome of comparing a new fingerprint against the baseline.
#[derive(Debug, Clone)]
pub struct Detection {
    pub metrics: SimilarityMetrics,
    /// Present only for a meaningful change (score below threshold).
    pub change: Option<DetectedChange>,
}

/// The alert-worthy half of a detection.
#[derive(Debug, Clone)]
pub struct DetectedChange {
    pub change_type: ChangeType,
    pub safe_diff: SafeDiff,
}

/// Compare baseline and new fingerprints under the monitor's threshold.
pub fn detect(
    old: &WeightedFingerprint,
    new: &WeightedFingerprint,
    threshold: f64,
) -> Detection {
    if old.hash == new.hash {
        return Detection {
            metrics: SimilarityMetrics {
                jaccard: 1.0,
                levenshtein_ratio: 1.0,
                semantic: 1.0,
                final_score: 1.0,
            },
            change: None,
        };
    }

    let metrics = compare(
        &old.content_text,
        &new.content_text,
        &old.structure_signature,
        &new.structure_signature,
    );
    let change = classify(metrics.final_score, threshold).map(|change_type| DetectedChange {
        change_type,
        safe_diff: safe_diff(&old.content_text, &new.content_text),
    });
    Detection { metrics, change }
}

/// Build the forensic record for a meaningful change.
///
/// Both sides keep the detector's actual inputs (the filtered weighted
/// text plus structure signature); the baseline's pre-extraction HTML is
/// not retained across cycles, so this is the most raw content a snapshot
/// can carry.
pub fn build_snapshot(
    old: &WeightedFingerprint,
    new: &WeightedFingerprint,
    change_type: ChangeType,
    metrics: SimilarityMetrics,
    diff: &SafeDiff,
    now: DateTime<Utc>,
) -> Result<ForensicSnapshot> {
    Ok(ForensicSnapshot {
        timestamp: now,
        old_content_compressed: compress(&old.content_text)?,
        new_content_compressed: compress(&new.content_text)?,
        old_structure_signature: old.structure_signature.clone(),
        new_structure_signature: new.structure_signature.clone(),
        change_type,
        similarity_metrics: metrics,
        diff_summary: diff.summary(),
        diff_truncated: diff.truncated,
    })
}

/// Result of re-running a snapshot through current algorithms.
#[derive(Debug, Clone)]
pub struct Replay {
    pub metrics: SimilarityMetrics,
    /// `None` when current algorithms no longer call this a change.
    pub change_type: Option<ChangeType>,
    pub safe_diff: SafeDiff,
}

/// Decompress a snapshot's sides and re-run the detector with the current
/// metric weights and classification bands, for audit or dispute.
pub fn replay(snapshot: &ForensicSnapshot, threshold: f64) -> Result<Replay> {
    let old_text = decompress(&snapshot.old_content_compressed).context("old side of snapshot")?;
    let new_text = decompress(&snapshot.new_content_compressed).context("new side of snapshot")?;

    let metrics = compare(
        &old_text,
        &new_text,
        &snapshot.old_structure_signature,
        &snapshot.new_structure_signature,
    );
    Ok(Replay {
        metrics,
        change_type: classify(metrics.final_score, threshold),
        safe_diff: safe_diff(&old_text, &new_text),
    })
}

/// zlib-compress then base64-encode page content for persistence.
pub fn compress(content: &str) -> Result<String> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(content.as_bytes())
        .context("failed to compress snapshot content")?;
    let bytes = encoder
        .finish()
        .context("failed to finish snapshot compression")?;
    Ok(BASE64.encode(bytes))
}

/// Invert [`compress`].
pub fn decompress(encoded: &str) -> Result<String> {
    let bytes = BASE64
        .decode(encoded)
        .context("failed to decode snapshot base64")?;
    let mut decoder = ZlibDecoder::new(bytes.as_slice());
    let mut out = String::new();
    decoder
        .read_to_string(&mut out)
        .context("failed to decompress snapshot content")?;
    Ok(out)
}
