//! Completeness scoring of collected interval data

use crate::parser::ParsedResult;
use serde::Serialize;

/// Quality tiers, declared worst to best so they compare naturally
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QualityTier {
    NoData,
    Insufficient,
    PartialPoor,
    PartialGood,
    Complete,
}

impl QualityTier {
    pub fn score(self) -> u8 {
        match self {
            QualityTier::NoData => 0,
            QualityTier::Insufficient => 20,
            QualityTier::PartialPoor => 50,
            QualityTier::PartialGood => 80,
            QualityTier::Complete => 100,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            QualityTier::NoData => "NO_DATA",
            QualityTier::Insufficient => "INSUFFICIENT",
            QualityTier::PartialPoor => "PARTIAL_POOR",
            QualityTier::PartialGood => "PARTIAL_GOOD",
            QualityTier::Complete => "COMPLETE",
        }
    }

    /// Good enough to report a warned run as completed
    pub fn is_acceptable(self) -> bool {
        self >= QualityTier::PartialGood
    }

    fn message(self) -> &'static str {
        match self {
            QualityTier::NoData => "No valid test data collected",
            QualityTier::Insufficient => "Test did not collect enough data",
            QualityTier::PartialPoor => "Test completed with partial data",
            QualityTier::PartialGood => "Test completed with good data quality",
            QualityTier::Complete => "Test completed successfully with full data",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityAssessment {
    pub quality: QualityTier,
    pub score: u8,
    pub message: &'static str,
    pub intervals_collected: u32,
    pub intervals_expected: u32,
}

/// Tier for a `collected / expected` ratio when data exists.
pub fn tier_for_ratio(ratio: f64) -> QualityTier {
    if ratio >= 0.95 {
        QualityTier::Complete
    } else if ratio >= 0.80 {
        QualityTier::PartialGood
    } else if ratio >= 0.50 {
        QualityTier::PartialPoor
    } else {
        QualityTier::Insufficient
    }
}

/// Score collected intervals against the configured duration.
///
/// One interval is expected per second of requested duration.
pub fn assess_quality(
    has_valid_data: bool,
    interval_count: u32,
    expected_duration: u32,
) -> QualityAssessment {
    let quality = if !has_valid_data || interval_count == 0 || expected_duration == 0 {
        QualityTier::NoData
    } else {
        tier_for_ratio(interval_count as f64 / expected_duration as f64)
    };

    QualityAssessment {
        quality,
        score: quality.score(),
        message: quality.message(),
        intervals_collected: interval_count,
        intervals_expected: expected_duration,
    }
}

impl ParsedResult {
    pub fn quality(&self, expected_duration: u32) -> QualityAssessment {
        assess_quality(self.has_valid_data, self.interval_count, expected_duration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boundaries() {
        assert_eq!(assess_quality(true, 95, 100).quality, QualityTier::Complete);
        assert_eq!(assess_quality(true, 94, 100).quality, QualityTier::PartialGood);
        assert_eq!(assess_quality(true, 80, 100).quality, QualityTier::PartialGood);
        assert_eq!(assess_quality(true, 79, 100).quality, QualityTier::PartialPoor);
        assert_eq!(assess_quality(true, 50, 100).quality, QualityTier::PartialPoor);
        assert_eq!(assess_quality(true, 49, 100).quality, QualityTier::Insufficient);
        assert_eq!(assess_quality(true, 1, 100).quality, QualityTier::Insufficient);
    }

    #[test]
    fn test_no_data_cases() {
        assert_eq!(assess_quality(false, 10, 10).score, 0);
        assert_eq!(assess_quality(true, 0, 10).quality, QualityTier::NoData);
        assert_eq!(assess_quality(true, 10, 0).quality, QualityTier::NoData);
    }

    #[test]
    fn test_overrun_is_complete() {
        let assessment = assess_quality(true, 12, 10);
        assert_eq!(assessment.quality, QualityTier::Complete);
        assert_eq!(assessment.score, 100);
        assert_eq!(assessment.intervals_collected, 12);
        assert_eq!(assessment.intervals_expected, 10);
    }

    #[test]
    fn test_score_is_monotonic_in_ratio() {
        let mut previous = u8::MAX;
        for step in (0..=1100).rev() {
            let ratio = step as f64 / 1000.0;
            let score = tier_for_ratio(ratio).score();
            assert!(score <= previous, "score rose at ratio {ratio}");
            previous = score;
        }
    }

    #[test]
    fn test_acceptable_tiers() {
        assert!(QualityTier::Complete.is_acceptable());
        assert!(QualityTier::PartialGood.is_acceptable());
        assert!(!QualityTier::PartialPoor.is_acceptable());
        assert!(!QualityTier::Insufficient.is_acceptable());
        assert!(!QualityTier::NoData.is_acceptable());
    }
}
