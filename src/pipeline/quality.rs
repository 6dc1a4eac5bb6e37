use crate::config::ScoringConfig;
use crate::models::{CanonicalAttribute, QualityMetrics, ScoreBreakdown};
use std::collections::HashSet;

const FILL_WEIGHT: f64 = 50.0;
const DESCRIPTION_WEIGHT: f64 = 30.0;
const TITLE_WEIGHT: f64 = 20.0;
/// Description points lost per character of distance from the window midpoint.
const DESCRIPTION_CHARS_PER_POINT: f64 = 50.0;
/// Title points lost per character short of the maximum length.
const TITLE_PENALTY_PER_CHAR: f64 = 0.5;

/// Composite 0..=100 score. Only catalog-resolved attributes holding a value
/// count towards the fill rate.
pub fn score(
    attributes: &[CanonicalAttribute],
    catalog_size: usize,
    title_len: usize,
    description_len: usize,
    config: &ScoringConfig,
) -> QualityMetrics {
    let resolved = attributes
        .iter()
        .filter(|attr| attr.is_resolved() && !attr.value.is_null())
        .map(|attr| attr.id)
        .collect::<HashSet<_>>()
        .len();
    let fill_rate = if catalog_size == 0 {
        0.0
    } else {
        (100.0 * resolved as f64 / catalog_size as f64).round().min(100.0)
    };

    let breakdown = ScoreBreakdown {
        fill: fill_component(fill_rate, config.fill_threshold),
        description: description_component(description_len, config),
        title: title_component(title_len, config.max_title_len),
    };
    let overall = (breakdown.fill + breakdown.description + breakdown.title)
        .round()
        .clamp(0.0, 100.0);

    QualityMetrics {
        fill_rate: fill_rate as u8,
        title_length: title_len,
        description_length: description_len,
        overall_score: overall as u8,
        acceptable: fill_rate >= config.fill_threshold,
        breakdown,
    }
}

fn fill_component(fill_rate: f64, threshold: f64) -> f64 {
    (fill_rate / threshold * FILL_WEIGHT).min(FILL_WEIGHT)
}

fn description_component(len: usize, config: &ScoringConfig) -> f64 {
    if (config.description_min..=config.description_max).contains(&len) {
        return DESCRIPTION_WEIGHT;
    }
    let midpoint = (config.description_min + config.description_max) as f64 / 2.0;
    let deviation = (len as f64 - midpoint).abs();
    (DESCRIPTION_WEIGHT - deviation / DESCRIPTION_CHARS_PER_POINT).max(0.0)
}

fn title_component(len: usize, max_len: usize) -> f64 {
    if len > max_len {
        return 0.0;
    }
    (TITLE_WEIGHT - (max_len - len) as f64 * TITLE_PENALTY_PER_CHAR).max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AttributePriority, AttributeType, AttributeValue, StageKind};

    fn attr(id: i64, value: AttributeValue) -> CanonicalAttribute {
        CanonicalAttribute {
            id,
            name: format!("attr-{id}"),
            value,
            confidence: 0.95,
            source_stage: StageKind::AlignCatalog,
            detected_type: AttributeType::String,
            priority: AttributePriority::Primary,
        }
    }

    fn filled(count: i64) -> Vec<CanonicalAttribute> {
        (1..=count)
            .map(|id| attr(id, AttributeValue::Text("x".into())))
            .collect()
    }

    #[test]
    fn full_marks_scenario() {
        let metrics = score(&filled(12), 20, 60, 1650, &ScoringConfig::default());
        assert_eq!(metrics.fill_rate, 60);
        assert_eq!(metrics.breakdown.fill, 50.0);
        assert_eq!(metrics.breakdown.description, 30.0);
        assert_eq!(metrics.breakdown.title, 20.0);
        assert_eq!(metrics.overall_score, 100);
        assert!(metrics.acceptable);
    }

    #[test]
    fn unresolved_and_null_values_do_not_fill() {
        let mut attrs = filled(3);
        attrs.push(attr(0, AttributeValue::Text("orphan".into())));
        attrs.push(attr(9, AttributeValue::Null));
        let metrics = score(&attrs, 10, 60, 1650, &ScoringConfig::default());
        assert_eq!(metrics.fill_rate, 30);
        assert_eq!(metrics.breakdown.fill, 25.0);
        assert!(!metrics.acceptable);
    }

    #[test]
    fn description_outside_window_decays_from_midpoint() {
        let config = ScoringConfig::default();
        // midpoint 1650, deviation 1650 -> 30 - 33 clamps to 0
        let empty = score(&[], 10, 60, 0, &config);
        assert_eq!(empty.breakdown.description, 0.0);
        // deviation 550 -> 30 - 11
        let long = score(&[], 10, 60, 2200, &config);
        assert_eq!(long.breakdown.description, 19.0);
    }

    #[test]
    fn short_and_overlong_titles_lose_points() {
        let config = ScoringConfig::default();
        assert_eq!(score(&[], 10, 40, 1650, &config).breakdown.title, 10.0);
        assert_eq!(score(&[], 10, 10, 1650, &config).breakdown.title, 0.0);
        assert_eq!(score(&[], 10, 61, 1650, &config).breakdown.title, 0.0);
    }

    #[test]
    fn empty_catalog_scores_zero_fill() {
        let metrics = score(&filled(4), 0, 60, 1650, &ScoringConfig::default());
        assert_eq!(metrics.fill_rate, 0);
        assert_eq!(metrics.overall_score, 50);
        assert!(!metrics.acceptable);
    }
}
