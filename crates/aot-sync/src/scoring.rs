//! Relevance scoring against the academic profile.

use std::collections::BTreeSet;
use std::sync::Arc;

use aot_core::{fold_text, Opportunity, RelevanceTier};

use crate::config::EngineConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScoreCard {
    pub points: u32,
    pub tier: RelevanceTier,
    /// Profile terms that contributed, in profile order.
    pub matched: Vec<String>,
}

/// Pure function of (text, profile). Each distinct term counts once.
#[derive(Debug, Clone)]
pub struct RelevanceScorer {
    config: Arc<EngineConfig>,
}

impl RelevanceScorer {
    pub fn new(config: Arc<EngineConfig>) -> Self {
        Self { config }
    }

    pub fn score_text<'a>(
        &self,
        name: &str,
        description: Option<&str>,
        areas: impl IntoIterator<Item = &'a String>,
    ) -> ScoreCard {
        let text = format!(" {} {} ", fold_text(name), fold_text(description.unwrap_or_default()));
        let tags: BTreeSet<String> = areas.into_iter().map(|a| fold_text(a)).collect();
        let profile = &self.config.profile;
        let weights = &self.config.scoring.weights;

        let mut points = 0;
        let mut matched = Vec::new();
        let mut seen = BTreeSet::new();

        let mut tally = |term: &str, hit: Option<u32>| {
            if let Some(weight) = hit {
                points += weight;
                matched.push(term.to_string());
            }
        };

        for area in &profile.areas {
            let folded = fold_text(area);
            if folded.is_empty() || !seen.insert(folded.clone()) {
                continue;
            }
            let hit = if tags.contains(&folded) {
                Some(weights.area_tag)
            } else if text.contains(&folded) {
                Some(weights.area_mention)
            } else {
                None
            };
            tally(area, hit);
        }

        let groups = [
            (&profile.discipline, weights.discipline),
            (&profile.keywords, weights.keyword),
            (&profile.related_keywords, weights.related_keyword),
        ];
        for (terms, weight) in groups {
            for term in terms {
                let folded = fold_text(term);
                if folded.is_empty() || !seen.insert(folded.clone()) {
                    continue;
                }
                let hit = (text.contains(&folded) || tags.iter().any(|t| t.contains(&folded))).then_some(weight);
                tally(term, hit);
            }
        }

        let scoring = &self.config.scoring;
        let tier = if points >= scoring.strong_threshold {
            RelevanceTier::High
        } else if points >= scoring.weak_threshold {
            RelevanceTier::Medium
        } else {
            RelevanceTier::Low
        };
        ScoreCard { points, tier, matched }
    }

    pub fn score(&self, record: &Opportunity) -> ScoreCard {
        self.score_text(&record.name, record.description.value.as_deref(), &record.areas)
    }

    pub fn tier(&self, record: &Opportunity) -> RelevanceTier {
        self.score(record).tier
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AcademicProfile, ScoringConfig};

    fn scorer() -> RelevanceScorer {
        RelevanceScorer::new(Arc::new(EngineConfig {
            profile: AcademicProfile {
                discipline: vec!["Psicología".into()],
                areas: vec!["psicometría".into(), "ciencias cognitivas".into()],
                keywords: vec!["doctorado".into()],
                related_keywords: vec!["investigación".into()],
            },
            scoring: ScoringConfig::default(),
            expiry_warning_days: 15,
        }))
    }

    #[test]
    fn discipline_match_is_strong() {
        let card = scorer().score_text("Beca doctoral en PSICOLOGIA", None, &[]);
        assert_eq!(card.tier, RelevanceTier::High);
        assert_eq!(card.matched, vec!["Psicología".to_string()]);
    }

    #[test]
    fn area_tags_weigh_more_than_mentions() {
        let s = scorer();
        let tagged = s.score_text("Convocatoria", None, &["Psicometría".to_string()]);
        let mentioned = s.score_text("Convocatoria en psicometria", None, &[]);
        assert!(tagged.points > mentioned.points);
        assert_eq!(mentioned.tier, RelevanceTier::Medium);
    }

    #[test]
    fn repeated_terms_count_once() {
        let s = scorer();
        let once = s.score_text("Investigación", None, &[]);
        let twice = s.score_text("Investigación e investigación", Some("investigacion"), &[]);
        assert_eq!(once.points, twice.points);
        assert_eq!(once.tier, RelevanceTier::Low);
    }

    #[test]
    fn keyword_plus_related_reaches_medium() {
        let card = scorer().score_text("Doctorado", Some("grupo de investigación"), &[]);
        assert_eq!(card.points, 3);
        assert_eq!(card.tier, RelevanceTier::Medium);
    }

    #[test]
    fn scoring_is_deterministic() {
        let s = scorer();
        let text = "Estancia doctoral en ciencias cognitivas y psicometría";
        let first = s.score_text(text, Some("Apoyo a investigación"), &[]);
        for _ in 0..10 {
            assert_eq!(s.score_text(text, Some("Apoyo a investigación"), &[]), first);
        }
        let fresh = scorer().score_text(text, Some("Apoyo a investigación"), &[]);
        assert_eq!(fresh, first);
        assert_eq!(first.tier, RelevanceTier::High);
    }
}
