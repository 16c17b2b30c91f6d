//! Keyword/regex classification of listing text, plus derived engagement scores.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Deserialize;
use tooldir_core::{Classification, Listing, ToolScores};

/// Rules compiled into the binary; `TOOLDIR_RULES_PATH` swaps in a file.
pub const EMBEDDED_RULES: &str = include_str!("../../../rules/classifier.yaml");

const UNKNOWN: &str = "unknown";

#[derive(Debug, Clone, Deserialize)]
struct RulesFile {
    #[allow(dead_code)]
    version: u32,
    pricing_model: SingleLabelRules,
    business_model: SingleLabelRules,
    company_size: SingleLabelRules,
    funding_stage: SingleLabelRules,
    product_stage: SingleLabelRules,
    #[serde(default)]
    platforms: Vec<LabelRule>,
    #[serde(default)]
    technology_stack: Vec<LabelRule>,
    #[serde(default)]
    integrations: Vec<LabelRule>,
    flags: FlagRules,
    pricing_details: PricingDetailsRule,
}

#[derive(Debug, Clone, Deserialize)]
struct SingleLabelRules {
    default: String,
    #[serde(default)]
    rules: Vec<LabelRule>,
}

#[derive(Debug, Clone, Deserialize)]
struct LabelRule {
    label: String,
    #[serde(default)]
    contains_any: Vec<String>,
    #[serde(default)]
    all_of: Vec<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
struct FlagRules {
    #[serde(default)]
    api_available: Vec<String>,
    #[serde(default)]
    mobile_app: Vec<String>,
    #[serde(default)]
    desktop_app: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct PricingDetailsRule {
    pattern: String,
    #[serde(default = "default_separator")]
    separator: String,
}

fn default_separator() -> String {
    ", ".to_string()
}

fn contains_any(text: &str, needles: &[String]) -> bool {
    needles.iter().any(|needle| text.contains(needle.as_str()))
}

impl LabelRule {
    fn matches(&self, text: &str) -> bool {
        if self.contains_any.is_empty() && self.all_of.is_empty() {
            return false;
        }
        (self.contains_any.is_empty() || contains_any(text, &self.contains_any))
            && self.all_of.iter().all(|group| contains_any(text, group))
    }

    fn lowercase(&mut self) {
        for needle in &mut self.contains_any {
            *needle = needle.to_lowercase();
        }
        for needle in self.all_of.iter_mut().flatten() {
            *needle = needle.to_lowercase();
        }
    }
}

impl SingleLabelRules {
    fn first_match(&self, text: &str) -> String {
        self.rules
            .iter()
            .find(|rule| rule.matches(text))
            .map_or_else(|| self.default.clone(), |rule| rule.label.clone())
    }
}

fn all_matches(rules: &[LabelRule], text: &str) -> Vec<String> {
    rules
        .iter()
        .filter(|rule| rule.matches(text))
        .map(|rule| rule.label.clone())
        .collect()
}

/// Deterministic first-match-wins classifier. Rule order in the YAML is precedence.
#[derive(Debug, Clone)]
pub struct Classifier {
    rules: RulesFile,
    pricing_pattern: Regex,
}

impl Classifier {
    pub fn embedded() -> Result<Self> {
        Self::from_yaml(EMBEDDED_RULES).context("parsing embedded classifier rules")
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let mut rules: RulesFile = serde_yaml::from_str(text).context("parsing classifier yaml")?;
        for single in [
            &mut rules.pricing_model,
            &mut rules.business_model,
            &mut rules.company_size,
            &mut rules.funding_stage,
            &mut rules.product_stage,
        ] {
            single.rules.iter_mut().for_each(LabelRule::lowercase);
        }
        rules
            .platforms
            .iter_mut()
            .chain(rules.technology_stack.iter_mut())
            .chain(rules.integrations.iter_mut())
            .for_each(LabelRule::lowercase);
        for flag in [
            &mut rules.flags.api_available,
            &mut rules.flags.mobile_app,
            &mut rules.flags.desktop_app,
        ] {
            flag.iter_mut().for_each(|n| *n = n.to_lowercase());
        }

        let pricing_pattern = Regex::new(&rules.pricing_details.pattern)
            .with_context(|| format!("compiling pricing pattern {}", rules.pricing_details.pattern))?;
        Ok(Self {
            rules,
            pricing_pattern,
        })
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("loading rules from {}", path.display()))
    }

    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_path(path),
            None => Self::embedded(),
        }
    }

    pub fn classify_listing(&self, listing: &Listing) -> Classification {
        self.classify(listing.tagline.as_deref(), listing.description.as_deref())
    }

    pub fn classify(&self, tagline: Option<&str>, description: Option<&str>) -> Classification {
        let text = format!(
            "{} {}",
            tagline.unwrap_or_default(),
            description.unwrap_or_default()
        );
        self.classify_text(&text)
    }

    /// Blank text carries no signal: every single-label category is `unknown`.
    pub fn classify_text(&self, text: &str) -> Classification {
        let text = text.to_lowercase();
        if text.trim().is_empty() {
            return Classification {
                pricing_model: UNKNOWN.into(),
                pricing_details: None,
                business_model: UNKNOWN.into(),
                company_size: UNKNOWN.into(),
                funding_stage: UNKNOWN.into(),
                product_stage: UNKNOWN.into(),
                platforms: Vec::new(),
                technology_stack: Vec::new(),
                integrations: Vec::new(),
                api_available: false,
                mobile_app: false,
                desktop_app: false,
            };
        }

        let rules = &self.rules;
        let prices = self
            .pricing_pattern
            .find_iter(&text)
            .map(|m| m.as_str())
            .collect::<Vec<_>>();
        Classification {
            pricing_model: rules.pricing_model.first_match(&text),
            pricing_details: (!prices.is_empty())
                .then(|| prices.join(&rules.pricing_details.separator)),
            business_model: rules.business_model.first_match(&text),
            company_size: rules.company_size.first_match(&text),
            funding_stage: rules.funding_stage.first_match(&text),
            product_stage: rules.product_stage.first_match(&text),
            platforms: all_matches(&rules.platforms, &text),
            technology_stack: all_matches(&rules.technology_stack, &text),
            integrations: all_matches(&rules.integrations, &text),
            api_available: contains_any(&text, &rules.flags.api_available),
            mobile_app: contains_any(&text, &rules.flags.mobile_app),
            desktop_app: contains_any(&text, &rules.flags.desktop_app),
        }
    }
}

/// Constants behind the engagement scores.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScorePolicy {
    pub comment_weight: f64,
    pub recency_window_hours: f64,
    pub featured_multiplier: f64,
    pub traffic_per_vote: u64,
    /// Lower bound on listing age so fresh posts do not divide by zero.
    pub min_age_hours: f64,
}

impl Default for ScorePolicy {
    fn default() -> Self {
        Self {
            comment_weight: 3.0,
            recency_window_hours: 24.0,
            featured_multiplier: 1.5,
            traffic_per_vote: 300,
            min_age_hours: 1.0 / 60.0,
        }
    }
}

fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

impl ScorePolicy {
    pub fn score(&self, listing: &Listing, now: DateTime<Utc>) -> ToolScores {
        let votes = listing.votes_count as f64;
        let comments = listing.comments_count as f64;
        let age_hours = listing
            .created_at
            .map(|created| (now - created).num_milliseconds() as f64 / 3_600_000.0);

        let upvote_velocity = match age_hours {
            Some(hours) => round_to(votes / hours.max(self.min_age_hours), 2),
            None => 0.0,
        };
        let recency_boost = age_hours
            .map(|hours| (self.recency_window_hours - hours).max(0.0) / self.recency_window_hours)
            .unwrap_or(0.0);
        let featured = if listing.featured_at.is_some() {
            self.featured_multiplier
        } else {
            1.0
        };
        let engagement = votes + comments * self.comment_weight;

        ToolScores {
            upvote_velocity,
            trending_score: (engagement * (1.0 + recency_boost) * featured).round() as i64,
            comment_engagement: round_to(comments / votes.max(1.0), 3),
            estimated_traffic: listing.votes_count.saturating_mul(self.traffic_per_vote),
            launch_day: listing.created_at.map(|created| created.date_naive()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};

    fn classifier() -> Classifier {
        Classifier::embedded().expect("embedded rules")
    }

    fn listing(votes: u64, comments: u64, created_at: Option<DateTime<Utc>>) -> Listing {
        Listing {
            id: "1".into(),
            name: "Tool".into(),
            tagline: None,
            description: None,
            slug: None,
            website: None,
            votes_count: votes,
            comments_count: comments,
            created_at,
            featured_at: None,
            thumbnail_url: None,
            makers: vec![],
            topics: vec![],
        }
    }

    #[test]
    fn free_open_source_text_classifies_as_free() {
        let c = classifier().classify_text("Free forever, no credit card. Open-source on GitHub.");
        assert_eq!(c.pricing_model, "free");
        assert!(c.technology_stack.contains(&"open-source".to_string()));
        assert_eq!(c.integrations, vec!["git".to_string()]);
        assert_eq!(c.pricing_details, None);
    }

    #[test]
    fn freemium_needs_both_free_and_premium_signal() {
        let c = classifier().classify(Some("Free AI notes"), Some("Upgrade to Pro for $9.99 or $99"));
        assert_eq!(c.pricing_model, "freemium");
        assert_eq!(c.pricing_details.as_deref(), Some("$9.99, $99"));
        assert!(c.technology_stack.contains(&"ai/ml".to_string()));
    }

    #[test]
    fn precedence_follows_rule_order() {
        // "enterprise" appears in both B2B and enterprise pricing rules; subscription wins first.
        let c = classifier().classify_text("Enterprise subscription for marketplace teams, now in beta");
        assert_eq!(c.pricing_model, "subscription");
        assert_eq!(c.business_model, "B2B");
        assert_eq!(c.company_size, "enterprise");
        assert_eq!(c.product_stage, "beta");
    }

    #[test]
    fn unmatched_text_takes_category_defaults() {
        let c = classifier().classify_text("zzz");
        assert_eq!(c.pricing_model, "unknown");
        assert_eq!(c.business_model, "B2B");
        assert_eq!(c.company_size, "startup");
        assert_eq!(c.funding_stage, "unknown");
        assert_eq!(c.product_stage, "launched");
        assert!(c.platforms.is_empty());
        assert!(!c.api_available);
    }

    #[test]
    fn blank_text_is_unknown_everywhere() {
        let c = classifier().classify(None, Some("   \n"));
        assert_eq!(c.pricing_model, "unknown");
        assert_eq!(c.business_model, "unknown");
        assert_eq!(c.company_size, "unknown");
        assert_eq!(c.product_stage, "unknown");
        assert!(c.platforms.is_empty() && c.technology_stack.is_empty() && c.integrations.is_empty());
        assert!(!c.api_available && !c.mobile_app && !c.desktop_app);
    }

    #[test]
    fn classification_is_deterministic() {
        let text = "Mobile app for iOS and Android with Slack, Notion and Stripe payments";
        let first = classifier().classify_text(text);
        let second = classifier().classify_text(text);
        assert_eq!(first, second);
        assert_eq!(first.platforms, vec!["ios".to_string(), "android".to_string()]);
        assert_eq!(
            first.integrations,
            vec!["slack".to_string(), "notion".to_string(), "payments".to_string()]
        );
        assert!(first.mobile_app);
    }

    #[test]
    fn custom_rules_file_overrides_embedded() {
        let yaml = EMBEDDED_RULES.replace("default: B2B", "default: B2C");
        let c = Classifier::from_yaml(&yaml).expect("rules").classify_text("zzz");
        assert_eq!(c.business_model, "B2C");
    }

    #[test]
    fn scores_follow_policy() {
        let now = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).single().expect("now");
        let created = Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).single().expect("created");
        let scores = ScorePolicy::default().score(&listing(120, 10, Some(created)), now);
        assert_eq!(scores.upvote_velocity, 10.0);
        // (120 + 30) * (1 + 12/24)
        assert_eq!(scores.trending_score, 225);
        assert_eq!(scores.comment_engagement, 0.083);
        assert_eq!(scores.estimated_traffic, 36_000);
        assert_eq!(scores.launch_day, NaiveDate::from_ymd_opt(2025, 3, 1));

        let mut featured = listing(120, 10, Some(created));
        featured.featured_at = Some(created);
        let featured_scores = ScorePolicy::default().score(&featured, now);
        assert_eq!(featured_scores.trending_score, 338);
    }

    #[test]
    fn fresh_and_undated_listings_do_not_divide_by_zero() {
        let now = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).single().expect("now");
        let fresh = ScorePolicy::default().score(&listing(5, 0, Some(now)), now);
        assert_eq!(fresh.upvote_velocity, 300.0);
        assert_eq!(fresh.trending_score, 10);

        let undated = ScorePolicy::default().score(&listing(0, 4, None), now);
        assert_eq!(undated.upvote_velocity, 0.0);
        assert_eq!(undated.comment_engagement, 4.0);
        assert_eq!(undated.launch_day, None);
    }
}
