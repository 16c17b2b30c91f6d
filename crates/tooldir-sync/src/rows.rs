//! Listing → sink row projection for one fetched page.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use tooldir_core::{
    FieldSelection, Listing, PostDetails, PostRow, ToolInsights, ToolRow, ToolSource,
    TopicMapping,
};

use crate::classify::{Classifier, ScorePolicy};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageRows {
    pub posts: Vec<PostRow>,
    pub tools: Vec<ToolRow>,
    pub topics: Vec<TopicMapping>,
}

/// Keep the last occurrence of each id, in first-seen order.
pub fn dedupe_by_id(listings: &[Listing]) -> Vec<&Listing> {
    let mut slot_of: HashMap<&str, usize> = HashMap::new();
    let mut out: Vec<&Listing> = Vec::with_capacity(listings.len());
    for listing in listings {
        match slot_of.get(listing.id.as_str()) {
            Some(&slot) => out[slot] = listing,
            None => {
                slot_of.insert(listing.id.as_str(), out.len());
                out.push(listing);
            }
        }
    }
    out
}

#[derive(Debug, Clone)]
pub struct RowMapper {
    classifier: Classifier,
    scores: ScorePolicy,
}

impl RowMapper {
    pub fn new(classifier: Classifier, scores: ScorePolicy) -> Self {
        Self { classifier, scores }
    }

    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    /// Minimal pages yield rows without any enrichment columns and no topic mappings.
    pub fn map_page(
        &self,
        listings: &[Listing],
        selection: FieldSelection,
        now: DateTime<Utc>,
    ) -> PageRows {
        let listings = dedupe_by_id(listings);
        let mut seen_topics = BTreeSet::new();
        let mut rows = PageRows::default();
        for listing in listings {
            rows.posts.push(self.post_row(listing, selection, now));
            rows.tools.push(self.tool_row(listing, selection, now));
            if selection.is_enriched() {
                for topic in &listing.topics {
                    if seen_topics.insert((listing.id.clone(), topic.slug.clone())) {
                        rows.topics.push(TopicMapping {
                            ph_id: listing.id.clone(),
                            topic_slug: topic.slug.clone(),
                            topic_name: topic.name.clone(),
                        });
                    }
                }
            }
        }
        rows
    }

    fn post_row(&self, listing: &Listing, selection: FieldSelection, now: DateTime<Utc>) -> PostRow {
        PostRow {
            id: listing.id.clone(),
            name: listing.name.clone(),
            tagline: listing.tagline.clone(),
            slug: listing.slug.clone(),
            website_url: listing.website.clone(),
            votes: listing.votes_count,
            comments: listing.comments_count,
            thumbnail_url: listing.thumbnail_url.clone(),
            posted_at: listing.created_at,
            featured_at: listing.featured_at,
            updated_at: now,
            details: selection.is_enriched().then(|| PostDetails {
                description: listing.description.clone(),
                makers: listing.maker_names(),
                topics: listing.topics.clone(),
            }),
        }
    }

    fn tool_row(&self, listing: &Listing, selection: FieldSelection, now: DateTime<Utc>) -> ToolRow {
        let insights = selection.is_enriched().then(|| ToolInsights {
            makers: listing.maker_names(),
            social_twitter: listing.twitter_handle(),
            categories: listing
                .topics
                .iter()
                .map(|t| t.name.as_str())
                .collect::<Vec<_>>()
                .join(", "),
            category_slugs: listing
                .topics
                .iter()
                .map(|t| t.slug.as_str())
                .collect::<Vec<_>>()
                .join(", "),
            classification: self.classifier.classify_listing(listing),
        });
        ToolRow {
            ph_id: listing.id.clone(),
            source: ToolSource::Ph,
            name: listing.name.clone(),
            tagline: listing.tagline.clone(),
            slug: listing.slug.clone(),
            website_url: listing.website.clone(),
            votes: listing.votes_count,
            comments: listing.comments_count,
            thumbnail_url: listing.thumbnail_url.clone(),
            posted_at: listing.created_at,
            updated_at: now,
            scores: self.scores.score(listing, now),
            insights,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tooldir_core::{Maker, Topic};

    fn listing(id: &str, votes: u64) -> Listing {
        Listing {
            id: id.into(),
            name: format!("Tool {id}"),
            tagline: Some("Free AI assistant".into()),
            description: Some("Pro plan at $10".into()),
            slug: Some(format!("tool-{id}")),
            website: None,
            votes_count: votes,
            comments_count: 1,
            created_at: None,
            featured_at: None,
            thumbnail_url: None,
            makers: vec![Maker {
                id: "m".into(),
                name: "Ada".into(),
                username: None,
                headline: None,
                twitter_username: Some("ada".into()),
                url: None,
            }],
            topics: vec![
                Topic { slug: "ai".into(), name: "AI".into() },
                Topic { slug: "ai".into(), name: "AI".into() },
            ],
        }
    }

    fn mapper() -> RowMapper {
        RowMapper::new(
            Classifier::embedded().expect("rules"),
            ScorePolicy::default(),
        )
    }

    #[test]
    fn duplicate_ids_keep_last_occurrence() {
        let listings = vec![listing("1", 5), listing("2", 7), listing("1", 9)];
        let kept = dedupe_by_id(&listings);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].id, "1");
        assert_eq!(kept[0].votes_count, 9);
        assert_eq!(kept[1].id, "2");
    }

    #[test]
    fn minimal_rows_carry_no_enrichment() {
        let rows = mapper().map_page(&[listing("1", 5)], FieldSelection::Minimal, Utc::now());
        assert!(rows.posts[0].details.is_none());
        assert!(rows.tools[0].insights.is_none());
        assert!(rows.topics.is_empty());

        let tool = serde_json::to_value(&rows.tools[0]).expect("json");
        assert!(tool.get("pricing_model").is_none());
        assert!(tool.get("makers").is_none());
        assert!(tool.get("trending_score").is_some());
    }

    #[test]
    fn enriched_rows_classify_and_map_topics_once() {
        let rows = mapper().map_page(&[listing("1", 5)], FieldSelection::Enriched, Utc::now());
        let insights = rows.tools[0].insights.as_ref().expect("insights");
        assert_eq!(insights.classification.pricing_model, "freemium");
        assert_eq!(insights.social_twitter.as_deref(), Some("ada"));
        assert_eq!(insights.category_slugs, "ai, ai");
        assert_eq!(rows.topics.len(), 1);
        assert_eq!(rows.topics[0].topic_slug, "ai");
        assert_eq!(
            rows.posts[0].details.as_ref().map(|d| d.makers.as_str()),
            Some("Ada")
        );
    }
}
