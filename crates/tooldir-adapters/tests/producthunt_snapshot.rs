use std::path::PathBuf;

use serde::Deserialize;
use tooldir_adapters::{FixtureSource, ListingSource, PageRequest, SourceError};
use tooldir_core::FieldSelection;

#[derive(Debug, Deserialize)]
struct Snapshot {
    pages: Vec<SnapshotPage>,
}

#[derive(Debug, Deserialize)]
struct SnapshotPage {
    ids: Vec<String>,
    names: Vec<String>,
    topic_slugs: Vec<Vec<String>>,
    has_next_page: bool,
    end_cursor: Option<String>,
}

fn sample_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/producthunt/sample")
}

#[tokio::test]
async fn recorded_pages_match_snapshot() {
    let snapshot: Snapshot = serde_json::from_str(
        &std::fs::read_to_string(sample_dir().join("snapshot.json")).expect("snapshot"),
    )
    .expect("parse snapshot");
    let source = FixtureSource::from_dir(sample_dir()).expect("fixture source");
    assert_eq!(source.page_count(), snapshot.pages.len());

    let mut after = None;
    for expected in &snapshot.pages {
        let page = source
            .fetch_page(&PageRequest::new(after.clone(), 25, FieldSelection::Enriched))
            .await
            .expect("recorded page");

        let ids = page.listings.iter().map(|l| l.id.clone()).collect::<Vec<_>>();
        let names = page.listings.iter().map(|l| l.name.clone()).collect::<Vec<_>>();
        let topic_slugs = page
            .listings
            .iter()
            .map(|l| l.topics.iter().map(|t| t.slug.clone()).collect::<Vec<_>>())
            .collect::<Vec<_>>();
        assert_eq!(ids, expected.ids);
        assert_eq!(names, expected.names);
        assert_eq!(topic_slugs, expected.topic_slugs);
        assert_eq!(page.has_next_page, expected.has_next_page);
        assert_eq!(page.end_cursor, expected.end_cursor);
        assert!(!page.raw.is_empty());

        after = page.end_cursor;
    }
}

#[tokio::test]
async fn unknown_cursor_is_malformed() {
    let source = FixtureSource::from_dir(sample_dir()).expect("fixture source");
    let err = source
        .fetch_page(&PageRequest::new(Some("bogus".into()), 25, FieldSelection::Minimal))
        .await
        .expect_err("no such page");
    assert!(matches!(err, SourceError::Malformed(_)));
}
