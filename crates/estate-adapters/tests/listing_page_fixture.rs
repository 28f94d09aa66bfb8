// Parses the captured listing page under fixtures/listing-page.

use chrono::Utc;
use estate_adapters::{FetchedPage, ListingParser, ListingSelectors};

fn fixture_page() -> FetchedPage {
    let root = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../..");
    let body = std::fs::read_to_string(root.join("fixtures/listing-page/page-1.html"))
        .expect("fixture page exists");
    FetchedPage {
        page_index: 1,
        url: "https://otthonterkep.hu/elado?p=1".into(),
        body,
        fetched_at: Utc::now(),
    }
}

#[test]
fn fixture_page_keeps_good_listings_around_a_malformed_one() {
    let parser = ListingParser::new(&ListingSelectors::default()).unwrap();
    let parsed = parser.parse(&fixture_page());

    assert_eq!(parsed.card_count, 4);
    assert_eq!(parsed.total_count, Some(87));
    let ids = parsed
        .fragments
        .iter()
        .map(|f| f.listing_id.as_str())
        .collect::<Vec<_>>();
    assert_eq!(ids, vec!["hu-240101", "hu-240102", "hu-240104"]);
    assert_eq!(parsed.skipped.len(), 1);
    assert_eq!(parsed.skipped[0].position, 3);

    let godollo = &parsed.fragments[2];
    assert_eq!(godollo.url, "https://otthonterkep.hu/hirdetes/hu-240104");
    assert_eq!(godollo.land_area.as_deref(), Some("720 m²"));
    assert_eq!(godollo.rooms.as_deref(), Some("0"));
}
