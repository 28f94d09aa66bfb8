//! Total conversions from raw listing text into typed values.
//!
//! None of these functions fail: input that cannot be converted yields `None`
//! (or the `Unknown` city) and, where the input looked meaningful, a `warn!`.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tracing::warn;

use crate::{NormalizedListing, PropertyType, RawListingFragment, UNKNOWN_CITY};

const CURRENCY_SUFFIX: &str = "Ft";

/// Returns the first city, in list order, that occurs inside `location`.
///
/// Order is the tie-break: with `["Spring", "Springfield"]` the location
/// `"Springfield Ave"` resolves to `"Spring"`. Callers wanting more specific
/// names to win must list them first.
pub fn extract_city<S: AsRef<str>>(location: &str, known_cities: &[S]) -> String {
    known_cities
        .iter()
        .map(AsRef::as_ref)
        .find(|city| !city.is_empty() && location.contains(city))
        .unwrap_or(UNKNOWN_CITY)
        .to_string()
}

pub fn parse_decimal(text: &str) -> Option<Decimal> {
    let compact = text
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .replace(CURRENCY_SUFFIX, "");
    let kept = compact
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.')
        .collect::<String>();

    if kept.is_empty() {
        if !compact.is_empty() {
            warn!(input = text, "no numeric content in decimal field");
        }
        return None;
    }

    match Decimal::from_str(&kept) {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(input = text, cleaned = %kept, error = %err, "invalid decimal value");
            None
        }
    }
}

pub fn parse_int(text: &str) -> Option<i64> {
    let digits = text.chars().filter(char::is_ascii_digit).collect::<String>();
    if digits.is_empty() {
        return None;
    }
    match digits.parse::<i64>() {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(input = text, error = %err, "integer field out of range");
            None
        }
    }
}

/// One fragment after normalization, plus the nullable fields that came out empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Normalized {
    pub listing: NormalizedListing,
    pub null_fields: Vec<&'static str>,
}

impl Normalized {
    pub fn has_nulls(&self) -> bool {
        !self.null_fields.is_empty()
    }
}

pub fn normalize_fragment<S: AsRef<str>>(
    fragment: &RawListingFragment,
    known_cities: &[S],
    observed_at: DateTime<Utc>,
) -> Normalized {
    let price = parse_decimal(&fragment.price);
    let area = fragment.area.as_deref().and_then(parse_decimal_as_int);
    let land_area = fragment.land_area.as_deref().and_then(parse_decimal_as_int);
    let rooms = fragment
        .rooms
        .as_deref()
        .and_then(parse_int)
        .and_then(|n| i32::try_from(n).ok());

    let mut null_fields = Vec::new();
    if price.is_none() {
        null_fields.push("price");
    }
    if area.is_none() {
        null_fields.push("area");
    }
    if rooms.is_none() {
        null_fields.push("rooms");
    }

    let listing = NormalizedListing {
        listing_id: fragment.listing_id.clone(),
        city: extract_city(&fragment.location, known_cities),
        price,
        area,
        land_area,
        rooms,
        floor: fragment.floor.as_deref().and_then(clean_floor),
        property_type: PropertyType::from_rooms(rooms),
        raw_location: fragment.location.clone(),
        url: fragment.url.clone(),
        first_seen_at: observed_at,
        last_seen_at: observed_at,
    };

    Normalized {
        listing,
        null_fields,
    }
}

// Areas arrive as "65 m²" or "1 200.5 m²"; the fractional part is dropped.
fn parse_decimal_as_int(text: &str) -> Option<i64> {
    let without_unit = text.replace("m²", "").replace("m2", "");
    parse_decimal(&without_unit)?.trunc().to_i64()
}

fn clean_floor(text: &str) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("n/a") {
        None
    } else {
        Some(trimmed.to_string())
    }
}
