//! Core listing model, read filters, and field normalization.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub mod normalize;

pub use normalize::{extract_city, normalize_fragment, parse_decimal, parse_int, Normalized};

pub const CRATE_NAME: &str = "estate-core";

/// Sentinel city for locations that match no known city.
pub const UNKNOWN_CITY: &str = "Unknown";

/// Raw text pulled out of one listing card on one page. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawListingFragment {
    pub page_index: u32,
    pub listing_id: String,
    pub url: String,
    pub location: String,
    pub price: String,
    pub area: Option<String>,
    pub land_area: Option<String>,
    pub rooms: Option<String>,
    pub floor: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PropertyType {
    House,
    Apartment,
}

impl PropertyType {
    /// The source lists houses with a room count of zero.
    pub fn from_rooms(rooms: Option<i32>) -> Option<Self> {
        rooms.map(|n| if n == 0 { Self::House } else { Self::Apartment })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::House => "house",
            Self::Apartment => "apartment",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "house" => Some(Self::House),
            "apartment" => Some(Self::Apartment),
            _ => None,
        }
    }
}

/// Canonical persisted listing, keyed by the source-assigned `listing_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedListing {
    pub listing_id: String,
    pub city: String,
    pub price: Option<Decimal>,
    pub area: Option<i64>,
    pub land_area: Option<i64>,
    pub rooms: Option<i32>,
    pub floor: Option<String>,
    pub property_type: Option<PropertyType>,
    pub raw_location: String,
    pub url: String,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

/// Read-side predicates. Every set field must match (AND semantics).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingFilter {
    pub city: Option<String>,
    pub min_price: Option<Decimal>,
    pub max_price: Option<Decimal>,
    pub min_area: Option<i64>,
    pub max_area: Option<i64>,
    pub limit: Option<usize>,
}

impl ListingFilter {
    pub fn city(mut self, city: impl Into<String>) -> Self {
        self.city = Some(city.into());
        self
    }

    pub fn price_between(mut self, min: Option<Decimal>, max: Option<Decimal>) -> Self {
        self.min_price = min;
        self.max_price = max;
        self
    }

    pub fn area_between(mut self, min: Option<i64>, max: Option<i64>) -> Self {
        self.min_area = min;
        self.max_area = max;
        self
    }

    /// A range bound excludes listings whose value is unknown.
    pub fn matches(&self, listing: &NormalizedListing) -> bool {
        if let Some(city) = &self.city {
            if &listing.city != city {
                return false;
            }
        }
        if !within(listing.price, self.min_price, self.max_price) {
            return false;
        }
        within(listing.area, self.min_area, self.max_area)
    }
}

fn within<T: PartialOrd + Copy>(value: Option<T>, min: Option<T>, max: Option<T>) -> bool {
    if min.is_none() && max.is_none() {
        return true;
    }
    let Some(value) = value else {
        return false;
    };
    min.map_or(true, |m| value >= m) && max.map_or(true, |m| value <= m)
}

/// Aggregate row for the average-price-by-city read path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CityPriceSummary {
    pub city: String,
    pub listings: i64,
    pub average_price: Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn listing(id: &str, city: &str, price: Option<i64>, area: Option<i64>) -> NormalizedListing {
        let ts = Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).single().unwrap();
        NormalizedListing {
            listing_id: id.to_string(),
            city: city.to_string(),
            price: price.map(Decimal::from),
            area,
            land_area: None,
            rooms: Some(2),
            floor: None,
            property_type: Some(PropertyType::Apartment),
            raw_location: city.to_string(),
            url: format!("https://example.test/{id}"),
            first_seen_at: ts,
            last_seen_at: ts,
        }
    }

    #[test]
    fn empty_filter_matches_everything() {
        let filter = ListingFilter::default();
        assert!(filter.matches(&listing("a", "Szeged", None, None)));
    }

    #[test]
    fn filter_predicates_compose_with_and() {
        let filter = ListingFilter::default()
            .city("Szeged")
            .price_between(Some(Decimal::from(10_000_000)), Some(Decimal::from(50_000_000)));

        assert!(filter.matches(&listing("a", "Szeged", Some(20_000_000), Some(60))));
        assert!(!filter.matches(&listing("b", "Pécs", Some(20_000_000), Some(60))));
        assert!(!filter.matches(&listing("c", "Szeged", Some(90_000_000), Some(60))));
        assert!(!filter.matches(&listing("d", "Szeged", None, Some(60))));
    }

    #[test]
    fn area_bounds_are_inclusive() {
        let filter = ListingFilter::default().area_between(Some(50), Some(80));
        assert!(filter.matches(&listing("a", "Győr", None, Some(50))));
        assert!(filter.matches(&listing("b", "Győr", None, Some(80))));
        assert!(!filter.matches(&listing("c", "Győr", None, Some(81))));
    }

    #[test]
    fn property_type_follows_room_count() {
        assert_eq!(PropertyType::from_rooms(Some(0)), Some(PropertyType::House));
        assert_eq!(PropertyType::from_rooms(Some(3)), Some(PropertyType::Apartment));
        assert_eq!(PropertyType::from_rooms(None), None);
        assert_eq!(PropertyType::parse(PropertyType::House.as_str()), Some(PropertyType::House));
    }
}
