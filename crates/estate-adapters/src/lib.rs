//! Listing source contract, HTTP page source with retry, and the HTML page parser.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use estate_core::RawListingFragment;
use reqwest::{StatusCode, Url};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "estate-adapters";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchedPage {
    pub page_index: u32,
    pub url: String,
    pub body: String,
    pub fetched_at: DateTime<Utc>,
}

/// Optional server-side narrowing of the listing pages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFilter {
    pub city: Option<String>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("transient failure fetching page {page_index}: {reason}")]
    Transient { page_index: u32, reason: String },
    #[error("permanent failure fetching page {page_index}: {reason}")]
    Permanent { page_index: u32, reason: String },
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("invalid selector `{selector}`: {reason}")]
    Selector { selector: String, reason: String },
}

#[async_trait]
pub trait ListingSource: Send + Sync {
    /// One attempt at one page. Retries are the caller's job.
    async fn fetch_page(&self, page_index: u32, filter: &SourceFilter) -> Result<FetchedPage, FetchError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::REQUEST_TIMEOUT {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    /// Total attempts per page, including the first.
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Fetches one page, retrying transient failures with exponential backoff.
///
/// Each attempt is bounded by `attempt_timeout`; an attempt that runs out of
/// time counts as a transient failure. Permanent failures return at once.
pub async fn fetch_with_retry(
    source: &dyn ListingSource,
    page_index: u32,
    filter: &SourceFilter,
    policy: &BackoffPolicy,
    attempt_timeout: Duration,
) -> Result<FetchedPage, FetchError> {
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        let result = match tokio::time::timeout(attempt_timeout, source.fetch_page(page_index, filter)).await {
            Ok(result) => result,
            Err(_) => Err(FetchError::Transient {
                page_index,
                reason: format!("no response within {attempt_timeout:?}"),
            }),
        };

        match result {
            Ok(page) => return Ok(page),
            Err(err) if err.is_transient() && attempt + 1 < attempts => {
                let delay = policy.delay_for_attempt(attempt);
                warn!(page_index, attempt = attempt + 1, ?delay, error = %err, "retrying page fetch");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpSourceConfig {
    /// Listing URL with a `{page}` placeholder for the 1-based page index.
    pub listing_url_template: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpSourceConfig {
    fn default() -> Self {
        Self {
            listing_url_template: DEFAULT_LISTING_URL_TEMPLATE.to_string(),
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

pub const DEFAULT_LISTING_URL_TEMPLATE: &str =
    "https://otthonterkep.hu/elado+minden-kategoria/minden-megye/minden-telepules/0/0/0/0?p={page}&sort=ad_feladas_time%7Cdesc";

#[derive(Debug)]
pub struct HttpListingSource {
    client: reqwest::Client,
    listing_url_template: String,
}

impl HttpListingSource {
    pub fn new(config: HttpSourceConfig) -> anyhow::Result<Self> {
        if !config.listing_url_template.contains("{page}") {
            anyhow::bail!(
                "listing url template `{}` has no {{page}} placeholder",
                config.listing_url_template
            );
        }
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            listing_url_template: config.listing_url_template,
        })
    }

    pub fn page_url(&self, page_index: u32) -> String {
        self.listing_url_template.replace("{page}", &page_index.to_string())
    }
}

#[async_trait]
impl ListingSource for HttpListingSource {
    async fn fetch_page(&self, page_index: u32, filter: &SourceFilter) -> Result<FetchedPage, FetchError> {
        let url = self.page_url(page_index);
        let mut request = self.client.get(&url);
        if let Some(city) = &filter.city {
            request = request.query(&[("city", city.as_str())]);
        }

        let classify = |disposition: RetryDisposition, reason: String| match disposition {
            RetryDisposition::Retryable => FetchError::Transient { page_index, reason },
            RetryDisposition::NonRetryable => FetchError::Permanent { page_index, reason },
        };

        let resp = request
            .send()
            .await
            .map_err(|err| classify(classify_reqwest_error(&err), err.to_string()))?;

        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            return Err(classify(
                classify_status(status),
                format!("http status {} for {final_url}", status.as_u16()),
            ));
        }

        let body = resp
            .text()
            .await
            .map_err(|err| classify(classify_reqwest_error(&err), err.to_string()))?;
        debug!(page_index, bytes = body.len(), url = %final_url, "fetched listing page");

        Ok(FetchedPage {
            page_index,
            url: final_url,
            body,
            fetched_at: Utc::now(),
        })
    }
}

/// CSS selectors locating listing fields. Field selectors are evaluated inside each card.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListingSelectors {
    pub card: String,
    pub id_attribute: String,
    pub location_link: String,
    pub price: String,
    pub area: String,
    pub land_area: String,
    pub rooms: String,
    pub floor: String,
    pub total_count: String,
}

impl Default for ListingSelectors {
    fn default() -> Self {
        Self {
            card: "div.properties.slotDoubleColumn > div".into(),
            id_attribute: "data-id".into(),
            location_link: "h5 > a".into(),
            price: "h4".into(),
            area: "div:nth-child(1) > div:nth-child(1) > span".into(),
            land_area: "div:nth-child(1) > div:nth-child(2) > span".into(),
            rooms: "div:nth-child(2) > div:nth-child(1) > small > span".into(),
            floor: "div:nth-child(2) > div:nth-child(2) > small > span".into(),
            total_count: "div.col.h5.m-0.fw-bolder".into(),
        }
    }
}

/// A listing card that could not be turned into a fragment.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("page {page_index} listing #{position}: {reason}")]
pub struct ParseListingError {
    pub page_index: u32,
    /// 1-based position of the card on its page.
    pub position: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedPage {
    pub page_index: u32,
    pub card_count: usize,
    pub fragments: Vec<RawListingFragment>,
    pub skipped: Vec<ParseListingError>,
    /// Total result count advertised by the page, when present.
    pub total_count: Option<u64>,
}

impl ParsedPage {
    /// A page without listing cards marks the end of the result set.
    pub fn is_end_of_results(&self) -> bool {
        self.card_count == 0
    }
}

#[derive(Debug, Clone)]
pub struct ListingParser {
    card: Selector,
    id_attribute: String,
    location_link: Selector,
    price: Selector,
    area: Selector,
    land_area: Selector,
    rooms: Selector,
    floor: Selector,
    total_count: Selector,
}

fn compile(selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector).map_err(|e| AdapterError::Selector {
        selector: selector.to_string(),
        reason: e.to_string(),
    })
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn first_text(scope: ElementRef<'_>, selector: &Selector) -> Option<String> {
    scope
        .select(selector)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>()))
}

// Falls back to the last path segment of the listing link.
fn id_from_href(href: &str) -> Option<String> {
    let path = href.split(['?', '#']).next().unwrap_or_default();
    path.rsplit('/')
        .find(|segment| !segment.is_empty())
        .map(ToString::to_string)
}

impl ListingParser {
    pub fn new(selectors: &ListingSelectors) -> Result<Self, AdapterError> {
        Ok(Self {
            card: compile(&selectors.card)?,
            id_attribute: selectors.id_attribute.clone(),
            location_link: compile(&selectors.location_link)?,
            price: compile(&selectors.price)?,
            area: compile(&selectors.area)?,
            land_area: compile(&selectors.land_area)?,
            rooms: compile(&selectors.rooms)?,
            floor: compile(&selectors.floor)?,
            total_count: compile(&selectors.total_count)?,
        })
    }

    /// Extracts every well-formed listing card. Malformed cards are skipped and
    /// reported; they never fail the page.
    pub fn parse(&self, page: &FetchedPage) -> ParsedPage {
        let document = Html::parse_document(&page.body);
        let base = Url::parse(&page.url).ok();

        let total_count = document
            .select(&self.total_count)
            .next()
            .and_then(|n| n.text().collect::<String>().split_whitespace().next().map(str::to_string))
            .and_then(|token| token.chars().filter(char::is_ascii_digit).collect::<String>().parse().ok());

        let mut parsed = ParsedPage {
            page_index: page.page_index,
            total_count,
            ..Default::default()
        };

        for (idx, card) in document.select(&self.card).enumerate() {
            parsed.card_count += 1;
            match self.parse_card(card, page.page_index, base.as_ref()) {
                Ok(fragment) => parsed.fragments.push(fragment),
                Err(reason) => {
                    let err = ParseListingError {
                        page_index: page.page_index,
                        position: idx + 1,
                        reason,
                    };
                    warn!(error = %err, "skipping malformed listing");
                    parsed.skipped.push(err);
                }
            }
        }

        debug!(
            page_index = page.page_index,
            cards = parsed.card_count,
            fragments = parsed.fragments.len(),
            skipped = parsed.skipped.len(),
            "parsed listing page"
        );
        parsed
    }

    fn parse_card(&self, card: ElementRef<'_>, page_index: u32, base: Option<&Url>) -> Result<RawListingFragment, String> {
        let link = card
            .select(&self.location_link)
            .next()
            .ok_or_else(|| "missing location link".to_string())?;
        let location = text_or_none(link.text().collect::<String>())
            .ok_or_else(|| "empty location".to_string())?;
        let href = link.value().attr("href").and_then(|h| text_or_none(h.to_string()));

        let listing_id = card
            .value()
            .attr(&self.id_attribute)
            .and_then(|v| text_or_none(v.to_string()))
            .or_else(|| href.as_deref().and_then(id_from_href))
            .ok_or_else(|| "missing listing id".to_string())?;

        let price = first_text(card, &self.price).ok_or_else(|| "missing price".to_string())?;

        let url = match (&href, base) {
            (Some(h), Some(base)) => base.join(h).map(|u| u.to_string()).unwrap_or_else(|_| h.clone()),
            (Some(h), None) => h.clone(),
            (None, _) => String::new(),
        };

        Ok(RawListingFragment {
            page_index,
            listing_id,
            url,
            location,
            price,
            area: first_text(card, &self.area),
            land_area: first_text(card, &self.land_area),
            rooms: first_text(card, &self.rooms),
            floor: first_text(card, &self.floor),
        })
    }
}
