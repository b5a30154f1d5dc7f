//! LEGISinfo enrichment scraper.
//!
//! Fetches the public bill page at
//! `{base_url}/en/bill/{parliament}-{session}/{number}` (and the `/fr/`
//! page when `fetch_french` is set) and extracts status, summaries,
//! sponsor, royal assent, subjects, committees and related bills with CSS
//! selectors taken from `[enrichment.selectors]`.
//!
//! Parsing is a pure function of the HTML ([`parse_bill_page`]) so page
//! layout changes can be tested against saved fixtures.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use scraper::{ElementRef, Html, Selector};
use tracing::{debug, warn};

use crate::config::{EnrichmentConfig, SelectorConfig};
use crate::error::SourceError;
use crate::http::{CircuitBreaker, Fetched, HttpFetcher, HttpStats, RetryPolicy};
use crate::models::{BillEnrichment, NaturalKey};
use crate::traits::{BillEnricher, Enrichment};

/// Compiled form of [`SelectorConfig`].
pub struct PageSelectors {
    status: Selector,
    summary: Selector,
    sponsor: Selector,
    royal_assent: Selector,
    subjects: Selector,
    committees: Selector,
    related_bills: Selector,
    legisinfo_id: Selector,
}

fn compile(name: &str, css: &str) -> Result<Selector> {
    Selector::parse(css).map_err(|e| anyhow::anyhow!("invalid {} selector '{}': {}", name, css, e))
}

impl PageSelectors {
    pub fn compile(config: &SelectorConfig) -> Result<Self> {
        Ok(Self {
            status: compile("status", &config.status)?,
            summary: compile("summary", &config.summary)?,
            sponsor: compile("sponsor", &config.sponsor)?,
            royal_assent: compile("royal_assent", &config.royal_assent)?,
            subjects: compile("subjects", &config.subjects)?,
            committees: compile("committees", &config.committees)?,
            related_bills: compile("related_bills", &config.related_bills)?,
            legisinfo_id: compile("legisinfo_id", &config.legisinfo_id)?,
        })
    }
}

fn element_text(el: ElementRef<'_>) -> String {
    el.text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

fn first_text(doc: &Html, selector: &Selector) -> Option<String> {
    doc.select(selector)
        .map(element_text)
        .find(|text| !text.is_empty())
}

fn all_texts(doc: &Html, selector: &Selector) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for text in doc.select(selector).map(element_text) {
        if !text.is_empty() && !out.contains(&text) {
            out.push(text);
        }
    }
    out
}

fn trim_punct(token: &str) -> &str {
    token.trim_matches(|c: char| c == ',' || c == ';' || c == '.' || c == '(' || c == ')')
}

/// First ISO (`2022-06-23`) or long-form (`June 23, 2022`) date in `text`.
pub fn find_date(text: &str) -> Option<NaiveDate> {
    let tokens: Vec<&str> = text.split_whitespace().map(trim_punct).collect();
    for (i, token) in tokens.iter().enumerate() {
        if let Ok(date) = NaiveDate::parse_from_str(token, "%Y-%m-%d") {
            return Some(date);
        }
        if let Some(window) = tokens.get(i..i + 3) {
            let joined = window.join(" ");
            if let Ok(date) = NaiveDate::parse_from_str(&joined, "%B %d %Y") {
                return Some(date);
            }
        }
    }
    None
}

/// Statute chapter such as `c. 10` from a royal assent line.
pub fn find_chapter(text: &str) -> Option<String> {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    tokens.windows(2).find_map(|pair| {
        let marker = pair[0].to_ascii_lowercase();
        if marker == "c." || marker == "chapter" || marker == "ch." {
            let number = trim_punct(pair[1]);
            if !number.is_empty() && number.chars().all(|c| c.is_ascii_digit()) {
                return Some(format!("c. {}", number));
            }
        }
        None
    })
}

/// Extract an enrichment delta from an English LEGISinfo bill page.
///
/// Missing elements leave the corresponding field empty; a page with no
/// recognizable content yields an empty delta.
pub fn parse_bill_page(html: &str, selectors: &PageSelectors) -> BillEnrichment {
    let doc = Html::parse_document(html);

    let legisinfo_id = doc
        .select(&selectors.legisinfo_id)
        .filter_map(|el| el.value().attr("data-bill-id"))
        .find_map(|raw| raw.trim().parse::<i64>().ok());

    let (royal_assent_date, royal_assent_chapter) = match doc.select(&selectors.royal_assent).next() {
        Some(el) => {
            let text = element_text(el);
            let date = el
                .value()
                .attr("datetime")
                .and_then(|raw| NaiveDate::parse_from_str(raw.get(..10).unwrap_or(raw), "%Y-%m-%d").ok())
                .or_else(|| find_date(&text));
            (date, find_chapter(&text))
        }
        None => (None, None),
    };

    let related_bill_numbers = all_texts(&doc, &selectors.related_bills)
        .into_iter()
        .map(|number| number.to_uppercase())
        .collect();

    BillEnrichment {
        status: first_text(&doc, &selectors.status),
        summary_en: first_text(&doc, &selectors.summary),
        summary_fr: None,
        sponsor_name: first_text(&doc, &selectors.sponsor),
        legisinfo_id,
        royal_assent_date,
        royal_assent_chapter,
        subject_tags: all_texts(&doc, &selectors.subjects),
        committee_studies: all_texts(&doc, &selectors.committees),
        related_bill_numbers,
    }
}

/// Summary paragraph from the French page.
pub fn parse_french_summary(html: &str, selectors: &PageSelectors) -> Option<String> {
    let doc = Html::parse_document(html);
    first_text(&doc, &selectors.summary)
}

/// [`BillEnricher`] backed by LEGISinfo bill pages.
pub struct LegisInfoScraper {
    http: HttpFetcher,
    base_url: String,
    fetch_french: bool,
    selectors: PageSelectors,
}

impl LegisInfoScraper {
    pub fn new(config: &EnrichmentConfig) -> Result<Self> {
        let http = HttpFetcher::new(
            "legisinfo",
            config.timeout(),
            &config.user_agent,
            config.min_request_interval(),
            RetryPolicy::new(config.max_retries),
            CircuitBreaker::new(
                config.circuit_breaker_threshold,
                config.circuit_breaker_cooldown(),
            ),
        )?;
        let selectors =
            PageSelectors::compile(&config.selectors).context("Failed to compile enrichment selectors")?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            fetch_french: config.fetch_french,
            selectors,
        })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.http = self.http.with_retry_policy(retry);
        self
    }

    pub fn with_circuit_breaker(mut self, breaker: CircuitBreaker) -> Self {
        self.http = self.http.with_circuit_breaker(breaker);
        self
    }

    pub fn page_url(&self, lang: &str, key: &NaturalKey) -> String {
        format!(
            "{}/{}/bill/{}/{}",
            self.base_url,
            lang,
            key.session_code(),
            key.number.to_lowercase()
        )
    }

    async fn fetch_page(&self, url: &str) -> Result<Option<String>, SourceError> {
        match self.http.get(url).await? {
            Fetched::NotFound => Ok(None),
            Fetched::Ok(html) => Ok(Some(html)),
        }
    }
}

#[async_trait]
impl BillEnricher for LegisInfoScraper {
    fn name(&self) -> &str {
        "legisinfo"
    }

    fn http_stats(&self) -> Option<HttpStats> {
        Some(self.http.stats())
    }

    async fn enrich(&self, key: &NaturalKey) -> Result<Enrichment, SourceError> {
        let url = self.page_url("en", key);
        let Some(html) = self.fetch_page(&url).await? else {
            debug!(bill = %key, "no LEGISinfo page");
            return Ok(Enrichment::NoNewData);
        };
        let mut delta = parse_bill_page(&html, &self.selectors);

        if self.fetch_french {
            let url = self.page_url("fr", key);
            match self.fetch_page(&url).await {
                Ok(Some(html)) => delta.summary_fr = parse_french_summary(&html, &self.selectors),
                Ok(None) => {}
                // The English delta stands on its own.
                Err(e) => warn!(bill = %key, error = %e, "French page unavailable"),
            }
        }

        if delta.is_empty() {
            debug!(bill = %key, "LEGISinfo page had nothing to extract");
            return Ok(Enrichment::NoNewData);
        }
        Ok(Enrichment::Found(delta))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"
        <html><body>
          <div class="bill-header" data-bill-id="11410000">
            <h1>C-10</h1>
            <p class="bill-status">Royal assent received</p>
          </div>
          <section id="bill-summary">
            This enactment amends the   Food and Drugs Act.
          </section>
          <div class="bill-sponsor"><a href="/members/1">Hon. Jean-Yves Duclos</a></div>
          <p class="royal-assent">Royal Assent: June 23, 2022, Statutes of Canada 2022, c. 10</p>
          <ul class="bill-subjects"><li>Health</li><li>Drugs</li><li>Health</li></ul>
          <ul class="bill-committees"><li>HESA</li></ul>
          <ul class="related-bills"><li>c-11</li></ul>
        </body></html>
    "#;

    fn selectors() -> PageSelectors {
        PageSelectors::compile(&SelectorConfig::default()).unwrap()
    }

    #[test]
    fn test_parse_full_page() {
        let delta = parse_bill_page(PAGE, &selectors());
        assert_eq!(delta.status.as_deref(), Some("Royal assent received"));
        assert_eq!(
            delta.summary_en.as_deref(),
            Some("This enactment amends the Food and Drugs Act.")
        );
        assert_eq!(delta.sponsor_name.as_deref(), Some("Hon. Jean-Yves Duclos"));
        assert_eq!(delta.legisinfo_id, Some(11410000));
        assert_eq!(delta.royal_assent_date, NaiveDate::from_ymd_opt(2022, 6, 23));
        assert_eq!(delta.royal_assent_chapter.as_deref(), Some("c. 10"));
        assert_eq!(delta.subject_tags, vec!["Health", "Drugs"]);
        assert_eq!(delta.committee_studies, vec!["HESA"]);
        assert_eq!(delta.related_bill_numbers, vec!["C-11"]);
    }

    #[test]
    fn test_unrelated_page_is_empty() {
        let delta = parse_bill_page("<html><body><p>Maintenance</p></body></html>", &selectors());
        assert!(delta.is_empty());
    }

    #[test]
    fn test_royal_assent_datetime_attribute() {
        let html = r#"<time data-field="royal-assent" datetime="2023-03-30T00:00:00">Assented</time>"#;
        let delta = parse_bill_page(html, &selectors());
        assert_eq!(delta.royal_assent_date, NaiveDate::from_ymd_opt(2023, 3, 30));
        assert_eq!(delta.royal_assent_chapter, None);
    }

    #[test]
    fn test_find_date_and_chapter() {
        assert_eq!(find_date("on 2021-12-17."), NaiveDate::from_ymd_opt(2021, 12, 17));
        assert_eq!(
            find_date("Assented to December 17, 2021"),
            NaiveDate::from_ymd_opt(2021, 12, 17)
        );
        assert_eq!(find_date("no date here"), None);
        assert_eq!(find_chapter("S.C. 2021, c. 26"), Some("c. 26".to_string()));
        assert_eq!(find_chapter("chapter 7;"), Some("c. 7".to_string()));
        assert_eq!(find_chapter("c. abc"), None);
    }

    #[test]
    fn test_french_summary() {
        let html = r#"<div class="bill-summary">Le texte modifie la Loi.</div>"#;
        assert_eq!(
            parse_french_summary(html, &selectors()).as_deref(),
            Some("Le texte modifie la Loi.")
        );
    }

    #[test]
    fn test_page_url_lowercases_number() {
        let scraper = LegisInfoScraper::new(&EnrichmentConfig::default()).unwrap();
        let key = NaturalKey::new("canada-federal", 44, 1, "C-2");
        assert_eq!(
            scraper.page_url("en", &key),
            "https://www.parl.ca/legisinfo/en/bill/44-1/c-2"
        );
    }

    #[test]
    fn test_invalid_selector_is_rejected() {
        let config = SelectorConfig {
            status: "[[".to_string(),
            ..SelectorConfig::default()
        };
        assert!(PageSelectors::compile(&config).is_err());
    }
}
