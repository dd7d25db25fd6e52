//! Web crawler and fetcher.
//!
//! Fetches a single URL or breadth-first crawls same-origin links up to a
//! page cap, converts each page's main content to markdown, creates a
//! document per page, and hands it to the ingestion pipeline
//! asynchronously (an ingest failure never fails the crawl).
//!
//! Safety properties:
//! - every URL passes the SSRF guard before any request is issued:
//!   loopback, RFC1918, link-local, and unique-local targets are refused,
//!   as are malformed IPv4 literals;
//! - URLs are normalized (sorted query, collapsed slashes, no fragment)
//!   so revisits are detected reliably; normalization is idempotent;
//! - page loads have a 30s timeout and a 50 MB streamed size cap;
//! - one worker per crawl with a 1s politeness delay between page loads.

use futures::StreamExt;
use std::collections::{HashSet, VecDeque};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::{Host, Url};

use crate::config::CrawlerConfig;
use crate::error::{Error, Result};
use crate::extract;
use crate::files;
use crate::ingest::IngestOrchestrator;
use crate::models::Metadata;
use crate::store::Store;

/// Download size cap per page.
const MAX_PAGE_BYTES: usize = 50 * 1024 * 1024;

/// Crawl mode: one page or bounded same-origin BFS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrawlMode {
    Single,
    Crawl,
}

/// Crawl request.
#[derive(Debug, Clone)]
pub struct CrawlRequest {
    pub url: String,
    pub collection_id: String,
    pub mode: CrawlMode,
    pub max_pages: usize,
    pub title_prefix: Option<String>,
}

/// One page turned into a document.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CrawledPage {
    pub doc_id: String,
    pub url: String,
    pub title: String,
}

#[derive(Clone)]
pub struct Crawler {
    store: Store,
    orchestrator: IngestOrchestrator,
    config: CrawlerConfig,
    http: reqwest::Client,
}

impl Crawler {
    pub fn new(store: Store, orchestrator: IngestOrchestrator, config: CrawlerConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.nav_timeout_secs))
            .user_agent(concat!("docsynth/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Validation(format!("http client: {}", e)))?;
        Ok(Self {
            store,
            orchestrator,
            config,
            http,
        })
    }

    /// Run a crawl. Fails only on an invalid initial URL or a missing
    /// collection; per-page failures are skipped.
    pub async fn crawl(
        &self,
        request: &CrawlRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<CrawledPage>> {
        let start = normalize_url(&request.url)?;
        let origin = Url::parse(&start).map_err(|e| Error::Validation(e.to_string()))?;
        if !is_public_url(&origin) {
            return Err(Error::Validation(format!(
                "refusing to fetch non-public URL: {}",
                request.url
            )));
        }
        self.store.get_collection(&request.collection_id).await?;

        let max_pages = request.max_pages.max(1);
        let mut queue: VecDeque<String> = VecDeque::new();
        let mut visited: HashSet<String> = HashSet::new();
        let mut pages: Vec<CrawledPage> = Vec::new();
        let mut first_fetch = true;
        queue.push_back(start);

        while let Some(current) = queue.pop_front() {
            if cancel.is_cancelled() {
                break;
            }
            if pages.len() >= max_pages {
                break;
            }
            if !visited.insert(current.clone()) {
                continue;
            }

            // Politeness delay between page loads after the first.
            if !first_fetch {
                tokio::time::sleep(Duration::from_millis(self.config.page_delay_ms)).await;
            }
            first_fetch = false;

            let html = match self.fetch_page(&current).await {
                Ok(html) => html,
                Err(e) => {
                    warn!(url = %current, error = %e, "page fetch failed; skipping");
                    continue;
                }
            };

            let markdown = extract::html_to_markdown(&html);
            if markdown.trim().is_empty() {
                debug!(url = %current, "page had no main content; skipping");
            } else {
                match self.create_page_document(request, &current, &html, &markdown).await {
                    Ok(page) => pages.push(page),
                    Err(e) => {
                        warn!(url = %current, error = %e, "failed to store page; skipping");
                    }
                }
            }

            if request.mode == CrawlMode::Crawl {
                for link in discover_links(&origin, &html) {
                    if !visited.contains(&link) && !queue.contains(&link) {
                        queue.push_back(link);
                    }
                }
            }
        }

        info!(
            pages = pages.len(),
            visited = visited.len(),
            "crawl finished"
        );
        Ok(pages)
    }

    /// Fetch one page with the size cap enforced while streaming.
    async fn fetch_page(&self, url: &str) -> Result<String> {
        let parsed = Url::parse(url).map_err(|e| Error::Validation(e.to_string()))?;
        if !is_public_url(&parsed) {
            return Err(Error::Validation(format!("non-public URL: {}", url)));
        }

        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| Error::Validation(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Error::Validation(format!(
                "fetch returned {}",
                response.status()
            )));
        }

        let mut body: Vec<u8> = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(piece) = stream.next().await {
            let piece = piece.map_err(|e| Error::Validation(e.to_string()))?;
            if body.len() + piece.len() > MAX_PAGE_BYTES {
                return Err(Error::FileTooLarge {
                    size: (body.len() + piece.len()) as u64,
                    limit: MAX_PAGE_BYTES as u64,
                });
            }
            body.extend_from_slice(&piece);
        }

        Ok(String::from_utf8_lossy(&body).into_owned())
    }

    /// Store the page markdown as a document and hand it to ingestion.
    async fn create_page_document(
        &self,
        request: &CrawlRequest,
        url: &str,
        html: &str,
        markdown: &str,
    ) -> Result<CrawledPage> {
        let host = Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_else(|| "page".to_string());
        let base_title = extract::html_title(html).unwrap_or(host);
        let title = match &request.title_prefix {
            Some(prefix) => format!("{} {}", prefix, base_title),
            None => base_title,
        };

        let mut metadata = Metadata::default();
        metadata.doc_type = Some("web".to_string());

        let doc = self
            .store
            .create_document(
                &request.collection_id,
                &title,
                "text/markdown",
                markdown.len() as i64,
                Some(url),
                None,
                &metadata,
            )
            .await?;

        let path = files::store_file(
            self.orchestrator.storage_root(),
            &request.collection_id,
            &doc.id,
            ".md",
            markdown.as_bytes(),
        )
        .await?;
        self.store
            .set_document_file(&doc.id, &path.to_string_lossy(), markdown.len() as i64)
            .await?;

        self.orchestrator
            .ingest_detached(doc.id.clone(), CancellationToken::new());

        Ok(CrawledPage {
            doc_id: doc.id,
            url: url.to_string(),
            title,
        })
    }
}

/// Same-origin links from a page, normalized, guard-checked.
fn discover_links(origin: &Url, html: &str) -> Vec<String> {
    extract::html_links(html)
        .into_iter()
        .filter_map(|href| origin.join(&href).ok())
        .filter(|u| same_origin(origin, u))
        .filter_map(|u| normalize_url(u.as_str()).ok())
        .filter(|u| Url::parse(u).map(|p| is_public_url(&p)).unwrap_or(false))
        .collect()
}

fn same_origin(a: &Url, b: &Url) -> bool {
    a.scheme() == b.scheme() && a.host_str() == b.host_str() && a.port_or_known_default() == b.port_or_known_default()
}

/// Normalize a URL: http/https only, fragment stripped, query params
/// sorted, repeated path slashes collapsed, trailing slash dropped except
/// at the root. Idempotent.
pub fn normalize_url(raw: &str) -> Result<String> {
    let mut url = Url::parse(raw.trim())
        .map_err(|e| Error::Validation(format!("invalid URL '{}': {}", raw, e)))?;

    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(Error::Validation(format!(
                "unsupported URL scheme: {}",
                other
            )))
        }
    }

    url.set_fragment(None);

    // Sort query parameters for stable revisit detection.
    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if pairs.is_empty() {
        url.set_query(None);
    } else {
        pairs.sort();
        let query = pairs
            .iter()
            .map(|(k, v)| {
                if v.is_empty() {
                    k.clone()
                } else {
                    format!("{}={}", k, v)
                }
            })
            .collect::<Vec<_>>()
            .join("&");
        url.set_query(Some(&query));
    }

    // Collapse repeated slashes and drop the trailing slash (except root).
    let segments: Vec<&str> = url.path().split('/').filter(|s| !s.is_empty()).collect();
    let path = if segments.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", segments.join("/"))
    };
    url.set_path(&path);

    Ok(url.to_string())
}

/// SSRF guard: is this URL safe to fetch?
///
/// Rejects `localhost`, loopback/private/link-local IPv4 ranges,
/// IPv6 loopback, link-local (`fe80::/10`) and unique-local (`fc00::/7`)
/// addresses, and anything that looks like an IPv4 literal but has
/// invalid octets. Plain hostnames are allowed.
pub fn is_public_url(url: &Url) -> bool {
    match url.scheme() {
        "http" | "https" => {}
        _ => return false,
    }

    let Some(host) = url.host() else {
        return false;
    };

    match host {
        Host::Ipv4(addr) => ipv4_public(addr),
        Host::Ipv6(addr) => ipv6_public(addr),
        Host::Domain(domain) => {
            let lower = domain.to_lowercase();
            if lower == "localhost" {
                return false;
            }
            // A numeric-dotted name is an IPv4 literal: it must parse
            // with octets in 0-255 and then pass the range checks.
            if lower.chars().all(|c| c.is_ascii_digit() || c == '.') {
                return match lower.parse::<Ipv4Addr>() {
                    Ok(addr) => ipv4_public(addr),
                    Err(_) => false,
                };
            }
            true
        }
    }
}

fn ipv4_public(addr: Ipv4Addr) -> bool {
    let [a, b, _, _] = addr.octets();
    !(a == 127
        || a == 10
        || (a == 172 && (16..=31).contains(&b))
        || (a == 192 && b == 168)
        || (a == 169 && b == 254))
}

fn ipv6_public(addr: Ipv6Addr) -> bool {
    if addr == Ipv6Addr::LOCALHOST {
        return false;
    }
    let first = addr.segments()[0];
    // fe80::/10 link-local, fc00::/7 unique-local
    !((first & 0xffc0) == 0xfe80 || (first & 0xfe00) == 0xfc00)
}
