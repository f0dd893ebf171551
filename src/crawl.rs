//! Breadth-first web crawler for URL sources.
//!
//! Starting from a seed URL, pages are fetched level by level following only
//! links with the seed's origin (scheme, host, port). The crawl stops after
//! `crawl.max_pages` pages or `crawl.max_depth` link hops. Non-HTML
//! responses are skipped, except the seed itself, which may be any type
//! [`extract`] understands (so a URL source can point straight at a PDF).
//!
//! Every request counts against a fetch budget of `FETCHES_PER_PAGE ×
//! max_pages`, whether or not it yields a page. Redirects are followed only
//! within the seed's origin.
//!
//! Unless `crawl.allow_private_hosts` is set, seeds resolving to loopback,
//! private, link-local or otherwise internal addresses are refused.
//!
//! A failure to fetch the seed fails the crawl; failures on later pages are
//! logged and skipped.

use std::collections::{HashSet, VecDeque};
use std::net::IpAddr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use futures_util::StreamExt;
use reqwest::Url;

use crate::config::CrawlConfig;
use crate::extract;

const FETCHES_PER_PAGE: usize = 2;
const MAX_REDIRECTS: usize = 5;

/// File extensions never worth requesting as pages.
const SKIP_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "svg", "webp", "ico", "css", "js", "zip", "gz", "tar", "mp3",
    "mp4", "avi", "mov", "woff", "woff2", "ttf", "exe", "dmg",
];

#[derive(Debug, Clone)]
pub struct CrawledPage {
    pub url: String,
    pub title: Option<String>,
    pub content_type: String,
    pub text: String,
}

pub struct Crawler {
    client: reqwest::Client,
    max_pages: usize,
    max_depth: usize,
    max_page_bytes: usize,
    allow_private_hosts: bool,
}

impl Crawler {
    pub fn new(config: &CrawlConfig) -> Result<Self> {
        let redirects = reqwest::redirect::Policy::custom(|attempt| {
            let leaves_origin = attempt
                .previous()
                .first()
                .map_or(false, |first| first.origin() != attempt.url().origin());
            if attempt.previous().len() > MAX_REDIRECTS {
                attempt.error("too many redirects")
            } else if leaves_origin {
                attempt.stop()
            } else {
                attempt.follow()
            }
        });
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(Duration::from_secs(config.timeout_secs))
            .redirect(redirects)
            .build()?;
        Ok(Self {
            client,
            max_pages: config.max_pages.max(1),
            max_depth: config.max_depth,
            max_page_bytes: config.max_page_bytes,
            allow_private_hosts: config.allow_private_hosts,
        })
    }

    pub async fn crawl(&self, seed: &Url) -> Result<Vec<CrawledPage>> {
        let mut pages = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<(Url, usize)> = VecDeque::new();

        let seed = normalize(seed.clone());
        if !self.allow_private_hosts {
            ensure_public_host(&seed).await?;
        }
        seen.insert(seed.to_string());
        queue.push_back((seed.clone(), 0));

        let budget = self.max_pages * FETCHES_PER_PAGE;
        let mut fetches = 0;

        while let Some((url, depth)) = queue.pop_front() {
            if pages.len() >= self.max_pages {
                break;
            }
            if fetches >= budget {
                tracing::debug!(seed = %seed, fetches, "fetch budget exhausted");
                break;
            }
            fetches += 1;
            let is_seed = url == seed;

            let fetched = match self.fetch(&url).await {
                Ok(f) if f.final_url.origin() != seed.origin() => {
                    let e = anyhow::anyhow!("redirected off-origin to {}", f.final_url);
                    if is_seed {
                        return Err(e.context(format!("fetching {}", url)));
                    }
                    tracing::warn!(url = %url, error = %e, "skipping page");
                    continue;
                }
                Ok(f) => f,
                Err(e) if is_seed => return Err(e.context(format!("fetching {}", url))),
                Err(e) => {
                    tracing::warn!(url = %url, error = %e, "skipping page");
                    continue;
                }
            };

            let content_type = extract::base_content_type(&fetched.content_type);
            if content_type == extract::MIME_HTML || content_type.is_empty() {
                let html = String::from_utf8_lossy(&fetched.body);
                if depth < self.max_depth {
                    for link in extract_links(&html, &fetched.final_url) {
                        if link.origin() == seed.origin() && seen.insert(link.to_string()) {
                            queue.push_back((link, depth + 1));
                        }
                    }
                }
                let text = extract::html_to_text(&html);
                if text.trim().is_empty() {
                    continue;
                }
                pages.push(CrawledPage {
                    url: url.to_string(),
                    title: extract::html_title(&html),
                    content_type: extract::MIME_HTML.to_string(),
                    text,
                });
            } else if is_seed {
                let text = extract::extract_text(&fetched.body, &content_type)
                    .with_context(|| format!("extracting {}", url))?;
                pages.push(CrawledPage {
                    url: url.to_string(),
                    title: None,
                    content_type,
                    text,
                });
            } else {
                tracing::debug!(url = %url, content_type = %content_type, "skipping non-HTML page");
            }
        }

        tracing::info!(seed = %seed, pages = pages.len(), fetches, "crawl finished");
        Ok(pages)
    }

    async fn fetch(&self, url: &Url) -> Result<Fetched> {
        let response = self.client.get(url.clone()).send().await?;
        let status = response.status();
        if !status.is_success() {
            bail!("HTTP {}", status);
        }
        let final_url = response.url().clone();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        let mut body = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(piece) = stream.next().await {
            body.extend_from_slice(&piece?);
            if body.len() > self.max_page_bytes {
                bail!("response exceeds {} bytes", self.max_page_bytes);
            }
        }

        Ok(Fetched {
            final_url,
            content_type,
            body,
        })
    }
}

struct Fetched {
    final_url: Url,
    content_type: String,
    body: Vec<u8>,
}

/// Refuse URLs whose host is, or resolves to, an internal address.
pub async fn ensure_public_host(url: &Url) -> Result<()> {
    let host = url.host_str().context("url has no host")?;
    let literal = host.trim_start_matches('[').trim_end_matches(']');
    let addrs: Vec<IpAddr> = match literal.parse::<IpAddr>() {
        Ok(ip) => vec![ip],
        Err(_) => {
            let port = url.port_or_known_default().unwrap_or(80);
            tokio::net::lookup_host((host, port))
                .await
                .with_context(|| format!("cannot resolve {}", host))?
                .map(|addr| addr.ip())
                .collect()
        }
    };
    if addrs.is_empty() {
        bail!("cannot resolve {}", host);
    }
    if let Some(ip) = addrs.into_iter().find(|ip| is_internal(*ip)) {
        bail!("{} resolves to internal address {}", host, ip);
    }
    Ok(())
}

/// Loopback, private, link-local, carrier-grade NAT, unspecified and
/// other non-routable ranges.
pub fn is_internal(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let [a, b, ..] = v4.octets();
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
                || v4.is_documentation()
                || a == 0
                || (a == 100 && (64..128).contains(&b))
        }
        IpAddr::V6(v6) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                return is_internal(IpAddr::V4(v4));
            }
            let first = v6.segments()[0];
            v6.is_loopback()
                || v6.is_unspecified()
                || (first & 0xfe00) == 0xfc00
                || (first & 0xffc0) == 0xfe80
        }
    }
}

fn normalize(mut url: Url) -> Url {
    url.set_fragment(None);
    url
}

fn worth_fetching(url: &Url) -> bool {
    if !matches!(url.scheme(), "http" | "https") {
        return false;
    }
    let ext = url
        .path()
        .rsplit('/')
        .next()
        .and_then(|last| last.rsplit_once('.'))
        .map(|(_, ext)| ext.to_ascii_lowercase());
    !matches!(ext, Some(e) if SKIP_EXTENSIONS.contains(&e.as_str()))
}

/// Absolute, fragment-free targets of `<a href>` links in `html`.
pub fn extract_links(html: &str, base: &Url) -> Vec<Url> {
    let lower = html.to_ascii_lowercase();
    let mut links = Vec::new();
    let mut pos = 0;

    while let Some(found) = lower[pos..].find("<a") {
        let tag_start = pos + found;
        let tag_end = match lower[tag_start..].find('>') {
            Some(end) => tag_start + end,
            None => break,
        };
        pos = tag_end;

        let after = lower.as_bytes().get(tag_start + 2).copied();
        if !matches!(after, Some(b) if b.is_ascii_whitespace()) {
            continue;
        }
        let tag = &html[tag_start..tag_end];
        if let Some(href) = attribute(tag, &lower[tag_start..tag_end], "href") {
            let href = extract::decode_entities(href.trim());
            if href.starts_with('#') || href.starts_with("javascript:") || href.starts_with("mailto:")
            {
                continue;
            }
            if let Ok(url) = base.join(&href) {
                let url = normalize(url);
                if worth_fetching(&url) {
                    links.push(url);
                }
            }
        }
    }
    links
}

/// Value of attribute `name` in a tag; `lower_tag` is `tag` lowercased.
fn attribute<'a>(tag: &'a str, lower_tag: &str, name: &str) -> Option<&'a str> {
    let mut search = 0;
    while let Some(found) = lower_tag[search..].find(name) {
        let start = search + found;
        search = start + name.len();

        let preceded_ok = lower_tag[..start]
            .chars()
            .last()
            .map_or(false, |c| c.is_ascii_whitespace());
        let rest = lower_tag[search..].trim_start();
        if !preceded_ok || !rest.starts_with('=') {
            continue;
        }
        let value_start = lower_tag.len() - rest.len() + 1;
        let value = tag[value_start..].trim_start();
        let offset = tag.len() - value.len();
        return match value.chars().next() {
            Some(q @ ('"' | '\'')) => {
                let inner = &tag[offset + 1..];
                inner.find(q).map(|end| &inner[..end])
            }
            Some(_) => {
                let end = value
                    .find(|c: char| c.is_ascii_whitespace())
                    .unwrap_or(value.len());
                Some(&value[..end])
            }
            None => None,
        };
    }
    None
}
