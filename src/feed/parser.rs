use chrono::{DateTime, Utc};
use encoding_rs::{Encoding, UTF_8};
use feed_rs::parser;
use std::borrow::Cow;
use std::ops::Range;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Failed to parse RSS feed: {0}")]
    Parse(String),
}

/// Entry filters applied while decoding.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ItemFilters {
    /// Drop entries published before this instant (undated entries are kept).
    pub newer_than: Option<DateTime<Utc>>,
    /// Drop entries whose guid is listed.
    pub guid_blacklist: Vec<String>,
}

/// Knobs handed to a [`FeedDecoder`] for one document.
#[derive(Debug, Clone, Copy, Default)]
pub struct DecodeOptions<'a> {
    /// Stop once this many entries have been kept.
    pub max_items: Option<usize>,
    pub filters: Option<&'a ItemFilters>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedDocument {
    pub title: Option<String>,
    pub description: Option<String>,
    pub link: Option<String>,
    pub language: Option<String>,
    pub items: Vec<FeedItem>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedItem {
    pub title: Option<String>,
    pub description: Option<String>,
    pub link: Option<String>,
    pub guid: String,
    pub pub_date: Option<DateTime<Utc>>,
    pub author: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub categories: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub enclosures: Vec<Enclosure>,
    pub content: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Enclosure {
    pub url: String,
    #[serde(rename = "type")]
    pub mime_type: Option<String>,
    pub length: Option<u64>,
}

/// Turns raw response bytes into a structured feed.
pub trait FeedDecoder: Send + Sync {
    fn decode(
        &self,
        bytes: &[u8],
        charset: Option<&str>,
        options: DecodeOptions<'_>,
    ) -> Result<FeedDocument, DecodeError>;
}

/// RSS 0.9x/1.0/2.0, Atom and JSON Feed via `feed-rs`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FeedRsDecoder;

impl FeedDecoder for FeedRsDecoder {
    fn decode(
        &self,
        bytes: &[u8],
        charset: Option<&str>,
        options: DecodeOptions<'_>,
    ) -> Result<FeedDocument, DecodeError> {
        let bytes = transcode(bytes, charset);
        let feed = parser::parse(bytes.as_ref()).map_err(|e| DecodeError::Parse(e.to_string()))?;

        let items = select_items(feed.entries.into_iter().map(convert_entry), options);

        tracing::info!(items = items.len(), "Successfully parsed RSS feed");

        Ok(FeedDocument {
            title: feed.title.map(|t| t.content),
            description: feed.description.map(|t| t.content),
            link: feed.links.into_iter().next().map(|l| l.href),
            language: feed.language,
            items,
        })
    }
}

/// Re-encodes the body as UTF-8 when the `Content-Type` charset names another
/// encoding.
///
/// The header wins over the XML prolog, so the prolog's `encoding` attribute
/// is dropped from transcoded text. Without a header the bytes go to feed-rs
/// untouched and the prolog decides.
fn transcode<'a>(bytes: &'a [u8], charset: Option<&str>) -> Cow<'a, [u8]> {
    let Some(label) = charset else {
        return Cow::Borrowed(bytes);
    };
    let Some(encoding) = Encoding::for_label(label.trim().as_bytes()) else {
        tracing::warn!(charset = %label, "Unknown charset in Content-Type, parsing bytes as-is");
        return Cow::Borrowed(bytes);
    };
    if encoding == UTF_8 {
        return Cow::Borrowed(bytes);
    }

    // A BOM overrides the label
    let (text, actual, had_errors) = encoding.decode(bytes);
    if had_errors {
        tracing::debug!(charset = actual.name(), "Malformed sequences replaced while decoding feed");
    }
    tracing::debug!(charset = actual.name(), "Transcoded feed body to UTF-8");

    Cow::Owned(drop_encoding_declaration(&text).into_bytes())
}

fn drop_encoding_declaration(text: &str) -> String {
    if !text.starts_with("<?xml") {
        return text.to_string();
    }
    let prolog = match text.find("?>") {
        Some(end) => &text[..end],
        None => return text.to_string(),
    };
    match encoding_attribute(prolog) {
        Some(range) => format!("{}{}", &text[..range.start], &text[range.end..]),
        None => text.to_string(),
    }
}

/// Byte range of `encoding="..."` inside an XML declaration.
fn encoding_attribute(prolog: &str) -> Option<Range<usize>> {
    let start = prolog.find("encoding")?;
    let value = prolog[start + "encoding".len()..]
        .trim_start()
        .strip_prefix('=')?
        .trim_start();
    let quote = value.chars().next().filter(|c| *c == '"' || *c == '\'')?;
    let value_len = value[1..].find(quote)?;
    let value_start = prolog.len() - value.len();
    Some(start..value_start + value_len + 2)
}

/// Applies the item cap, guid blacklist and age filter, in entry order.
fn select_items(entries: impl Iterator<Item = FeedItem>, options: DecodeOptions<'_>) -> Vec<FeedItem> {
    let mut items = Vec::new();

    for item in entries {
        if options.max_items.is_some_and(|max| items.len() >= max) {
            break;
        }

        if let Some(filters) = options.filters {
            if filters.guid_blacklist.iter().any(|g| *g == item.guid) {
                continue;
            }
            if let (Some(cutoff), Some(published)) = (filters.newer_than, item.pub_date) {
                if published < cutoff {
                    continue;
                }
            }
        }

        items.push(item);
    }

    items
}

fn convert_entry(entry: feed_rs::model::Entry) -> FeedItem {
    let link = entry.links.first().map(|l| l.href.clone());
    let pub_date = entry.published.or(entry.updated);
    let title = entry.title.map(|t| t.content);

    let existing_id = if entry.id.is_empty() {
        None
    } else {
        Some(entry.id.as_str())
    };
    let guid = generate_guid(
        existing_id,
        link.as_deref(),
        title.as_deref().unwrap_or(""),
        pub_date.map(|d| d.timestamp()),
    );

    let categories = entry
        .categories
        .into_iter()
        .map(|c| c.label.unwrap_or(c.term))
        .filter(|c| !c.is_empty())
        .collect();

    let enclosures = entry
        .media
        .into_iter()
        .flat_map(|m| m.content)
        .filter_map(|c| {
            Some(Enclosure {
                url: c.url?.to_string(),
                mime_type: c.content_type.map(|m| m.to_string()),
                length: c.size,
            })
        })
        .collect();

    FeedItem {
        title,
        description: entry.summary.map(|s| s.content),
        link,
        guid,
        pub_date,
        author: entry.authors.into_iter().next().map(|p| p.name),
        categories,
        enclosures,
        content: entry.content.and_then(|c| c.body),
    }
}

fn generate_guid(
    existing: Option<&str>,
    url: Option<&str>,
    title: &str,
    published: Option<i64>,
) -> String {
    if let Some(guid) = existing {
        let trimmed = guid.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }

    let input = format!(
        "{}|{}|{}",
        url.unwrap_or(""),
        title,
        published.map(|p| p.to_string()).unwrap_or_default()
    );
    let hash = Sha256::digest(input.as_bytes());
    format!("{:x}", hash)
}
