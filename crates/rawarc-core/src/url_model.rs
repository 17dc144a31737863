//! Segment URL modeling.
//!
//! Classifies a raw media URL into one of the two recognized shapes, extracts
//! the stream identity (`id`, `itag`, optional `expire`) and produces the
//! per-segment URL for any sequence number.

use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use url::Url;

/// Error for URLs that match neither shape or are missing identity parameters.
/// These are configuration errors and fatal before any network I/O.
#[derive(Debug)]
pub struct MalformedUrl(String);

impl fmt::Display for MalformedUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for MalformedUrl {}

/// The two recognized segment URL shapes.
///
/// *Query*: the URL carries a `noclen` query parameter and the segment number
/// goes into the `sq` query parameter.
///
/// *Path*: the URL path starts with `/videoplayback/` and carries parameters
/// as `/key/value` pairs; the segment number is appended as a trailing path
/// element after an `sq` key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrlShape {
    Query,
    Path,
}

/// A classified segment URL. For the path shape, `raw` is normalized to end
/// with `/sq` (no value) so segment URLs are produced by plain appending.
#[derive(Debug, Clone)]
pub struct ParsedUrl {
    raw: String,
    id: String,
    itag: i32,
    expire: Option<DateTime<Utc>>,
    shape: UrlShape,
}

impl ParsedUrl {
    pub fn parse(raw_url: &str) -> Result<Self, MalformedUrl> {
        let parsed = Url::parse(raw_url)
            .map_err(|e| MalformedUrl(format!("invalid URL '{raw_url}': {e}")))?;

        let mut raw = raw_url.to_string();
        let shape;
        let fields: Vec<String>;

        let query_has_noclen = parsed
            .query_pairs()
            .any(|(k, v)| k == "noclen" && !v.is_empty());

        if query_has_noclen {
            shape = UrlShape::Query;
            fields = Vec::new();
        } else if parsed.path().starts_with("/videoplayback/") {
            shape = UrlShape::Path;
            if raw.ends_with('/') {
                raw.pop();
            }

            // "/videoplayback/k1/v1/k2/v2" -> ["k1", "v1", "k2", "v2"]
            fields = parsed
                .path()
                .split('/')
                .filter(|s| !s.is_empty())
                .skip(1)
                .map(str::to_string)
                .collect();

            let has_sq = fields.chunks(2).any(|c| c[0] == "sq");
            if has_sq {
                let val = path_field(&fields, "sq").unwrap_or_default();
                let suffix = format!("/sq/{val}");
                if !val.is_empty() && raw.ends_with(&suffix) {
                    // strip the sq value, keep the "/sq" key
                    raw.truncate(raw.len() - (val.len() + 1));
                } else if !raw.ends_with("/sq") {
                    return Err(MalformedUrl(
                        "URL has 'sq' parameter but it's not the last".into(),
                    ));
                }
            } else {
                raw.push_str("/sq");
            }
        } else {
            return Err(MalformedUrl(format!("unknown URL shape for '{raw_url}'")));
        }

        let find_field = |name: &str| -> Option<String> {
            match shape {
                UrlShape::Query => parsed
                    .query_pairs()
                    .find(|(k, _)| k == name)
                    .map(|(_, v)| v.into_owned()),
                UrlShape::Path => path_field(&fields, name),
            }
        };

        let mut id = find_field("id")
            .filter(|s| !s.is_empty())
            .ok_or_else(|| MalformedUrl("URL missing 'id' parameter".into()))?;
        if let Some(idx) = id.find('~').filter(|&i| i > 0) {
            id.truncate(idx);
        }

        let itag_string = find_field("itag")
            .filter(|s| !s.is_empty())
            .ok_or_else(|| MalformedUrl("URL missing 'itag' parameter".into()))?;
        let itag: i32 = itag_string.parse().map_err(|_| {
            MalformedUrl(format!("unable to parse itag value '{itag_string}' into an int"))
        })?;

        let expire = find_field("expire")
            .and_then(|s| s.parse::<i64>().ok())
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single());

        Ok(ParsedUrl {
            raw,
            id,
            itag,
            expire,
            shape,
        })
    }

    /// The URL for segment `seg`.
    pub fn segment_url(&self, seg: usize) -> String {
        match self.shape {
            UrlShape::Query => {
                // raw was validated by parse(); re-parsing cannot fail
                let mut url = Url::parse(&self.raw).expect("raw URL no longer parses");
                let pairs: Vec<(String, String)> = url
                    .query_pairs()
                    .filter(|(k, _)| k != "sq")
                    .map(|(k, v)| (k.into_owned(), v.into_owned()))
                    .collect();
                {
                    let mut q = url.query_pairs_mut();
                    q.clear();
                    for (k, v) in &pairs {
                        q.append_pair(k, v);
                    }
                    q.append_pair("sq", &seg.to_string());
                }
                url.to_string()
            }
            UrlShape::Path => format!("{}/{}", self.raw, seg),
        }
    }

    /// The URL without a segment number, used for the speculative request
    /// issued after a non-200 segment response.
    pub fn base_url(&self) -> &str {
        match self.shape {
            UrlShape::Query => &self.raw,
            UrlShape::Path => self.raw.strip_suffix("/sq").unwrap_or(&self.raw),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn itag(&self) -> i32 {
        self.itag
    }

    pub fn expire(&self) -> Option<DateTime<Utc>> {
        self.expire
    }

    /// `Some(true)` when the URL's expiry is already in the past; `None`
    /// when no expiry is carried at all.
    pub fn is_expired(&self) -> Option<bool> {
        self.expire.map(|e| e < Utc::now())
    }

    pub fn shape(&self) -> UrlShape {
        self.shape
    }
}

fn path_field(fields: &[String], name: &str) -> Option<String> {
    for pair in fields.chunks(2) {
        if pair[0] == name {
            // a trailing key with no value yields an empty string
            return Some(pair.get(1).cloned().unwrap_or_default());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const QUERY_URL: &str =
        "https://r4---sn-example.googlevideo.com/videoplayback?expire=1700000000&id=abc123~tail&itag=140&noclen=1&sq=42";

    #[test]
    fn query_shape_classified() {
        let p = ParsedUrl::parse(QUERY_URL).unwrap();
        assert_eq!(p.shape(), UrlShape::Query);
        assert_eq!(p.id(), "abc123");
        assert_eq!(p.itag(), 140);
        assert_eq!(p.expire().unwrap().timestamp(), 1_700_000_000);
    }

    #[test]
    fn query_shape_segment_url_replaces_sq() {
        let p = ParsedUrl::parse(QUERY_URL).unwrap();
        let u = p.segment_url(7);
        let parsed = Url::parse(&u).unwrap();
        let sq: Vec<String> = parsed
            .query_pairs()
            .filter(|(k, _)| k == "sq")
            .map(|(_, v)| v.into_owned())
            .collect();
        assert_eq!(sq, vec!["7"]);
        assert!(u.contains("noclen=1"));
    }

    #[test]
    fn path_shape_appends_sq() {
        let p =
            ParsedUrl::parse("https://example.com/videoplayback/id/xyz789/itag/299").unwrap();
        assert_eq!(p.shape(), UrlShape::Path);
        assert_eq!(p.segment_url(3), "https://example.com/videoplayback/id/xyz789/itag/299/sq/3");
    }

    #[test]
    fn path_shape_strips_existing_sq_value() {
        let p = ParsedUrl::parse("https://example.com/videoplayback/id/xyz789/itag/299/sq/15")
            .unwrap();
        assert_eq!(p.segment_url(0), "https://example.com/videoplayback/id/xyz789/itag/299/sq/0");
    }

    #[test]
    fn path_shape_trailing_slash_is_stripped() {
        let p =
            ParsedUrl::parse("https://example.com/videoplayback/id/xyz789/itag/299/").unwrap();
        assert_eq!(p.segment_url(1), "https://example.com/videoplayback/id/xyz789/itag/299/sq/1");
    }

    #[test]
    fn path_shape_sq_not_last_is_rejected() {
        let err =
            ParsedUrl::parse("https://example.com/videoplayback/sq/10/itag/299/id/xyz789")
                .unwrap_err();
        assert!(err.to_string().contains("not the last"));
    }

    #[test]
    fn id_truncated_at_tilde() {
        let p = ParsedUrl::parse("https://example.com/videoplayback/id/abc~def/itag/140").unwrap();
        assert_eq!(p.id(), "abc");
    }

    #[test]
    fn missing_id_or_itag_is_rejected() {
        let e = ParsedUrl::parse("https://example.com/videoplayback/itag/140").unwrap_err();
        assert!(e.to_string().contains("'id'"));
        let e = ParsedUrl::parse("https://example.com/videoplayback/id/abc").unwrap_err();
        assert!(e.to_string().contains("'itag'"));
    }

    #[test]
    fn non_integer_itag_is_rejected() {
        let e = ParsedUrl::parse("https://example.com/videoplayback/id/abc/itag/best").unwrap_err();
        assert!(e.to_string().contains("itag value"));
    }

    #[test]
    fn missing_expire_is_not_an_error() {
        let p = ParsedUrl::parse("https://example.com/videoplayback/id/abc/itag/140").unwrap();
        assert!(p.expire().is_none());
    }

    #[test]
    fn unknown_shape_is_rejected() {
        let e = ParsedUrl::parse("https://example.com/watch?v=abc").unwrap_err();
        assert!(e.to_string().contains("unknown URL shape"));
    }

    #[test]
    fn base_url_has_no_sq_suffix() {
        let p = ParsedUrl::parse("https://example.com/videoplayback/id/abc/itag/140/sq/3").unwrap();
        assert_eq!(p.base_url(), "https://example.com/videoplayback/id/abc/itag/140");
    }
}
