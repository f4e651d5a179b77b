use http::HeaderMap;
use http::header::{self, HeaderValue};
use std::collections::HashMap;
use tracing::debug;

/// Content codings accepted by a client, with their quality values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Codings(HashMap<String, f32>);

impl Codings {
    /// Quality of a lowercased coding, if the client listed it.
    pub fn quality(&self, coding: &str) -> Option<f32> {
        self.0.get(coding).copied()
    }

    /// Returns whether gzip is acceptable.
    ///
    /// An explicit `gzip` (or its `x-gzip` alias) entry wins; otherwise the
    /// `*` wildcard decides. Quality zero means "not acceptable".
    pub fn accepts_gzip(&self) -> bool {
        self.quality("gzip")
            .or_else(|| self.quality("x-gzip"))
            .or_else(|| self.quality("*"))
            .is_some_and(|q| q > 0.0)
    }

    /// Number of listed codings.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns whether no codings were listed.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Extend<(String, f32)> for Codings {
    fn extend<I: IntoIterator<Item = (String, f32)>>(&mut self, iter: I) {
        self.0.extend(iter);
    }
}

/// Parses an Accept-Encoding value like `gzip;q=1.0, identity; q=0.5, *;q=0`.
///
/// Codings are lowercased and qualities clamped to `[0, 1]`. Entries with an
/// empty coding or an unparseable quality are skipped.
pub fn parse_encodings(header: &str) -> Codings {
    let mut codings = Codings::default();
    codings.extend(header.split(',').filter_map(parse_coding));
    codings
}

/// Returns whether any Accept-Encoding line of `headers` accepts gzip.
pub(crate) fn accepts_gzip(headers: &HeaderMap) -> bool {
    let mut codings = Codings::default();
    for value in headers.get_all(header::ACCEPT_ENCODING) {
        if let Ok(value) = value.to_str() {
            codings.extend(parse_encodings(value).0);
        }
    }
    codings.accepts_gzip()
}

/// Adds Accept-Encoding to the Vary header if not already present.
pub(crate) fn add_vary_accept_encoding(headers: &mut HeaderMap) {
    for vary in headers.get_all(header::VARY) {
        if let Ok(vary_str) = vary.to_str() {
            let covered = vary_str.split(',').any(|v| {
                let v = v.trim();
                v == "*" || v.eq_ignore_ascii_case("accept-encoding")
            });
            if covered {
                return;
            }
        }
    }

    headers.append(header::VARY, HeaderValue::from_static("Accept-Encoding"));
}

fn parse_coding(part: &str) -> Option<(String, f32)> {
    let mut params = part.split(';');
    let coding = params.next().unwrap_or_default().trim().to_ascii_lowercase();
    if coding.is_empty() {
        return None;
    }

    let mut quality = 1.0;
    for param in params {
        let param = param.trim();
        let Some(value) = param.strip_prefix("q=").or_else(|| param.strip_prefix("Q=")) else {
            continue;
        };
        match value.trim().parse::<f32>() {
            Ok(q) if q.is_finite() => quality = q.clamp(0.0, 1.0),
            _ => {
                debug!(coding = %coding, quality = %value, "skipping coding with invalid quality");
                return None;
            }
        }
    }

    Some((coding, quality))
}
