//! Parse HTTP response header lines collected by libcurl.

use std::collections::HashMap;

/// Headers of the final response hop, with the fields resume and chunking care
/// about pre-parsed.
#[derive(Debug, Clone, Default)]
pub(crate) struct HeaderInfo {
    pub all: HashMap<String, String>,
    pub content_length: Option<u64>,
    pub accept_ranges: bool,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl HeaderInfo {
    /// Best available resume validator: ETag, else Last-Modified.
    pub fn validator(&self) -> Option<String> {
        self.etag.clone().or_else(|| self.last_modified.clone())
    }
}

/// Parse collected header lines. A new status line (`HTTP/...`) resets the
/// accumulated state so redirect hops don't leak headers into the final
/// response.
pub(crate) fn parse_header_lines(lines: &[String]) -> HeaderInfo {
    let mut info = HeaderInfo::default();

    for line in lines {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line.to_ascii_uppercase().starts_with("HTTP/") {
            info = HeaderInfo::default();
            continue;
        }
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim();
        let value = value.trim();
        if name.eq_ignore_ascii_case("content-length") {
            info.content_length = value.parse::<u64>().ok();
        }
        if name.eq_ignore_ascii_case("accept-ranges") {
            info.accept_ranges = value.eq_ignore_ascii_case("bytes");
        }
        if name.eq_ignore_ascii_case("etag") {
            info.etag = Some(value.trim_matches('"').to_string());
        }
        if name.eq_ignore_ascii_case("last-modified") {
            info.last_modified = Some(value.to_string());
        }
        info.all.insert(name.to_ascii_lowercase(), value.to_string());
    }

    info
}
