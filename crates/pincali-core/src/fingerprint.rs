use url::Url;

/// Prefix stamped onto every generated property id.
const ID_PREFIX: &str = "pincali_";

/// Number of hex characters kept from the digest.
const ID_HASH_LEN: usize = 16;

/// Normalize a URL for hashing: lowercase scheme/host/path, strip the trailing
/// slash, drop query and fragment. Unparseable input falls back to lowercasing
/// the raw string and cutting everything after `?` or `#`.
pub fn normalize_url(source_url: &str) -> String {
    if source_url.is_empty() {
        return String::new();
    }

    match Url::parse(source_url) {
        Ok(parsed) if parsed.has_host() => {
            let scheme = parsed.scheme().to_lowercase();
            let host = parsed.host_str().unwrap_or_default().to_lowercase();
            let path = parsed.path().to_lowercase();
            let path = path.trim_end_matches('/');
            match parsed.port() {
                Some(port) => format!("{}://{}:{}{}", scheme, host, port, path),
                None => format!("{}://{}{}", scheme, host, path),
            }
        }
        _ => source_url
            .to_lowercase()
            .split(['?', '#'])
            .next()
            .unwrap_or_default()
            .trim_end_matches('/')
            .to_string(),
    }
}

/// Generate a deterministic property id from a source URL.
///
/// This is the single source of truth for property ids: the scanner, the diff
/// detector and the detail scraper all have to agree on it, so nothing else in
/// the codebase may derive an id from price, title or page position.
///
/// Format: `pincali_{md5(normalized_url)[..16]}`. Total: empty input hashes
/// the literal string `empty`.
pub fn property_id(source_url: &str) -> String {
    let digest = if source_url.is_empty() {
        md5::compute("empty")
    } else {
        md5::compute(normalize_url(source_url))
    };
    let hex = format!("{:x}", digest);
    format!("{}{}", ID_PREFIX, &hex[..ID_HASH_LEN])
}
