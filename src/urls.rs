// src/urls.rs

use std::io;
use std::path::Path;

/// Used when no URL list file exists.
pub const FALLBACK_URLS: [&str; 3] = [
    "https://httpbin.org/bytes/102400",
    "https://httpbin.org/bytes/1048576",
    "https://httpbin.org/bytes/5242880",
];

/// Parses a newline-delimited URL list. Blank lines and `#` comments are skipped;
/// order and duplicates are kept.
pub fn parse_url_list(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(String::from)
        .collect()
}

/// Loads the URL list from `path`, falling back to the built-in list if the file is absent.
pub async fn load_urls(path: &Path) -> io::Result<Vec<String>> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => {
            let urls = parse_url_list(&text);
            tracing::info!("loaded {} URLs from {}", urls.len(), path.display());
            Ok(urls)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            tracing::info!(
                "{} not found, using {} built-in test URLs",
                path.display(),
                FALLBACK_URLS.len()
            );
            Ok(FALLBACK_URLS.iter().map(|url| url.to_string()).collect())
        }
        Err(e) => Err(e),
    }
}
