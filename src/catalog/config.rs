use once_cell::sync::Lazy;
use std::env;

/// Base URL of the catalog service, `None` selects the built-in demo catalog.
pub static CATALOG_ROOT: Lazy<Option<String>> = Lazy::new(|| {
    env::var("CATALOG_URL")
        .ok()
        .map(|url| url.trim().trim_end_matches('/').to_string())
        .filter(|url| !url.is_empty())
});

pub static CATALOG_API_KEY: Lazy<Option<String>> = Lazy::new(|| {
    env::var("CATALOG_API_KEY")
        .ok()
        .filter(|key| !key.trim().is_empty())
});
