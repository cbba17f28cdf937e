//! User-Agent string sent with every upstream request.

/// Project URL for User-Agent identification (RFC 9308).
const PROJECT_UA_URL: &str = "https://github.com/fierce/climate-extract";

/// Default User-Agent for API requests (identifies the tool and its version).
#[must_use]
pub(crate) fn default_user_agent() -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!("climate-extract/{version} (weather-data-extractor; +{PROJECT_UA_URL})")
}
