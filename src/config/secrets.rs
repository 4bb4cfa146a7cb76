//! Secret handling utilities.
//!
//! Re-exports the secrecy types used for connection strings, so callers
//! need not depend on secrecy directly.

pub use secrecy::{ExposeSecret, SecretString};

/// Connection string with any password replaced, for logging.
pub fn redact_url(url: &SecretString) -> String {
    let raw = url.expose_secret();
    let Some((scheme, rest)) = raw.split_once("://") else {
        return "<redacted>".to_string();
    };
    match rest.rsplit_once('@') {
        Some((userinfo, host)) => {
            let user = userinfo.split(':').next().unwrap_or_default();
            format!("{scheme}://{user}:***@{host}")
        }
        None => format!("{scheme}://{rest}"),
    }
}
