use std::net::IpAddr;
use thiserror::Error;
use url::Url;

/// Errors that can occur while validating the API base URL.
#[derive(Error, Debug)]
pub enum UrlValidationError {
    /// The URL string could not be parsed.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    /// The URL uses a scheme other than http or https.
    #[error("Unsupported scheme: {0} (only http/https allowed)")]
    UnsupportedScheme(String),
    /// Plain HTTP to anything but the local machine would leak credentials.
    #[error("HTTPS required for {0} (plain HTTP is only allowed for localhost)")]
    Insecure(String),
    /// The URL cannot carry path segments (e.g. `mailto:`-style URLs).
    #[error("URL cannot be used as an API base: {0}")]
    NotABase(String),
}

/// Validates the base URL every API request is built from.
///
/// Bearer tokens are attached to each request, so the base must be HTTPS.
/// Plain HTTP is accepted only for `localhost` and loopback addresses, which
/// is what mock servers in tests listen on. Query and fragment are dropped.
///
/// # Examples
///
/// ```
/// use rebuttal::util::validate_base_url;
///
/// assert!(validate_base_url("https://api.example.com/v1").is_ok());
/// assert!(validate_base_url("http://127.0.0.1:8080").is_ok());
/// assert!(validate_base_url("http://api.example.com").is_err());
/// assert!(validate_base_url("file:///etc/passwd").is_err());
/// ```
pub fn validate_base_url(url_str: &str) -> Result<Url, UrlValidationError> {
    let mut url = Url::parse(url_str.trim())?;

    match url.scheme() {
        "https" => {}
        "http" => {
            if !is_local_host(&url) {
                return Err(UrlValidationError::Insecure(
                    url.host_str().unwrap_or_default().to_string(),
                ));
            }
        }
        scheme => return Err(UrlValidationError::UnsupportedScheme(scheme.to_owned())),
    }

    if url.cannot_be_a_base() || url.host_str().is_none() {
        return Err(UrlValidationError::NotABase(url_str.to_string()));
    }

    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

fn is_local_host(url: &Url) -> bool {
    let Some(host) = url.host_str() else {
        return false;
    };
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    let bare = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    bare.parse::<IpAddr>().is_ok_and(|ip| ip.is_loopback())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_https_accepted() {
        let url = validate_base_url("https://api.example.com/v1").unwrap();
        assert_eq!(url.host_str(), Some("api.example.com"));
        assert_eq!(url.path(), "/v1");
    }

    #[test]
    fn test_http_rejected_for_remote_hosts() {
        assert!(matches!(
            validate_base_url("http://api.example.com"),
            Err(UrlValidationError::Insecure(_))
        ));
        assert!(validate_base_url("http://192.168.1.1/api").is_err());
    }

    #[test]
    fn test_http_allowed_for_loopback() {
        assert!(validate_base_url("http://localhost:3000").is_ok());
        assert!(validate_base_url("http://127.0.0.1:8080/v1").is_ok());
        assert!(validate_base_url("http://[::1]:8080").is_ok());
    }

    #[test]
    fn test_other_schemes_rejected() {
        assert!(matches!(
            validate_base_url("ftp://example.com"),
            Err(UrlValidationError::UnsupportedScheme(_))
        ));
        assert!(validate_base_url("not a url").is_err());
    }

    #[test]
    fn test_query_and_fragment_dropped() {
        let url = validate_base_url("https://api.example.com/v1?debug=1#x").unwrap();
        assert_eq!(url.as_str(), "https://api.example.com/v1");
    }
}
