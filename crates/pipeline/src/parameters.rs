//! Query parameters and request cookies.

use http::HeaderMap;
use http::header::COOKIE;
use serde::de::DeserializeOwned;
use tracing::debug;

/// Ordered multi-map of query parameters.
///
/// Repeated names keep every value, in the order they appear.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Parameters {
    query: String,
    entries: Vec<(String, String)>,
}

impl Parameters {
    /// Parses `query` as `application/x-www-form-urlencoded`, percent-decoding names and values.
    pub fn parse_decoded(query: &str) -> Self {
        let entries = serde_urlencoded::from_str::<Vec<(String, String)>>(query).unwrap_or_else(|e| {
            debug!(cause = %e, "malformed query string, ignoring it");
            Vec::new()
        });
        Self { query: query.to_owned(), entries }
    }

    /// Splits `query` without decoding anything.
    pub fn parse_raw(query: &str) -> Self {
        let entries = query
            .split('&')
            .filter(|pair| !pair.is_empty())
            .map(|pair| match pair.split_once('=') {
                Some((name, value)) => (name.to_owned(), value.to_owned()),
                None => (pair.to_owned(), String::new()),
            })
            .collect();
        Self { query: query.to_owned(), entries }
    }

    /// First value of `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries.iter().filter(move |(n, _)| n == name).map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Deserializes the whole query string into `T`.
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T, serde_urlencoded::de::Error> {
        serde_urlencoded::from_str(&self.query)
    }
}

/// Cookies sent with the request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestCookies {
    cookies: Vec<(String, String)>,
}

impl RequestCookies {
    /// Collects the cookies of every `Cookie` header.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let cookies = headers
            .get_all(COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(';'))
            .filter_map(|pair| {
                let (name, value) = pair.trim().split_once('=')?;
                let name = name.trim();
                if name.is_empty() {
                    return None;
                }
                let value = value.trim();
                let value = value.strip_prefix('"').and_then(|v| v.strip_suffix('"')).unwrap_or(value);
                Some((name.to_owned(), value.to_owned()))
            })
            .collect();
        Self { cookies }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.cookies.iter().find(|(n, _)| n == name).map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.cookies.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.cookies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;
    use serde::Deserialize;

    #[test]
    fn decoded_and_raw_views_differ() {
        let query = "name=a%20b&tag=x&tag=y+z&flag";

        let decoded = Parameters::parse_decoded(query);
        assert_eq!(decoded.get("name"), Some("a b"));
        assert_eq!(decoded.get_all("tag").collect::<Vec<_>>(), vec!["x", "y z"]);
        assert_eq!(decoded.get("flag"), Some(""));

        let raw = Parameters::parse_raw(query);
        assert_eq!(raw.get("name"), Some("a%20b"));
        assert_eq!(raw.get_all("tag").collect::<Vec<_>>(), vec!["x", "y+z"]);
        assert_eq!(raw.len(), 4);
    }

    #[test]
    fn empty_query_has_no_parameters() {
        assert!(Parameters::parse_decoded("").is_empty());
        assert!(Parameters::parse_raw("&&").is_empty());
    }

    #[test]
    fn deserializes_into_struct() {
        #[derive(Deserialize)]
        struct Page {
            offset: u32,
            limit: u32,
        }

        let page: Page = Parameters::parse_decoded("offset=20&limit=10").deserialize().unwrap();
        assert_eq!((page.offset, page.limit), (20, 10));
    }

    #[test]
    fn parses_cookies_from_every_header() {
        let mut headers = HeaderMap::new();
        headers.append(COOKIE, HeaderValue::from_static("session=abc; theme=\"dark\""));
        headers.append(COOKIE, HeaderValue::from_static("lang=en;; =broken; novalue"));

        let cookies = RequestCookies::from_headers(&headers);
        assert_eq!(cookies.len(), 3);
        assert_eq!(cookies.get("session"), Some("abc"));
        assert_eq!(cookies.get("theme"), Some("dark"));
        assert_eq!(cookies.get("lang"), Some("en"));
        assert_eq!(cookies.get("novalue"), None);
    }
}
