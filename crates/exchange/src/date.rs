//! Cached `Date` header value, re-rendered at most once per second.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use arc_swap::ArcSwap;
use bytes::Bytes;
use http::HeaderValue;
use once_cell::sync::Lazy;

struct RenderedDate {
    second: u64,
    value: HeaderValue,
}

static CURRENT: Lazy<ArcSwap<RenderedDate>> = Lazy::new(|| ArcSwap::from_pointee(render(now_secs())));

fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |elapsed| elapsed.as_secs())
}

fn render(second: u64) -> RenderedDate {
    let mut buf = faf_http_date::get_date_buff_no_key();
    faf_http_date::get_date_no_key(&mut buf);
    let value = HeaderValue::from_maybe_shared(Bytes::from_owner(buf)).unwrap_or(HeaderValue::from_static(""));
    RenderedDate { second, value }
}

/// The current date as an IMF-fixdate header value.
pub(crate) fn http_date() -> HeaderValue {
    let second = now_secs();
    let cached = CURRENT.load();
    if cached.second == second {
        return cached.value.clone();
    }

    let fresh = Arc::new(render(second));
    let value = fresh.value.clone();
    CURRENT.store(fresh);
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_imf_fixdate() {
        let value = http_date();
        let text = value.to_str().unwrap();
        assert!(text.ends_with("GMT"));
    }
}
