//! Small helpers shared by the admission path and framework adapters.

use std::borrow::Cow;

use url::form_urlencoded;

/// Sorts the query-string parameters of a path (or URL suffix) by key.
///
/// Request paths arrive with query parameters in whatever order the caller's
/// HTTP client produced; sorting them gives equivalent requests an identical
/// aggregation key. The sort is stable, so repeated parameters keep their
/// relative order, and the operation is idempotent:
/// `sort_query_string(sort_query_string(x)) == sort_query_string(x)`.
///
/// Inputs without a `?` are returned unchanged.
pub fn sort_query_string(path: &str) -> String {
    let Some((prefix, query)) = path.split_once('?') else {
        return path.to_string();
    };
    if query.is_empty() {
        return prefix.to_string();
    }

    let mut pairs: Vec<(Cow<'_, str>, Cow<'_, str>)> =
        form_urlencoded::parse(query.as_bytes()).collect();
    pairs.sort_by(|a, b| a.0.cmp(&b.0));

    let mut serializer = form_urlencoded::Serializer::new(String::new());
    for (key, value) in &pairs {
        serializer.append_pair(key, value);
    }
    format!("{prefix}?{}", serializer.finish())
}
