//! Query string parsing for `?k=v&k2=v2` suffixes.

use std::collections::HashMap;

use crate::routing::RoutingError;

fn split_pair(pair: &str) -> Option<(&str, &str)> {
    match pair.split_once('=') {
        Some((key, value)) if !key.is_empty() && !value.contains('=') => Some((key, value)),
        _ => None,
    }
}

/// Parse a raw query string (without the leading `?`) into flat pairs.
///
/// Keys and values are percent-decoded. A later duplicate key wins.
pub fn parse_query(raw: &str) -> Result<HashMap<String, String>, RoutingError> {
    let mut params = HashMap::new();
    if raw.is_empty() {
        return Ok(params);
    }

    for pair in raw.split('&') {
        if split_pair(pair).is_none() {
            return Err(RoutingError::MalformedQuery {
                pair: pair.to_string(),
            });
        }
        if let Some((key, value)) = url::form_urlencoded::parse(pair.as_bytes()).next() {
            params.insert(key.into_owned(), value.into_owned());
        }
    }

    Ok(params)
}

/// Same acceptance rule as [`parse_query`] without building the map.
pub fn is_well_formed(raw: &str) -> bool {
    raw.is_empty() || raw.split('&').all(|pair| split_pair(pair).is_some())
}
