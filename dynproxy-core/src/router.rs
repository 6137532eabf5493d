//! Per-upstream HTTP route table: maps (method, compiled path template) ->
//! an arbitrary extra payload (in practice, a `MethodDescriptor`).

use std::collections::{BTreeMap, HashMap};
use std::sync::LazyLock;

use regex::Regex;

use crate::error::Result;
use crate::pathtemplate::PathTemplate;

/// How the raw path is split into components before matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnescapeMode {
    /// Split on literal `/` only.
    Default,
    /// Also split on the percent-encoded separator `%2F`.
    AllCharacters,
}

static ALL_CHARS_SPLIT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/|%2[fF]").expect("split regex is valid"));

struct RouteEntry<T> {
    pattern: PathTemplate,
    extra: T,
}

/// Mapping from HTTP method to an ordered list of route entries.
pub struct Router<T> {
    mode: UnescapeMode,
    routes: HashMap<String, Vec<RouteEntry<T>>>,
}

impl<T: Clone> Default for Router<T> {
    fn default() -> Self {
        Self::new(UnescapeMode::Default)
    }
}

impl<T: Clone> Router<T> {
    pub fn new(mode: UnescapeMode) -> Self {
        Router {
            mode,
            routes: HashMap::new(),
        }
    }

    /// Compiles `template` and appends a route entry under `method`.
    /// On compile failure, returns the error and adds nothing.
    pub fn add(&mut self, method: &http::Method, template: &str, extra: T) -> Result<()> {
        let pattern = PathTemplate::parse(template)?;
        self.routes
            .entry(method.as_str().to_string())
            .or_default()
            .push(RouteEntry { pattern, extra });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.routes.values().map(|v| v.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Matches `(method, path)` against the table, trying patterns in
    /// insertion order and returning the first hit's captured params and
    /// extra payload.
    pub fn matches(&self, method: &http::Method, path: &str) -> Option<(BTreeMap<String, String>, T)> {
        if !path.starts_with('/') {
            return None;
        }
        let body = &path[1..];
        let components: Vec<&str> = match self.mode {
            UnescapeMode::Default => body.split('/').collect(),
            UnescapeMode::AllCharacters => ALL_CHARS_SPLIT.split(body).collect(),
        };
        let entries = self.routes.get(method.as_str())?;
        let last = *components.last()?;

        for entry in entries {
            let pattern_verb = entry.pattern.verb().unwrap_or("");

            if pattern_verb.is_empty() {
                if let Some(caps) = entry.pattern.matches(&components) {
                    return Some((caps, entry.extra.clone()));
                }
                continue;
            }

            let suffix = format!(":{pattern_verb}");
            if !last.ends_with(suffix.as_str()) {
                continue;
            }
            let idx = last.len() - suffix.len();
            if idx == 0 {
                // Whole last segment is just the verb: abort the entire
                // match, not only this candidate. Matches the reference
                // matcher's compatibility quirk.
                return None;
            }

            let mut comps = components.clone();
            let head = &last[..idx];
            comps[comps.len() - 1] = head;

            if let Some(caps) = entry.pattern.matches(&comps) {
                return Some((caps, entry.extra.clone()));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_plain_route() {
        let mut r: Router<&str> = Router::new(UnescapeMode::Default);
        r.add(&http::Method::GET, "/v1/greeter/{name}", "sayhello").unwrap();
        let (caps, extra) = r.matches(&http::Method::GET, "/v1/greeter/bob").unwrap();
        assert_eq!(caps.get("name").unwrap(), "bob");
        assert_eq!(extra, "sayhello");
    }

    #[test]
    fn first_hit_wins_in_insertion_order() {
        let mut r: Router<&str> = Router::new(UnescapeMode::Default);
        r.add(&http::Method::GET, "/v1/{name}", "first").unwrap();
        r.add(&http::Method::GET, "/v1/{id}", "second").unwrap();
        let (_, extra) = r.matches(&http::Method::GET, "/v1/42").unwrap();
        assert_eq!(extra, "first");
    }

    #[test]
    fn verb_peeling() {
        let mut r: Router<&str> = Router::new(UnescapeMode::Default);
        r.add(&http::Method::POST, "/v1/{name=messages/*}:undelete", "undel")
            .unwrap();
        let (caps, _) = r
            .matches(&http::Method::POST, "/v1/messages/42:undelete")
            .unwrap();
        assert_eq!(caps.get("name").unwrap(), "messages/42");
    }

    #[test]
    fn verb_at_index_zero_aborts_whole_match() {
        let mut r: Router<&str> = Router::new(UnescapeMode::Default);
        r.add(&http::Method::POST, "/v1/{x}:verb", "only").unwrap();
        // Last component is exactly ":verb" with nothing before the colon.
        assert!(r.matches(&http::Method::POST, "/v1/:verb").is_none());
    }

    #[test]
    fn non_ascii_last_segment_does_not_panic_on_verb_check() {
        let mut r: Router<&str> = Router::new(UnescapeMode::Default);
        r.add(&http::Method::POST, "/v1/{x}:xy", "only").unwrap();
        // The multi-byte 'é' sits exactly where a byte-offset suffix slice
        // would land mid-character; this must miss cleanly, not panic.
        assert!(r.matches(&http::Method::POST, "/v1/aébc").is_none());
    }

    #[test]
    fn path_without_leading_slash_misses() {
        let mut r: Router<&str> = Router::new(UnescapeMode::Default);
        r.add(&http::Method::GET, "/v1/{name}", "x").unwrap();
        assert!(r.matches(&http::Method::GET, "v1/bob").is_none());
    }

    #[test]
    fn all_characters_mode_splits_encoded_slash() {
        let mut r: Router<&str> = Router::new(UnescapeMode::AllCharacters);
        r.add(&http::Method::GET, "/v1/{a}/{b}", "x").unwrap();
        let (caps, _) = r.matches(&http::Method::GET, "/v1/foo%2Fbar/baz").unwrap();
        assert_eq!(caps.get("a").unwrap(), "foo");
        assert_eq!(caps.get("b").unwrap(), "baz");
    }

    #[test]
    fn no_route_for_method_misses() {
        let mut r: Router<&str> = Router::new(UnescapeMode::Default);
        r.add(&http::Method::GET, "/v1/{name}", "x").unwrap();
        assert!(r.matches(&http::Method::POST, "/v1/bob").is_none());
    }
}
