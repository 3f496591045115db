//! URL path templates containing named `<placeholder>` segments.
//!
//! A template such as `/environment/<id>/resource/<rid>` is parsed once when a
//! contract is registered. Clients fill it with [`UrlPath::generate_path`];
//! servers route with the regex from [`UrlPath::generate_regex_path`].

use lazy_static::lazy_static;
use regex::Regex;
use std::collections::BTreeMap;
use thiserror::Error;

lazy_static! {
    static ref PLACEHOLDER: Regex = Regex::new(r"<([A-Za-z_][A-Za-z0-9_]*)>").expect("static regex");
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PathError {
    #[error("no value provided for path parameter <{0}>")]
    Unbound(String),
}

/// A parsed path template.
#[derive(Debug, Clone)]
pub struct UrlPath {
    path: String,
    vars: Vec<String>,
    matcher: Regex,
}

impl UrlPath {
    pub fn new(path: &str) -> Self {
        let mut vars: Vec<String> = Vec::new();
        for cap in PLACEHOLDER.captures_iter(path) {
            let name = cap[1].to_string();
            if !vars.contains(&name) {
                vars.push(name);
            }
        }
        let regex_path = Self::regex_for(path);
        let matcher = Regex::new(&format!("^{}$", regex_path)).expect("escaped template");
        Self {
            path: path.to_string(),
            vars,
            matcher,
        }
    }

    /// The raw template.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Placeholder names in order of first appearance.
    pub fn vars(&self) -> &[String] {
        &self.vars
    }

    pub fn has_var(&self, name: &str) -> bool {
        self.vars.iter().any(|v| v == name)
    }

    /// Substitute percent-encoded values into the template.
    pub fn generate_path(&self, values: &BTreeMap<String, String>) -> Result<String, PathError> {
        let mut out = String::with_capacity(self.path.len());
        let mut last = 0;
        for cap in PLACEHOLDER.captures_iter(&self.path) {
            let Some(whole) = cap.get(0) else { continue };
            let name = &cap[1];
            let value = values
                .get(name)
                .ok_or_else(|| PathError::Unbound(name.to_string()))?;
            out.push_str(&self.path[last..whole.start()]);
            out.push_str(&urlencoding::encode(value));
            last = whole.end();
        }
        out.push_str(&self.path[last..]);
        Ok(out)
    }

    /// The template with every placeholder replaced by a named capture group.
    pub fn generate_regex_path(&self) -> String {
        Self::regex_for(&self.path)
    }

    /// Match a concrete path (query string ignored) and return the decoded
    /// placeholder values.
    pub fn match_path(&self, url: &str) -> Option<BTreeMap<String, String>> {
        let path = url.split('?').next().unwrap_or(url);
        let caps = self.matcher.captures(path)?;
        let mut out = BTreeMap::new();
        for name in &self.vars {
            let raw = caps.name(name)?.as_str();
            let value = urlencoding::decode(raw).ok()?.into_owned();
            out.insert(name.clone(), value);
        }
        Some(out)
    }

    fn regex_for(path: &str) -> String {
        let mut out = String::new();
        let mut last = 0;
        let mut seen: Vec<&str> = Vec::new();
        for cap in PLACEHOLDER.captures_iter(path) {
            let Some(whole) = cap.get(0) else { continue };
            out.push_str(&regex::escape(&path[last..whole.start()]));
            let name = cap.get(1).map_or("", |m| m.as_str());
            // a repeated placeholder matches anything, the first one captures
            if seen.contains(&name) {
                out.push_str("[^/]+");
            } else {
                out.push_str(&format!("(?P<{name}>[^/]+)"));
                seen.push(name);
            }
            last = whole.end();
        }
        out.push_str(&regex::escape(&path[last..]));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_extracts_placeholders_once() {
        let p = UrlPath::new("/env/<id>/resource/<rid>/<id>");
        assert_eq!(p.vars(), &["id".to_string(), "rid".to_string()]);
        assert!(p.has_var("rid"));
        assert!(!p.has_var("other"));
    }

    #[test]
    fn test_generate_path_encodes_values() {
        let p = UrlPath::new("/resource/<rid>");
        let url = p
            .generate_path(&values(&[("rid", "std::File[host,path=/etc/motd]")]))
            .unwrap();
        assert_eq!(url, "/resource/std%3A%3AFile%5Bhost%2Cpath%3D%2Fetc%2Fmotd%5D");
    }

    #[test]
    fn test_generate_path_is_idempotent() {
        let p = UrlPath::new("/project/<id>");
        let v = values(&[("id", "a b")]);
        assert_eq!(p.generate_path(&v).unwrap(), p.generate_path(&v).unwrap());
    }

    #[test]
    fn test_generate_path_unbound() {
        let p = UrlPath::new("/project/<id>");
        assert_eq!(
            p.generate_path(&BTreeMap::new()),
            Err(PathError::Unbound("id".to_string()))
        );
    }

    #[test]
    fn test_regex_path() {
        let p = UrlPath::new("/file/<id>");
        assert_eq!(p.generate_regex_path(), r"/file/(?P<id>[^/]+)");
    }

    #[test]
    fn test_match_recovers_values() {
        let p = UrlPath::new("/env/<tid>/param/<name>");
        let v = values(&[("tid", "1234"), ("name", "x/y z")]);
        let url = p.generate_path(&v).unwrap();
        assert_eq!(p.match_path(&format!("{url}?limit=5")), Some(v));
        assert_eq!(p.match_path("/env/1234"), None);
    }

    #[test]
    fn test_repeated_placeholder_captures_first() {
        let p = UrlPath::new("/env/<id>/copy/<id>");
        assert_eq!(p.match_path("/env/1/copy/2"), Some(values(&[("id", "1")])));
    }
}
