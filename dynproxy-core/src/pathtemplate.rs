//! Compiles `google.api.http` path templates and matches them against
//! inbound path components.
//!
//! Grammar (the subset grpc-gateway rules actually use):
//!
//! ```text
//! Template = "/" Segments [ ":" Verb ] ;
//! Segments = Segment { "/" Segment } ;
//! Segment  = "*" | "**" | LITERAL | "{" FieldPath [ "=" Segments ] "}" ;
//! FieldPath = IDENT { "." IDENT } ;
//! ```

use std::collections::BTreeMap;

use crate::error::{ProxyError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Atom {
    Lit(String),
    Star,
    DoubleStar,
    FieldStart(Vec<String>),
    FieldEnd,
}

/// A compiled `google.api.http` path template.
///
/// Named to mirror the "opcode sequence over a string pool" data model:
/// `atoms` plays the role of the opcode sequence, interned strings living
/// directly on each atom rather than in a separate pool.
#[derive(Debug, Clone)]
pub struct PathTemplate {
    version: u8,
    atoms: Vec<Atom>,
    verb: Option<String>,
    field_paths: Vec<String>,
    template: String,
}

impl PartialEq for PathTemplate {
    fn eq(&self, other: &Self) -> bool {
        self.template == other.template
    }
}

impl PathTemplate {
    /// Current compiled-representation version. Bumped if the atom shape
    /// changes in a way that would affect serialized/cached patterns.
    const VERSION: u8 = 1;

    pub fn parse(template: &str) -> Result<Self> {
        let (body, verb) = split_verb(template);
        if !body.starts_with('/') {
            return Err(ProxyError::RouteCompile(format!(
                "path template must start with '/': {template}"
            )));
        }
        let top_segments = parse_segments(&body[1..])?;
        let mut atoms = Vec::new();
        let mut field_paths = Vec::new();
        flatten(&top_segments, &mut atoms, &mut field_paths)?;
        Ok(PathTemplate {
            version: Self::VERSION,
            atoms,
            verb,
            field_paths,
            template: template.to_string(),
        })
    }

    pub fn verb(&self) -> Option<&str> {
        self.verb.as_deref()
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn field_paths(&self) -> &[String] {
        &self.field_paths
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    /// Matches `comps` (already verb-peeled by the caller) against this
    /// template, returning the captured `field-path -> value` map on success.
    pub fn matches(&self, comps: &[&str]) -> Option<BTreeMap<String, String>> {
        let caps = try_match(&self.atoms, 0, comps, 0, Vec::new())?;
        let mut map = BTreeMap::new();
        for (path, val) in caps {
            map.insert(path.join("."), val);
        }
        Some(map)
    }
}

fn split_verb(template: &str) -> (String, Option<String>) {
    let mut depth = 0i32;
    let mut last_colon = None;
    for (i, c) in template.char_indices() {
        match c {
            '{' => depth += 1,
            '}' => depth -= 1,
            ':' if depth == 0 => last_colon = Some(i),
            _ => {}
        }
    }
    match last_colon {
        Some(i) => (template[..i].to_string(), Some(template[i + 1..].to_string())),
        None => (template.to_string(), None),
    }
}

#[derive(Debug, Clone)]
enum Segment {
    Literal(String),
    SingleGlob,
    DoubleGlob,
    Variable {
        field_path: Vec<String>,
        pattern: Vec<Segment>,
    },
}

fn split_top_level(s: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut depth = 0i32;
    let mut start = 0usize;
    for (i, c) in s.char_indices() {
        match c {
            '{' => depth += 1,
            '}' => depth -= 1,
            '/' if depth == 0 => {
                out.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    out.push(&s[start..]);
    out
}

fn parse_segments(s: &str) -> Result<Vec<Segment>> {
    split_top_level(s).into_iter().map(parse_segment).collect()
}

fn parse_segment(token: &str) -> Result<Segment> {
    if token == "*" {
        return Ok(Segment::SingleGlob);
    }
    if token == "**" {
        return Ok(Segment::DoubleGlob);
    }
    if let Some(inner) = token.strip_prefix('{').and_then(|t| t.strip_suffix('}')) {
        let (field_part, pattern_part) = match inner.find('=') {
            Some(i) => (&inner[..i], Some(&inner[i + 1..])),
            None => (inner, None),
        };
        if field_part.is_empty() {
            return Err(ProxyError::RouteCompile(format!(
                "empty field path in variable: {token}"
            )));
        }
        let field_path: Vec<String> = field_part.split('.').map(String::from).collect();
        let pattern = match pattern_part {
            Some(p) => parse_segments(p)?,
            None => vec![Segment::SingleGlob],
        };
        return Ok(Segment::Variable { field_path, pattern });
    }
    if token.is_empty() {
        return Err(ProxyError::RouteCompile(
            "empty literal segment in path template".to_string(),
        ));
    }
    Ok(Segment::Literal(token.to_string()))
}

fn flatten(segments: &[Segment], atoms: &mut Vec<Atom>, field_paths: &mut Vec<String>) -> Result<()> {
    for seg in segments {
        match seg {
            Segment::Literal(s) => atoms.push(Atom::Lit(s.clone())),
            Segment::SingleGlob => atoms.push(Atom::Star),
            Segment::DoubleGlob => atoms.push(Atom::DoubleStar),
            Segment::Variable { field_path, pattern } => {
                atoms.push(Atom::FieldStart(field_path.clone()));
                field_paths.push(field_path.join("."));
                for sub in pattern {
                    match sub {
                        Segment::Literal(s) => atoms.push(Atom::Lit(s.clone())),
                        Segment::SingleGlob => atoms.push(Atom::Star),
                        Segment::DoubleGlob => atoms.push(Atom::DoubleStar),
                        Segment::Variable { .. } => {
                            return Err(ProxyError::RouteCompile(
                                "nested variables are not supported in path templates".to_string(),
                            ));
                        }
                    }
                }
                atoms.push(Atom::FieldEnd);
            }
        }
    }
    Ok(())
}

type OpenField = (Vec<String>, usize);

fn try_match(
    atoms: &[Atom],
    ai: usize,
    comps: &[&str],
    ci: usize,
    open_fields: Vec<OpenField>,
) -> Option<Vec<(Vec<String>, String)>> {
    if ai == atoms.len() {
        return if ci == comps.len() && open_fields.is_empty() {
            Some(Vec::new())
        } else {
            None
        };
    }

    match &atoms[ai] {
        Atom::Lit(s) => {
            if ci < comps.len() && comps[ci] == s {
                try_match(atoms, ai + 1, comps, ci + 1, open_fields)
            } else {
                None
            }
        }
        Atom::Star => {
            if ci < comps.len() {
                try_match(atoms, ai + 1, comps, ci + 1, open_fields)
            } else {
                None
            }
        }
        Atom::DoubleStar => {
            let remaining = comps.len() - ci;
            for k in (0..=remaining).rev() {
                if let Some(caps) = try_match(atoms, ai + 1, comps, ci + k, open_fields.clone()) {
                    return Some(caps);
                }
            }
            None
        }
        Atom::FieldStart(path) => {
            let mut of = open_fields;
            of.push((path.clone(), ci));
            try_match(atoms, ai + 1, comps, ci, of)
        }
        Atom::FieldEnd => {
            let mut of = open_fields;
            let (path, start) = of.pop()?;
            let value = comps[start..ci].join("/");
            let mut result = try_match(atoms, ai + 1, comps, ci, of)?;
            result.push((path, value));
            Some(result)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_variable() {
        let t = PathTemplate::parse("/v1/greeter/{name}").unwrap();
        let comps = ["v1", "greeter", "bob"];
        let caps = t.matches(&comps).unwrap();
        assert_eq!(caps.get("name").unwrap(), "bob");
    }

    #[test]
    fn subpath_variable_with_verb() {
        let t = PathTemplate::parse("/v1/{name=messages/*}:undelete").unwrap();
        assert_eq!(t.verb(), Some("undelete"));
        let comps = ["v1", "messages", "42"];
        let caps = t.matches(&comps).unwrap();
        assert_eq!(caps.get("name").unwrap(), "messages/42");
    }

    #[test]
    fn literal_mismatch_fails() {
        let t = PathTemplate::parse("/v1/greeter/{name}").unwrap();
        let comps = ["v1", "other", "bob"];
        assert!(t.matches(&comps).is_none());
    }

    #[test]
    fn double_glob_consumes_variable_span() {
        let t = PathTemplate::parse("/v1/{path=**}").unwrap();
        let comps = ["v1", "a", "b", "c"];
        let caps = t.matches(&comps).unwrap();
        assert_eq!(caps.get("path").unwrap(), "a/b/c");
    }

    #[test]
    fn double_glob_empty_span() {
        let t = PathTemplate::parse("/v1/{path=**}").unwrap();
        let comps = ["v1"];
        let caps = t.matches(&comps).unwrap();
        assert_eq!(caps.get("path").unwrap(), "");
    }

    #[test]
    fn rejects_template_without_leading_slash() {
        assert!(PathTemplate::parse("v1/greeter").is_err());
    }

    #[test]
    fn nested_field_path_dotted() {
        let t = PathTemplate::parse("/v1/{parent.name}").unwrap();
        let comps = ["v1", "bob"];
        let caps = t.matches(&comps).unwrap();
        assert_eq!(caps.get("parent.name").unwrap(), "bob");
    }

    #[test]
    fn recompiling_is_idempotent() {
        let a = PathTemplate::parse("/v1/{name=messages/*}:undelete").unwrap();
        let b = PathTemplate::parse("/v1/{name=messages/*}:undelete").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.field_paths(), b.field_paths());
    }
}
