//! Segment-by-segment path patterns.
//!
//! A segment starting with `:` captures exactly one non-empty path segment;
//! every other segment must match literally. No regex, no wildcards.

use std::collections::HashMap;

use crate::error::Error;

const MARKER: char = ':';

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
}

/// A compiled pattern such as `/products/:id/reviews/:review`.
#[derive(Debug, Clone)]
pub struct PathPattern {
    segments: Vec<Segment>,
    params: Vec<String>,
}

impl PathPattern {
    /// `true` when `path` has at least one parameter segment.
    pub fn is_pattern(path: &str) -> bool {
        path.split('/').any(|seg| seg.starts_with(MARKER))
    }

    pub fn compile(path: &str) -> Result<Self, Error> {
        let mut params: Vec<String> = Vec::new();
        let segments = path
            .split('/')
            .map(|seg| match seg.strip_prefix(MARKER) {
                Some("") => Err(Error::registration(format!("`{path}`: empty parameter name"))),
                Some(name) if params.iter().any(|p| p == name) => Err(Error::registration(
                    format!("`{path}`: parameter `{name}` appears twice"),
                )),
                Some(name) => {
                    params.push(name.to_owned());
                    Ok(Segment::Param(name.to_owned()))
                }
                None => Ok(Segment::Literal(seg.to_owned())),
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { segments, params })
    }

    /// Parameter names in capture order.
    pub fn param_names(&self) -> &[String] {
        &self.params
    }

    /// Binds parameter names to the captured segments, or `None` on mismatch.
    pub fn matches(&self, path: &str) -> Option<HashMap<String, String>> {
        let mut captured = HashMap::with_capacity(self.params.len());
        let mut parts = path.split('/');
        for segment in &self.segments {
            let part = parts.next()?;
            match segment {
                Segment::Literal(lit) if lit != part => return None,
                Segment::Literal(_) => {}
                Segment::Param(_) if part.is_empty() => return None,
                Segment::Param(name) => {
                    captured.insert(name.clone(), part.to_owned());
                }
            }
        }
        if parts.next().is_some() {
            return None;
        }
        Some(captured)
    }
}
