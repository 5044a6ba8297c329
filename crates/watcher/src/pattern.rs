//! Watch pattern parsing and matching.
//!
//! A pattern such as `/app/{src,config}/**/*.php` is split into the directory
//! to watch (`/app`) and the glob segments between `**` separators
//! (`{src,config}` and `*.php`). A `**` matches any number of directories,
//! including none. Inside a segment `*`, `?` and `[..]` never cross a `/`, and
//! `{a,b}` expands to alternatives.

use std::fmt;
use std::path::{Component, Path, PathBuf};

use glob::{MatchOptions, Pattern};

use crate::error::WatchError;

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

const GLOB_CHARS: &[char] = &['[', '*', '?', '{'];

#[derive(Debug, Clone)]
pub struct WatchPattern {
    source: String,
    dir: PathBuf,
    segments: Vec<Segment>,
}

/// Glob between two `**`; spans `depth` path components. An empty segment
/// matches anything.
#[derive(Debug, Clone)]
struct Segment {
    depth: usize,
    alternatives: Vec<Pattern>,
}

impl WatchPattern {
    /// Relative patterns are resolved against the current directory.
    pub fn parse(pattern: &str) -> Result<Self, WatchError> {
        let absolute = absolute(pattern)?;

        let mut dir = PathBuf::new();
        let mut parts = Vec::new();
        let mut components = absolute.components().peekable();
        while let Some(component) = components.next() {
            let part = component.as_os_str().to_string_lossy();
            let is_last = components.peek().is_none();
            let is_file_name = is_last && part.contains('.') && !absolute.is_dir();
            if !parts.is_empty() || is_file_name || part.contains(GLOB_CHARS) {
                parts.push(part.into_owned());
            } else {
                dir.push(component.as_os_str());
            }
        }

        let remainder = parts.join("/");
        let segments = remainder
            .split("**")
            .map(|segment| Segment::parse(pattern, segment.trim_matches('/')))
            .collect::<Result<_, _>>()?;

        Ok(Self {
            source: pattern.to_string(),
            dir,
            segments,
        })
    }

    pub fn parse_all<I, S>(patterns: I) -> Result<Vec<Self>, WatchError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        patterns
            .into_iter()
            .map(|pattern| Self::parse(pattern.as_ref()))
            .collect()
    }

    /// The directory to watch recursively.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn matches(&self, file_name: &Path) -> bool {
        let Ok(relative) = file_name.strip_prefix(&self.dir) else {
            return false;
        };
        let parts: Vec<String> = relative
            .components()
            .map(|component| component.as_os_str().to_string_lossy().into_owned())
            .collect();
        let parts: Vec<&str> = parts.iter().map(String::as_str).collect();

        match self.segments.as_slice() {
            [] => true,
            [only] => only.is_empty() || only.matches(&parts),
            [first, middle @ .., last] => {
                if parts.len() < first.depth + last.depth {
                    return false;
                }
                let (head, rest) = parts.split_at(first.depth);
                let (between, tail) = rest.split_at(rest.len() - last.depth);
                first.matches(head) && last.matches(tail) && matches_in_order(middle, between)
            }
        }
    }
}

impl fmt::Display for WatchPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl Segment {
    fn parse(source: &str, segment: &str) -> Result<Self, WatchError> {
        if segment.is_empty() {
            return Ok(Self {
                depth: 0,
                alternatives: Vec::new(),
            });
        }

        let alternatives = expand_braces(segment)
            .iter()
            .map(|alternative| {
                Pattern::new(alternative).map_err(|err| WatchError::InvalidPattern {
                    pattern: source.to_string(),
                    reason: err.to_string(),
                })
            })
            .collect::<Result<_, _>>()?;

        Ok(Self {
            depth: segment.split('/').count(),
            alternatives,
        })
    }

    fn is_empty(&self) -> bool {
        self.alternatives.is_empty()
    }

    fn matches(&self, parts: &[&str]) -> bool {
        if self.is_empty() {
            return true;
        }
        let text = parts.join("/");
        self.alternatives
            .iter()
            .any(|pattern| pattern.matches_with(&text, MATCH_OPTIONS))
    }
}

/// Each segment must match a window of `parts`, windows in order and not
/// overlapping. Leftmost windows leave the most room for later segments.
fn matches_in_order(segments: &[Segment], parts: &[&str]) -> bool {
    let mut cursor = 0;
    for segment in segments.iter().filter(|segment| !segment.is_empty()) {
        let found = (cursor..parts.len())
            .take_while(|start| start + segment.depth <= parts.len())
            .find(|&start| segment.matches(&parts[start..start + segment.depth]));
        match found {
            Some(start) => cursor = start + segment.depth,
            None => return false,
        }
    }
    true
}

/// `*.{php,twig}` -> `*.php`, `*.twig`
fn expand_braces(pattern: &str) -> Vec<String> {
    let Some(open) = pattern.find('{') else {
        return vec![pattern.to_string()];
    };
    let Some(close) = pattern[open..].find('}').map(|offset| open + offset) else {
        return vec![pattern.to_string()];
    };

    let before = &pattern[..open];
    let after = &pattern[close + 1..];
    pattern[open + 1..close]
        .split(',')
        .flat_map(|alternative| expand_braces(&format!("{before}{alternative}{after}")))
        .collect()
}

/// Absolute and lexically cleaned, without touching the filesystem.
fn absolute(pattern: &str) -> Result<PathBuf, WatchError> {
    let path = Path::new(pattern);
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map_err(WatchError::CurrentDir)?
            .join(path)
    };

    let mut cleaned = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                cleaned.pop();
            }
            other => cleaned.push(other.as_os_str()),
        }
    }
    Ok(cleaned)
}
