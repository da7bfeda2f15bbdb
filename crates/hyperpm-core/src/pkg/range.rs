//! npm version ranges on top of `semver`.
//!
//! `semver::VersionReq` follows Cargo's dialect, so npm syntax is rewritten
//! before parsing:
//! - `||` separates alternatives
//! - whitespace between comparators means AND
//! - hyphen ranges (`1.0.0 - 2.0.0`)
//! - x-ranges (`1.x`, `1.2.*`, `*`, empty string)
//! - bare versions are exact (`1.2.3`), bare partials are tilde (`1.2`)

use super::error::PkgError;
use semver::{Version, VersionReq};
use std::fmt;

/// A parsed npm version range.
#[derive(Debug, Clone)]
pub struct VersionRange {
    raw: String,
    alternatives: Vec<VersionReq>,
}

impl VersionRange {
    /// Parse an npm range expression.
    ///
    /// # Errors
    /// Returns `PKG_SPEC_INVALID` if no alternative parses.
    pub fn parse(raw: &str) -> Result<Self, PkgError> {
        let trimmed = raw.trim();
        let mut alternatives = Vec::new();

        for alt in trimmed.split("||") {
            let req = parse_alternative(alt.trim())
                .map_err(|e| PkgError::spec_invalid(format!("Invalid version range '{raw}': {e}")))?;
            alternatives.push(req);
        }

        Ok(Self {
            raw: trimmed.to_string(),
            alternatives,
        })
    }

    /// The range as written.
    #[must_use]
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Whether `version` satisfies any alternative.
    #[must_use]
    pub fn satisfies(&self, version: &Version) -> bool {
        self.alternatives.iter().any(|req| req.matches(version))
    }

    /// Highest version in `versions` satisfying the range.
    pub fn max_satisfying<'a, I>(&self, versions: I) -> Option<&'a Version>
    where
        I: IntoIterator<Item = &'a Version>,
    {
        versions.into_iter().filter(|v| self.satisfies(v)).max()
    }
}

impl PartialEq for VersionRange {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Eq for VersionRange {}

impl fmt::Display for VersionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.raw.is_empty() {
            f.write_str("*")
        } else {
            f.write_str(&self.raw)
        }
    }
}

/// Check whether `version` satisfies the npm range `range`.
///
/// Unparseable ranges and versions never match.
#[must_use]
pub fn version_satisfies(version: &str, range: &str) -> bool {
    let (Ok(version), Ok(range)) = (Version::parse(version), VersionRange::parse(range)) else {
        return false;
    };
    range.satisfies(&version)
}

fn parse_alternative(alt: &str) -> Result<VersionReq, semver::Error> {
    if alt.is_empty() {
        return Ok(VersionReq::STAR);
    }

    // Hyphen ranges: "1.0.0 - 2.0.0" -> ">=1.0.0, <=2.0.0"
    if let Some((start, end)) = parse_hyphen_range(alt) {
        return VersionReq::parse(&format!(">={start}, <={end}"));
    }

    let comparators: Vec<String> = split_comparators(alt)
        .iter()
        .map(|c| normalize_comparator(c))
        .collect();

    VersionReq::parse(&comparators.join(", "))
}

/// Parse a hyphen range like "1.0.0 - 2.0.0".
fn parse_hyphen_range(range: &str) -> Option<(String, String)> {
    let parts: Vec<&str> = range.split(" - ").collect();
    if parts.len() == 2 {
        let start = strip_v(parts[0].trim());
        let end = strip_v(parts[1].trim());
        if !start.is_empty() && !end.is_empty() {
            return Some((start.to_string(), end.to_string()));
        }
    }
    None
}

/// Split on whitespace, reattaching bare operators to the version after them.
///
/// `">= 2.1.2 < 3.0.0"` becomes `[">=2.1.2", "<3.0.0"]`.
fn split_comparators(alt: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut pending_op = String::new();

    for token in alt.split_whitespace() {
        if token_has_version(token) {
            out.push(format!("{pending_op}{token}"));
            pending_op.clear();
        } else {
            // Operator without version, keep accumulating
            pending_op.push_str(token);
        }
    }

    if !pending_op.is_empty() {
        out.push(pending_op);
    }
    out
}

/// Check if a token contains a version number or wildcard.
fn token_has_version(token: &str) -> bool {
    token
        .chars()
        .any(|c| c.is_ascii_digit() || matches!(c, 'x' | 'X' | '*'))
}

fn normalize_comparator(comparator: &str) -> String {
    let split = comparator
        .find(|c: char| c.is_ascii_alphanumeric() || c == '*')
        .unwrap_or(comparator.len());
    let (op, version) = comparator.split_at(split);
    let version = strip_v(version);

    let core = version.split(['-', '+']).next().unwrap_or(version);
    let parts: Vec<&str> = core.split('.').collect();

    // Wildcard parts become a partial version: "1.2.x" -> "1.2", "^1.x" -> "^1"
    if let Some(pos) = parts.iter().position(|p| matches!(*p, "x" | "X" | "*")) {
        if pos == 0 {
            return "*".to_string();
        }
        let partial = parts[..pos].join(".");
        let op = if op.is_empty() { "=" } else { op };
        return format!("{op}{partial}");
    }

    if op.is_empty() {
        return match parts.len() {
            // "1" -> "^1" (1.x)
            1 => format!("^{version}"),
            // "1.2" -> "~1.2" (1.2.x)
            2 => format!("~{version}"),
            // "1.2.3" -> "=1.2.3"
            _ => format!("={version}"),
        };
    }

    format!("{op}{version}")
}

fn strip_v(version: &str) -> &str {
    match version.strip_prefix(['v', 'V']) {
        Some(rest) if rest.starts_with(|c: char| c.is_ascii_digit()) => rest,
        _ => version,
    }
}
