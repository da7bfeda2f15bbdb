//! Package spec parsing.
//!
//! Parses package specifications like:
//! - `react`
//! - `react@18.2.0`
//! - `react@^18.0.0`
//! - `react@next`
//! - `@types/node`
//! - `@types/node@^20`

use super::error::PkgError;
use super::range::VersionRange;
use semver::Version;
use std::fmt;

/// Dist-tag used when no constraint is given.
pub const DEFAULT_TAG: &str = "latest";

/// What a dependency edge accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Constraint {
    /// An npm version range.
    Range(VersionRange),
    /// A registry dist-tag such as `latest`.
    Tag(String),
    /// A specifier the registry cannot answer (git URLs, `file:`, aliases).
    Unsupported(String),
}

impl Constraint {
    /// Classify a raw constraint string.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if let Ok(range) = VersionRange::parse(raw) {
            return Self::Range(range);
        }
        if is_tag(raw) {
            return Self::Tag(raw.to_string());
        }
        Self::Unsupported(raw.to_string())
    }

    /// The constraint as written.
    #[must_use]
    pub fn raw(&self) -> &str {
        match self {
            Self::Range(range) => range.raw(),
            Self::Tag(tag) | Self::Unsupported(tag) => tag,
        }
    }
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Range(range) => range.fmt(f),
            Self::Tag(tag) | Self::Unsupported(tag) => f.write_str(tag),
        }
    }
}

/// Dist-tags are plain identifiers that do not read as versions.
fn is_tag(raw: &str) -> bool {
    raw.starts_with(|c: char| c.is_ascii_alphabetic())
        && raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && Version::parse(raw.trim_start_matches(['v', 'V'])).is_err()
}

/// A parsed package specification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageSpec {
    /// Full package name (e.g., "@scope/name" or "name").
    pub name: String,
    /// Scope without the @ prefix, if scoped.
    pub scope: Option<String>,
    /// Accepted versions.
    pub constraint: Constraint,
}

impl PackageSpec {
    /// Build a spec from a dependency map entry (`"name": "range"`).
    ///
    /// # Errors
    /// Returns an error if the name is invalid.
    pub fn new(name: &str, raw_constraint: &str) -> Result<Self, PkgError> {
        let scope = if name.starts_with('@') {
            let spec = Self::parse_scoped(name)?;
            if !matches!(&spec.constraint, Constraint::Tag(t) if t == DEFAULT_TAG)
                || spec.name != name
            {
                return Err(PkgError::spec_invalid(format!(
                    "Invalid package name '{name}'"
                )));
            }
            spec.scope
        } else {
            Self::validate_name(name)?;
            None
        };

        Ok(Self {
            name: name.to_string(),
            scope,
            constraint: Constraint::parse(raw_constraint),
        })
    }

    /// Parse a package specification string.
    ///
    /// A bare name resolves through the `latest` dist-tag.
    ///
    /// # Errors
    /// Returns an error if the spec is invalid.
    pub fn parse(input: &str) -> Result<Self, PkgError> {
        let input = input.trim();

        if input.is_empty() {
            return Err(PkgError::spec_invalid("Empty package spec"));
        }

        // Check for scoped package
        if input.starts_with('@') {
            Self::parse_scoped(input)
        } else {
            Self::parse_unscoped(input)
        }
    }

    fn parse_scoped(input: &str) -> Result<Self, PkgError> {
        // Must have at least @scope/name
        let Some(slash_pos) = input.find('/') else {
            return Err(PkgError::spec_invalid(format!(
                "Invalid scoped package: missing '/' in '{input}'"
            )));
        };

        if slash_pos == 1 {
            return Err(PkgError::spec_invalid(format!(
                "Invalid scoped package: empty scope in '{input}'"
            )));
        }

        let scope = &input[1..slash_pos];
        let after_slash = &input[slash_pos + 1..];

        if after_slash.is_empty() {
            return Err(PkgError::spec_invalid(format!(
                "Invalid scoped package: empty name in '{input}'"
            )));
        }

        Self::validate_name(scope)?;

        // The version delimiter is @ after the package name part
        let (pkg_name, constraint) = match after_slash.find('@') {
            Some(at_pos) => {
                let range = &after_slash[at_pos + 1..];
                if range.is_empty() {
                    return Err(PkgError::spec_invalid(format!(
                        "Invalid package spec: empty version range in '{input}'"
                    )));
                }
                (&after_slash[..at_pos], Constraint::parse(range))
            }
            None => (after_slash, Constraint::Tag(DEFAULT_TAG.to_string())),
        };

        Self::validate_name(pkg_name)?;

        Ok(Self {
            name: format!("@{scope}/{pkg_name}"),
            scope: Some(scope.to_string()),
            constraint,
        })
    }

    fn parse_unscoped(input: &str) -> Result<Self, PkgError> {
        if let Some(at_pos) = input.find('@') {
            let name = &input[..at_pos];
            let range = &input[at_pos + 1..];

            if range.is_empty() {
                return Err(PkgError::spec_invalid(format!(
                    "Invalid package spec: empty version range in '{input}'"
                )));
            }

            Self::validate_name(name)?;

            Ok(Self {
                name: name.to_string(),
                scope: None,
                constraint: Constraint::parse(range),
            })
        } else {
            Self::validate_name(input)?;

            Ok(Self {
                name: input.to_string(),
                scope: None,
                constraint: Constraint::Tag(DEFAULT_TAG.to_string()),
            })
        }
    }

    fn validate_name(name: &str) -> Result<(), PkgError> {
        if name.is_empty() {
            return Err(PkgError::spec_invalid("Empty package name"));
        }

        if name.starts_with('.') || name.starts_with('_') {
            return Err(PkgError::spec_invalid(format!(
                "Package name '{name}' cannot start with '.' or '_'"
            )));
        }

        // Basic validation: no spaces, no special chars except - and _
        for c in name.chars() {
            if !c.is_alphanumeric() && c != '-' && c != '_' && c != '.' {
                return Err(PkgError::spec_invalid(format!(
                    "Invalid character '{c}' in package name '{name}'"
                )));
            }
        }

        Ok(())
    }

    /// Check if this is a scoped package.
    #[must_use]
    pub fn is_scoped(&self) -> bool {
        self.scope.is_some()
    }

    /// URL-encode the package name for registry requests.
    ///
    /// For scoped packages, encodes the `/` as `%2F`.
    #[must_use]
    pub fn url_encoded_name(&self) -> String {
        encode_name(&self.name)
    }
}

impl fmt::Display for PackageSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.constraint)
    }
}

/// URL-encode a package name for registry requests.
#[must_use]
pub fn encode_name(name: &str) -> String {
    if name.starts_with('@') {
        name.replace('/', "%2F")
    } else {
        name.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range_of(spec: &PackageSpec) -> &str {
        match &spec.constraint {
            Constraint::Range(r) => r.raw(),
            other => panic!("expected range, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_simple() {
        let spec = PackageSpec::parse("react").unwrap();
        assert_eq!(spec.name, "react");
        assert_eq!(spec.scope, None);
        assert_eq!(spec.constraint, Constraint::Tag("latest".to_string()));
    }

    #[test]
    fn test_parse_with_version() {
        let spec = PackageSpec::parse("react@18.2.0").unwrap();
        assert_eq!(spec.name, "react");
        assert_eq!(range_of(&spec), "18.2.0");
    }

    #[test]
    fn test_parse_with_range() {
        let spec = PackageSpec::parse("react@^18.0.0").unwrap();
        assert_eq!(spec.name, "react");
        assert_eq!(range_of(&spec), "^18.0.0");
    }

    #[test]
    fn test_parse_with_tag() {
        let spec = PackageSpec::parse("react@next").unwrap();
        assert_eq!(spec.constraint, Constraint::Tag("next".to_string()));
    }

    #[test]
    fn test_parse_scoped() {
        let spec = PackageSpec::parse("@types/node").unwrap();
        assert_eq!(spec.name, "@types/node");
        assert_eq!(spec.scope, Some("types".to_string()));
        assert_eq!(spec.constraint, Constraint::Tag("latest".to_string()));
    }

    #[test]
    fn test_parse_scoped_with_range() {
        let spec = PackageSpec::parse("@types/node@^20").unwrap();
        assert_eq!(spec.name, "@types/node");
        assert_eq!(spec.scope, Some("types".to_string()));
        assert_eq!(range_of(&spec), "^20");
    }

    #[test]
    fn test_parse_empty_fails() {
        assert!(PackageSpec::parse("").is_err());
        assert!(PackageSpec::parse("   ").is_err());
    }

    #[test]
    fn test_parse_scope_only_fails() {
        assert!(PackageSpec::parse("@").is_err());
        assert!(PackageSpec::parse("@scope").is_err());
        assert!(PackageSpec::parse("@scope/").is_err());
    }

    #[test]
    fn test_parse_empty_range_fails() {
        assert!(PackageSpec::parse("react@").is_err());
        assert!(PackageSpec::parse("@types/node@").is_err());
    }

    #[test]
    fn test_new_from_manifest_entry() {
        let spec = PackageSpec::new("@babel/core", "^7.0.0").unwrap();
        assert_eq!(spec.scope, Some("babel".to_string()));
        assert_eq!(range_of(&spec), "^7.0.0");

        let spec = PackageSpec::new("lib", "").unwrap();
        assert_eq!(range_of(&spec), "");

        assert!(PackageSpec::new("bad name", "1.0.0").is_err());
        assert!(PackageSpec::new("@scope/name@1", "1.0.0").is_err());
    }

    #[test]
    fn test_unsupported_specifiers() {
        for raw in [
            "git+https://github.com/a/b.git",
            "file:../local",
            "npm:other@^1.0.0",
            "github:user/repo",
        ] {
            let spec = PackageSpec::new("a", raw).unwrap();
            assert_eq!(spec.constraint, Constraint::Unsupported(raw.to_string()));
        }
    }

    #[test]
    fn test_url_encoded_name() {
        let spec = PackageSpec::parse("react").unwrap();
        assert_eq!(spec.url_encoded_name(), "react");

        let spec = PackageSpec::parse("@types/node").unwrap();
        assert_eq!(spec.url_encoded_name(), "@types%2Fnode");
    }

    #[test]
    fn test_display() {
        let spec = PackageSpec::parse("@types/node@^20").unwrap();
        assert_eq!(spec.to_string(), "@types/node@^20");
        let spec = PackageSpec::new("any", "").unwrap();
        assert_eq!(spec.to_string(), "any@*");
    }
}
