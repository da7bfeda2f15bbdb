//! Project manifest (`package.json`) model.
//!
//! Reads the root dependency sections into [`RootDependency`] values and
//! writes saved ranges back into `dependencies`.

use super::error::{codes, PkgError};
use super::spec::PackageSpec;
use hyperpm_util::fs::atomic_write;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

/// Manifest file name.
pub const MANIFEST_NAME: &str = "package.json";

/// Which manifest section a root dependency comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyKind {
    /// `dependencies`
    Prod,
    /// `devDependencies`
    Dev,
    /// `optionalDependencies`
    Optional,
}

impl DependencyKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Prod => "prod",
            Self::Dev => "dev",
            Self::Optional => "optional",
        }
    }

    fn section(self) -> &'static str {
        match self {
            Self::Prod => "dependencies",
            Self::Dev => "devDependencies",
            Self::Optional => "optionalDependencies",
        }
    }
}

/// A direct dependency of the project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootDependency {
    pub spec: PackageSpec,
    pub kind: DependencyKind,
}

impl RootDependency {
    #[must_use]
    pub fn new(spec: PackageSpec, kind: DependencyKind) -> Self {
        Self { spec, kind }
    }
}

/// Parsed project manifest.
#[derive(Debug, Clone, Default)]
pub struct Manifest {
    /// Project name, if declared.
    pub name: Option<String>,
    /// Project version, if declared.
    pub version: Option<String>,
    /// Valid root dependencies, sorted by name.
    pub dependencies: Vec<RootDependency>,
    /// Errors encountered during extraction.
    pub errors: Vec<PkgDepError>,
}

/// Error encountered while extracting a dependency.
#[derive(Debug, Clone)]
pub struct PkgDepError {
    /// Package name (if known).
    pub name: String,
    /// Error code.
    pub code: &'static str,
    /// Error message.
    pub message: String,
}

impl PkgDepError {
    /// Create a new dependency error.
    #[must_use]
    pub fn new(name: impl Into<String>, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            code,
            message: message.into(),
        }
    }

    /// Create an invalid range error.
    #[must_use]
    pub fn invalid_range(name: &str, actual_type: &str) -> Self {
        Self::new(
            name,
            codes::PKG_DEP_RANGE_INVALID,
            format!("expected string, got {actual_type}"),
        )
    }

    /// Create an invalid section error.
    #[must_use]
    pub fn invalid_section(section: &str, actual_type: &str) -> Self {
        Self::new(
            section,
            codes::PKG_PACKAGE_JSON_INVALID,
            format!("'{section}' must be an object, got {actual_type}"),
        )
    }
}

/// Read the root dependencies of a project manifest.
///
/// Precedence when a name appears in several sections:
/// `dependencies` > `devDependencies` > `optionalDependencies`.
///
/// # Errors
/// Returns `PkgError` if the file cannot be read or parsed as JSON.
pub fn read_manifest(
    package_json_path: &Path,
    include_dev: bool,
    include_optional: bool,
) -> Result<Manifest, PkgError> {
    if !package_json_path.exists() {
        return Err(PkgError::package_json_not_found(package_json_path));
    }

    let content = fs::read_to_string(package_json_path)
        .map_err(|e| PkgError::package_json_invalid(format!("Failed to read: {e}")))?;

    let pkg_json: Value = serde_json::from_str(&content)
        .map_err(|e| PkgError::package_json_invalid(format!("Invalid JSON: {e}")))?;

    let root = pkg_json
        .as_object()
        .ok_or_else(|| PkgError::package_json_invalid("package.json must be a JSON object"))?;

    let mut manifest = Manifest {
        name: root.get("name").and_then(Value::as_str).map(String::from),
        version: root.get("version").and_then(Value::as_str).map(String::from),
        ..Manifest::default()
    };

    // Later sections overwrite earlier ones
    let mut deps_map: HashMap<String, (String, DependencyKind)> = HashMap::new();
    if include_optional {
        extract_section(root, DependencyKind::Optional, &mut deps_map, &mut manifest.errors);
    }
    if include_dev {
        extract_section(root, DependencyKind::Dev, &mut deps_map, &mut manifest.errors);
    }
    extract_section(root, DependencyKind::Prod, &mut deps_map, &mut manifest.errors);

    let mut entries: Vec<_> = deps_map.into_iter().collect();
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    for (name, (range, kind)) in entries {
        match PackageSpec::new(&name, &range) {
            Ok(spec) => manifest.dependencies.push(RootDependency::new(spec, kind)),
            Err(e) => manifest
                .errors
                .push(PkgDepError::new(name, e.code(), e.message())),
        }
    }

    Ok(manifest)
}

/// Extract dependencies from a specific section of package.json.
fn extract_section(
    root: &serde_json::Map<String, Value>,
    kind: DependencyKind,
    deps_map: &mut HashMap<String, (String, DependencyKind)>,
    errors: &mut Vec<PkgDepError>,
) {
    let section = kind.section();
    let Some(section_value) = root.get(section) else {
        return;
    };

    let Some(section_obj) = section_value.as_object() else {
        errors.push(PkgDepError::invalid_section(
            section,
            json_type_name(section_value),
        ));
        return;
    };

    for (name, range_value) in section_obj {
        if let Some(range) = range_value.as_str() {
            deps_map.insert(name.clone(), (range.to_string(), kind));
        } else {
            errors.push(PkgDepError::invalid_range(
                name,
                json_type_name(range_value),
            ));
        }
    }
}

/// Write `name -> range` entries into the manifest's `dependencies`.
///
/// Other keys are preserved in their original order. The file is replaced
/// atomically.
///
/// # Errors
/// Returns `PkgError` if the manifest cannot be read, parsed or written.
pub fn save_dependencies(
    package_json_path: &Path,
    saved: &BTreeMap<String, String>,
) -> Result<(), PkgError> {
    if saved.is_empty() {
        return Ok(());
    }

    let content = fs::read_to_string(package_json_path)
        .map_err(|_| PkgError::package_json_not_found(package_json_path))?;

    let mut package: Value = serde_json::from_str(&content)
        .map_err(|e| PkgError::package_json_invalid(format!("Invalid JSON: {e}")))?;

    let obj = package
        .as_object_mut()
        .ok_or_else(|| PkgError::package_json_invalid("package.json must be a JSON object"))?;

    let deps = obj
        .entry("dependencies")
        .or_insert_with(|| Value::Object(serde_json::Map::new()));
    let deps_obj = deps
        .as_object_mut()
        .ok_or_else(|| PkgError::package_json_invalid("'dependencies' must be an object"))?;

    for (name, range) in saved {
        deps_obj.insert(name.clone(), Value::String(range.clone()));
    }

    let output = serde_json::to_string_pretty(&package)
        .map_err(|e| PkgError::package_json_invalid(e.to_string()))?;

    atomic_write(package_json_path, format!("{output}\n").as_bytes()).map_err(|e| {
        PkgError::new(
            codes::NODE_MODULES_WRITE_FAILED,
            format!("Failed to write package.json: {e}"),
        )
    })
}

/// Get a human-readable type name for a JSON value.
fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
