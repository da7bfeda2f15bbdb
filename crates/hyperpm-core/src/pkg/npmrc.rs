//! `.npmrc` parsing for registry routing and authentication.
//!
//! Recognized directives:
//! - `registry=URL` (default registry)
//! - `@scope:registry=URL` (registry for one scope)
//! - `//host/path/:_authToken=TOKEN` (bearer token, `${ENV_VAR}` expanded)

use std::collections::HashMap;
use std::path::Path;
use url::Url;

/// Parsed `.npmrc` configuration.
#[derive(Debug, Clone, Default)]
pub struct NpmrcConfig {
    /// Default registry override.
    pub registry: Option<Url>,
    /// Scope → registry URL mapping (e.g., `@myorg` → `https://npm.pkg.github.com/`).
    pub scoped_registries: HashMap<String, Url>,
    /// `host[/path]` → auth token mapping.
    pub auth_tokens: HashMap<String, String>,
}

impl NpmrcConfig {
    /// Registry serving `name`, falling back to `default`.
    #[must_use]
    pub fn registry_for<'a>(&'a self, name: &str, default: &'a Url) -> &'a Url {
        name.strip_prefix('@')
            .and_then(|rest| rest.split_once('/'))
            .and_then(|(scope, _)| self.scoped_registries.get(&format!("@{scope}")))
            .unwrap_or(default)
    }

    /// Auth token for a request to `url`.
    ///
    /// The longest configured `host/path` prefix of the URL wins.
    #[must_use]
    pub fn auth_token_for(&self, url: &Url) -> Option<&str> {
        let host = url.host_str()?;
        let mut candidate = match url.port() {
            Some(port) => format!("{host}:{port}{}", url.path()),
            None => format!("{host}{}", url.path()),
        };

        loop {
            let key = candidate.trim_end_matches('/');
            if let Some(token) = self.auth_tokens.get(key) {
                return Some(token);
            }
            match key.rfind('/') {
                Some(pos) => candidate.truncate(pos),
                None => return None,
            }
        }
    }
}

/// Parse a single `.npmrc` file's content.
///
/// Ignores comments (`#`, `;`), blank lines and unknown keys.
#[must_use]
pub fn parse_npmrc(content: &str) -> NpmrcConfig {
    let mut config = NpmrcConfig::default();

    for line in content.lines() {
        let line = line.trim();

        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }

        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim();

        if key == "registry" {
            config.registry = parse_registry_url(value);
        } else if key.starts_with('@') {
            if let Some((scope, "registry")) = key.split_once(':') {
                if let Some(url) = parse_registry_url(value) {
                    config.scoped_registries.insert(scope.to_string(), url);
                }
            }
        } else if let Some(host_part) = key
            .strip_prefix("//")
            .and_then(|k| k.strip_suffix(":_authToken"))
        {
            let token = expand_env_vars(value);
            if !token.is_empty() {
                config
                    .auth_tokens
                    .insert(host_part.trim_end_matches('/').to_string(), token);
            }
        }
    }

    config
}

/// Registry URLs always end in `/` so package names join below them.
fn parse_registry_url(value: &str) -> Option<Url> {
    let value = expand_env_vars(value);
    if value.ends_with('/') {
        Url::parse(&value).ok()
    } else {
        Url::parse(&format!("{value}/")).ok()
    }
}

/// Load and merge `.npmrc` files from `project_dir` upward, then `$HOME`.
///
/// Files closer to the project win.
#[must_use]
pub fn load_npmrc_files(project_dir: &Path) -> NpmrcConfig {
    let mut merged = NpmrcConfig::default();

    let home = dirs_next::home_dir();
    let mut dirs: Vec<&Path> = project_dir.ancestors().collect();
    if let Some(home) = home.as_deref() {
        if !dirs.contains(&home) {
            dirs.push(home);
        }
    }

    for dir in dirs {
        let npmrc_path = dir.join(".npmrc");
        if let Ok(content) = std::fs::read_to_string(&npmrc_path) {
            tracing::debug!(path = %npmrc_path.display(), "loaded .npmrc");
            merge_config(&mut merged, parse_npmrc(&content));
        }
    }

    merged
}

/// Merge `source` into `target`, keeping existing entries (first wins).
fn merge_config(target: &mut NpmrcConfig, source: NpmrcConfig) {
    if target.registry.is_none() {
        target.registry = source.registry;
    }
    for (scope, url) in source.scoped_registries {
        target.scoped_registries.entry(scope).or_insert(url);
    }
    for (host, token) in source.auth_tokens {
        target.auth_tokens.entry(host).or_insert(token);
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for ch in chars.by_ref() {
                if ch == '}' {
                    break;
                }
                var_name.push(ch);
            }
            // Unset variables expand to nothing, as npm does
            if let Ok(val) = std::env::var(&var_name) {
                result.push_str(&val);
            }
        } else {
            result.push(ch);
        }
    }

    result
}
