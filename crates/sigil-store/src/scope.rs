//! Scopes, folder paths, path globs and caller context.
//!
//! Every operation of the core receives an [`OpContext`]: the acting
//! [`Principal`] with its [`ScopeGrant`]s and the [`KeyRef`] to encrypt and
//! decrypt with.  Nothing here is cached between calls.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use sigil_vault::KeyRef;

use crate::error::{StoreError, StoreResult};

/// Longest accepted secret name.
pub const MAX_NAME_LEN: usize = 256;

static ANY_PATH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("^(/.*)?$").expect("valid regex"));

// ═══════════════════════════════════════════════════════════════════════
//  SecretPath
// ═══════════════════════════════════════════════════════════════════════

/// A normalized, absolute folder path such as `/` or `/app/db`.
///
/// Normalization collapses repeated slashes and strips the trailing one, so
/// `app//db/` and `/app/db` are the same path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SecretPath(String);

impl SecretPath {
    /// The root path `/`.
    pub fn root() -> Self {
        Self("/".into())
    }

    /// Parse and normalize a folder path.
    pub fn parse(raw: &str) -> StoreResult<Self> {
        let segments: Vec<&str> = raw.split('/').filter(|s| !s.is_empty()).collect();
        for segment in &segments {
            validate_segment(segment)?;
        }
        if segments.is_empty() {
            Ok(Self::root())
        } else {
            Ok(Self(format!("/{}", segments.join("/"))))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    /// Folder names from the root down, excluding the root itself.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|s| !s.is_empty())
    }

    /// Path of a child folder.
    pub fn child(&self, name: &str) -> StoreResult<Self> {
        validate_segment(name)?;
        if self.is_root() {
            Ok(Self(format!("/{name}")))
        } else {
            Ok(Self(format!("{}/{name}", self.0)))
        }
    }

    /// Parent path, or `None` for the root.
    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            return None;
        }
        match self.0.rfind('/') {
            Some(0) => Some(Self::root()),
            Some(idx) => Some(Self(self.0[..idx].to_string())),
            None => None,
        }
    }

    /// Full path of a secret in this folder, used for policy matching.
    pub fn secret_path(&self, name: &str) -> String {
        if self.is_root() {
            format!("/{name}")
        } else {
            format!("{}/{name}", self.0)
        }
    }
}

impl std::fmt::Display for SecretPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for SecretPath {
    type Error = StoreError;

    fn try_from(value: String) -> StoreResult<Self> {
        Self::parse(&value)
    }
}

impl From<SecretPath> for String {
    fn from(path: SecretPath) -> Self {
        path.0
    }
}

fn validate_segment(segment: &str) -> StoreResult<()> {
    let valid = !segment.is_empty()
        && segment != "."
        && segment != ".."
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidArgument(format!(
            "invalid folder name `{segment}`"
        )))
    }
}

/// Check a secret name: non-empty, no slashes, bounded length.
pub fn validate_secret_name(name: &str) -> StoreResult<()> {
    if name.trim().is_empty() {
        return Err(StoreError::InvalidArgument("secret name is empty".into()));
    }
    if name.contains('/') {
        return Err(StoreError::InvalidArgument(
            "secret name must not contain `/`".into(),
        ));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(StoreError::InvalidArgument(format!(
            "secret name exceeds {MAX_NAME_LEN} bytes"
        )));
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
//  Scope
// ═══════════════════════════════════════════════════════════════════════

/// A (project, environment, folder path) triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scope {
    pub project: String,
    pub environment: String,
    pub path: SecretPath,
}

impl Scope {
    pub fn new(
        project: impl Into<String>,
        environment: impl Into<String>,
        path: &str,
    ) -> StoreResult<Self> {
        let project = project.into();
        let environment = environment.into();
        if project.is_empty() || environment.is_empty() {
            return Err(StoreError::InvalidArgument(
                "project and environment must be non-empty".into(),
            ));
        }
        Ok(Self {
            project,
            environment,
            path: SecretPath::parse(path)?,
        })
    }

    /// Same project and environment, different folder.
    pub fn with_path(&self, path: SecretPath) -> Self {
        Self {
            project: self.project.clone(),
            environment: self.environment.clone(),
            path,
        }
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}{}", self.project, self.environment, self.path)
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  PathPattern
// ═══════════════════════════════════════════════════════════════════════

/// A path glob: `*` matches within one segment, `**` matches any depth.
///
/// A trailing `/**` also matches the folder itself, so `/app/**` covers
/// `/app`, `/app/db` and `/app/db/replica`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PathPattern {
    raw: String,
    regex: Regex,
}

impl PathPattern {
    pub fn parse(raw: &str) -> StoreResult<Self> {
        if !raw.starts_with('/') {
            return Err(StoreError::InvalidArgument(format!(
                "path pattern `{raw}` must start with `/`"
            )));
        }

        let trimmed = if raw.len() > 1 {
            raw.trim_end_matches('/')
        } else {
            raw
        };
        let (body, any_depth) = match trimmed.strip_suffix("/**") {
            Some(body) => (body, true),
            None => (trimmed, false),
        };

        let mut expr = String::from("^");
        let mut chars = body.chars().peekable();
        while let Some(c) = chars.next() {
            if c == '*' {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    expr.push_str(".*");
                } else {
                    expr.push_str("[^/]*");
                }
            } else {
                expr.push_str(&regex::escape(&c.to_string()));
            }
        }
        if any_depth {
            expr.push_str("(/.*)?");
        }
        expr.push('$');

        let regex = Regex::new(&expr)
            .map_err(|e| StoreError::InvalidArgument(format!("bad path pattern `{raw}`: {e}")))?;
        Ok(Self {
            raw: raw.to_string(),
            regex,
        })
    }

    /// Pattern matching everything in an environment.
    pub fn any() -> Self {
        Self {
            raw: "/**".into(),
            regex: ANY_PATH.clone(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn matches(&self, path: &str) -> bool {
        self.regex.is_match(path)
    }
}

impl PartialEq for PathPattern {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Eq for PathPattern {}

impl TryFrom<String> for PathPattern {
    type Error = StoreError;

    fn try_from(value: String) -> StoreResult<Self> {
        Self::parse(&value)
    }
}

impl From<PathPattern> for String {
    fn from(pattern: PathPattern) -> Self {
        pattern.raw
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Principal and grants
// ═══════════════════════════════════════════════════════════════════════

/// Wildcard environment in a grant.
pub const ANY_ENVIRONMENT: &str = "*";

/// Access to folders matching `path` in one project and environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeGrant {
    pub project: String,
    /// Environment slug, or `*` for all environments.
    pub environment: String,
    pub path: PathPattern,
}

impl ScopeGrant {
    pub fn new(
        project: impl Into<String>,
        environment: impl Into<String>,
        path: &str,
    ) -> StoreResult<Self> {
        Ok(Self {
            project: project.into(),
            environment: environment.into(),
            path: PathPattern::parse(path)?,
        })
    }

    /// Every environment and folder of `project`.
    pub fn project_wide(project: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            environment: ANY_ENVIRONMENT.into(),
            path: PathPattern::any(),
        }
    }

    pub fn covers(&self, project: &str, environment: &str, path: &SecretPath) -> bool {
        self.project == project
            && (self.environment == ANY_ENVIRONMENT || self.environment == environment)
            && self.path.matches(path.as_str())
    }
}

/// The acting identity and the scopes it may touch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    pub grants: Vec<ScopeGrant>,
}

impl Principal {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            grants: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_grant(mut self, grant: ScopeGrant) -> Self {
        self.grants.push(grant);
        self
    }

    /// Fail with [`StoreError::ScopeDenied`] unless some grant names `project`.
    pub fn authorize_project(&self, project: &str) -> StoreResult<()> {
        if self.grants.iter().any(|g| g.project == project) {
            Ok(())
        } else {
            Err(StoreError::ScopeDenied {
                principal: self.id.clone(),
                project: project.to_string(),
                environment: ANY_ENVIRONMENT.into(),
                path: "/".into(),
            })
        }
    }

    /// Fail with [`StoreError::ScopeDenied`] unless a grant covers the scope.
    pub fn authorize(&self, scope: &Scope) -> StoreResult<()> {
        if self
            .grants
            .iter()
            .any(|g| g.covers(&scope.project, &scope.environment, &scope.path))
        {
            Ok(())
        } else {
            Err(StoreError::ScopeDenied {
                principal: self.id.clone(),
                project: scope.project.clone(),
                environment: scope.environment.clone(),
                path: scope.path.to_string(),
            })
        }
    }
}

/// Per-call context: who is acting, and with which key.
#[derive(Debug, Clone)]
pub struct OpContext {
    pub principal: Principal,
    pub key: KeyRef,
}

impl OpContext {
    pub fn new(principal: Principal, key: KeyRef) -> Self {
        Self { principal, key }
    }

    /// Id of the acting principal.
    pub fn actor(&self) -> &str {
        &self.principal.id
    }

    pub fn authorize(&self, scope: &Scope) -> StoreResult<()> {
        self.principal.authorize(scope)
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════
