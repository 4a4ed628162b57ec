//! Reference value types identifying recipes and built packages.
//!
//! A recipe reference renders as `name/version[@user[/channel]][#revision]`;
//! a package reference appends `:<package-id>[#package-revision]`. Revisions
//! are content hashes and participate in full equality, while storage lookups
//! that must ignore them go through [`RecipeReference::base_key`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Errors produced when parsing or validating references.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ReferenceError {
    #[error("[DP600] invalid {field} {value:?}: {reason}")]
    InvalidComponent {
        field: &'static str,
        value: String,
        reason: &'static str,
    },
    #[error("[DP600] malformed reference {input:?}: {reason}")]
    Malformed { input: String, reason: &'static str },
}

fn check_component(field: &'static str, value: &str) -> Result<(), ReferenceError> {
    if value.is_empty() {
        return Err(ReferenceError::InvalidComponent {
            field,
            value: value.to_string(),
            reason: "must not be empty",
        });
    }
    if value.contains(['/', '\\']) {
        return Err(ReferenceError::InvalidComponent {
            field,
            value: value.to_string(),
            reason: "must not contain path separators",
        });
    }
    if value.contains(char::is_whitespace) {
        return Err(ReferenceError::InvalidComponent {
            field,
            value: value.to_string(),
            reason: "must not contain whitespace",
        });
    }
    if value.contains("..") {
        return Err(ReferenceError::InvalidComponent {
            field,
            value: value.to_string(),
            reason: "must not contain '..'",
        });
    }
    Ok(())
}

fn check_hash_token(field: &'static str, value: &str) -> Result<(), ReferenceError> {
    if value.is_empty() {
        return Err(ReferenceError::InvalidComponent {
            field,
            value: value.to_string(),
            reason: "must not be empty",
        });
    }
    if !value.bytes().all(|b| b.is_ascii_alphanumeric()) {
        return Err(ReferenceError::InvalidComponent {
            field,
            value: value.to_string(),
            reason: "must be alphanumeric",
        });
    }
    Ok(())
}

/// Identifies a recipe: name, version, optional user/channel namespace, and
/// an optional immutable revision (content hash of the exported recipe).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecipeReference {
    pub name: String,
    pub version: String,
    pub user: Option<String>,
    pub channel: Option<String>,
    pub revision: Option<String>,
}

impl RecipeReference {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            user: None,
            channel: None,
            revision: None,
        }
    }

    #[must_use]
    pub fn with_user_channel(
        mut self,
        user: impl Into<String>,
        channel: impl Into<String>,
    ) -> Self {
        self.user = Some(user.into());
        self.channel = Some(channel.into());
        self
    }

    /// Return a copy of this reference with the revision bound.
    #[must_use]
    pub fn with_revision(&self, revision: impl Into<String>) -> Self {
        let mut copy = self.clone();
        copy.revision = Some(revision.into());
        copy
    }

    /// Validate every present component against the storage addressing rules.
    pub fn validate(&self) -> Result<(), ReferenceError> {
        check_component("name", &self.name)?;
        check_component("version", &self.version)?;
        if let Some(user) = &self.user {
            check_component("user", user)?;
        }
        if let Some(channel) = &self.channel {
            check_component("channel", channel)?;
        }
        if let Some(revision) = &self.revision {
            check_hash_token("revision", revision)?;
        }
        Ok(())
    }

    /// Canonical revision-ignoring identity string, used as the storage
    /// addressing key and as the latest-revision lookup key. Absent user or
    /// channel render as `_`, which validation keeps unambiguous (an actual
    /// empty component is rejected).
    #[must_use]
    pub fn base_key(&self) -> String {
        format!(
            "{}/{}@{}/{}",
            self.name,
            self.version,
            self.user.as_deref().unwrap_or("_"),
            self.channel.as_deref().unwrap_or("_"),
        )
    }

    /// True when `other` names the same recipe, ignoring revisions on both
    /// sides.
    #[must_use]
    pub fn matches_base(&self, other: &Self) -> bool {
        self.name == other.name
            && self.version == other.version
            && self.user == other.user
            && self.channel == other.channel
    }

    pub fn parse(input: &str) -> Result<Self, ReferenceError> {
        let malformed = |reason| ReferenceError::Malformed {
            input: input.to_string(),
            reason,
        };

        let (body, revision) = match input.split_once('#') {
            Some((body, rev)) => (body, Some(rev.to_string())),
            None => (input, None),
        };
        let (path, namespace) = match body.split_once('@') {
            Some((path, ns)) => (path, Some(ns)),
            None => (body, None),
        };
        let (name, version) = path
            .split_once('/')
            .ok_or_else(|| malformed("expected name/version"))?;

        let (user, channel) = match namespace {
            Some(ns) => match ns.split_once('/') {
                Some((user, channel)) => {
                    (Some(user.to_string()), Some(channel.to_string()))
                }
                None => (Some(ns.to_string()), None),
            },
            None => (None, None),
        };

        let reference = Self {
            name: name.to_string(),
            version: version.to_string(),
            user,
            channel,
            revision,
        };
        reference.validate()?;
        Ok(reference)
    }
}

impl fmt::Display for RecipeReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.name, self.version)?;
        if let Some(user) = &self.user {
            write!(f, "@{user}")?;
            if let Some(channel) = &self.channel {
                write!(f, "/{channel}")?;
            }
        }
        if let Some(revision) = &self.revision {
            write!(f, "#{revision}")?;
        }
        Ok(())
    }
}

impl FromStr for RecipeReference {
    type Err = ReferenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Identifies a built package: a recipe reference plus the package-id (hash
/// of the build configuration) and an optional package revision (content
/// hash of the built artifacts).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PackageReference {
    pub recipe: RecipeReference,
    pub package_id: String,
    pub revision: Option<String>,
}

impl PackageReference {
    pub fn new(recipe: RecipeReference, package_id: impl Into<String>) -> Self {
        Self {
            recipe,
            package_id: package_id.into(),
            revision: None,
        }
    }

    #[must_use]
    pub fn with_revision(&self, revision: impl Into<String>) -> Self {
        let mut copy = self.clone();
        copy.revision = Some(revision.into());
        copy
    }

    pub fn validate(&self) -> Result<(), ReferenceError> {
        self.recipe.validate()?;
        check_hash_token("package-id", &self.package_id)?;
        if let Some(revision) = &self.revision {
            check_hash_token("package-revision", revision)?;
        }
        Ok(())
    }

    pub fn parse(input: &str) -> Result<Self, ReferenceError> {
        let (recipe_part, package_part) =
            input.split_once(':').ok_or_else(|| ReferenceError::Malformed {
                input: input.to_string(),
                reason: "expected ':' before package-id",
            })?;
        let recipe = RecipeReference::parse(recipe_part)?;
        let (package_id, revision) = match package_part.split_once('#') {
            Some((id, rev)) => (id.to_string(), Some(rev.to_string())),
            None => (package_part.to_string(), None),
        };
        let reference = Self {
            recipe,
            package_id,
            revision,
        };
        reference.validate()?;
        Ok(reference)
    }
}

impl fmt::Display for PackageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.recipe, self.package_id)?;
        if let Some(revision) = &self.revision {
            write!(f, "#{revision}")?;
        }
        Ok(())
    }
}

impl FromStr for PackageReference {
    type Err = ReferenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
