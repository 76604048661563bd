use {
    anyhow::{Result, bail},
    serde::{Deserialize, Serialize, de::Error},
    std::{fmt, str::FromStr},
};

/// Longest single name stored in a directory.
pub const MAX_NAME_LEN: usize = 255;

/// Absolute path inside a vault, always starting with `/`.
///
/// Paths are normalized on construction: no empty components,
/// no `.` or `..` components and no trailing slash (except for the root).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct VaultPath(String);

impl VaultPath {
    #[must_use]
    pub fn root() -> Self {
        Self("/".into())
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn join_one(&self, name: &str) -> Result<VaultPath> {
        check_name(name)?;
        let s = if self.is_root() {
            format!("/{name}")
        } else {
            format!("{}/{}", self.0, name)
        };
        Ok(Self(s))
    }

    pub fn join_multiple(&self, relative_path: &str) -> Result<VaultPath> {
        if relative_path.is_empty() {
            bail!("relative path cannot be empty");
        }
        let mut path = self.clone();
        for name in relative_path.split('/') {
            path = path.join_one(name)?;
        }
        Ok(path)
    }

    #[must_use]
    pub fn parent(&self) -> Option<VaultPath> {
        if self.is_root() {
            return None;
        }
        let pos = self.0.rfind('/')?;
        let parent = if pos == 0 { "/" } else { &self.0[..pos] };
        Some(Self(parent.into()))
    }

    #[must_use]
    pub fn last_name(&self) -> Option<&str> {
        if self.is_root() {
            None
        } else {
            self.0.rfind('/').map(|pos| &self.0[pos + 1..])
        }
    }

    /// Path components from the root downwards. Empty for the root.
    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|s| !s.is_empty())
    }

    /// Relative remainder of `self` below `base`. `None` if `self` is not strictly below `base`.
    #[must_use]
    pub fn strip_prefix(&self, base: &VaultPath) -> Option<&str> {
        let rest = if base.is_root() {
            self.0.strip_prefix('/')
        } else {
            self.0
                .strip_prefix(&base.0)
                .and_then(|prefix| prefix.strip_prefix('/'))
        };
        rest.filter(|s| !s.is_empty())
    }

    /// True if `self` is `other` or lies anywhere below it.
    #[must_use]
    pub fn starts_with(&self, other: &VaultPath) -> bool {
        self == other || self.strip_prefix(other).is_some()
    }
}

/// Checks a single directory entry name.
pub fn check_name(name: &str) -> Result<()> {
    if name.is_empty() {
        bail!("file name cannot be empty");
    }
    if name.len() > MAX_NAME_LEN {
        bail!("file name is too long ({} bytes)", name.len());
    }
    if name.contains('/') {
        bail!("file name cannot contain '/'");
    }
    if name.contains('\0') {
        bail!("file name cannot contain NUL");
    }
    if name == "." || name == ".." {
        bail!("invalid file name: {name:?}");
    }
    Ok(())
}

impl<'de> Deserialize<'de> for VaultPath {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s: String = Deserialize::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

impl FromStr for VaultPath {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some(rest) = s.strip_prefix('/') else {
            bail!("vault path must start with '/'");
        };
        if s.contains("//") {
            bail!("vault path cannot contain '//'");
        }
        let rest = rest.strip_suffix('/').unwrap_or(rest);
        if rest.is_empty() {
            return Ok(Self::root());
        }
        Self::root().join_multiple(rest)
    }
}

impl fmt::Display for VaultPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
