//! Target labels.

use std::fmt;
use std::str::FromStr;

use color_eyre::{
    Result,
    eyre::bail,
};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A target label of the form `//package/path:name`.
///
/// The package path may be empty (`//:name`); the name never is. Labels
/// render back to the same form and serialize as that string.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct Label {
    package: String,
    name: String,
}

impl Label {
    /// Parse a label, validating both components.
    pub fn parse(form: impl AsRef<str>) -> Result<Self> {
        form.as_ref().parse()
    }

    /// The package path, possibly empty.
    pub fn package(&self) -> &str {
        &self.package
    }

    /// The target name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The directory prefix this label contributes to its artifacts'
    /// roots: the package path joined with the target name.
    pub fn as_root(&self) -> String {
        if self.package.is_empty() {
            self.name.clone()
        } else {
            format!("{}/{}", self.package, self.name)
        }
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "//{}:{}", self.package, self.name)
    }
}

impl FromStr for Label {
    type Err = color_eyre::Report;

    fn from_str(form: &str) -> Result<Self> {
        let Some(rest) = form.strip_prefix("//") else {
            bail!("label must start with '//': {form:?}");
        };
        let Some((package, name)) = rest.split_once(':') else {
            bail!("label must contain ':': {form:?}");
        };
        if name.is_empty() || name.contains('/') || name.contains(':') {
            bail!("invalid target name in label: {form:?}");
        }
        for component in package.split('/') {
            if package.is_empty() {
                break;
            }
            if component.is_empty() || component == "." || component == ".." {
                bail!("invalid package component in label: {form:?}");
            }
        }
        Ok(Self {
            package: package.to_string(),
            name: name.to_string(),
        })
    }
}

impl Serialize for Label {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Label {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let form = String::deserialize(deserializer)?;
        form.parse().map_err(serde::de::Error::custom)
    }
}
