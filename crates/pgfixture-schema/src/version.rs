use crate::SchemaError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A PostgreSQL distribution the fixture knows how to run.
///
/// Variants are declared newest first. Resolution walks them in this order,
/// so a bare major token such as `"16"` always picks the same release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EngineVersion {
    V17,
    V16,
    V15,
    V14,
    V13,
    V12,
}

const ALL_VERSIONS: &[EngineVersion] = &[
    EngineVersion::V17,
    EngineVersion::V16,
    EngineVersion::V15,
    EngineVersion::V14,
    EngineVersion::V13,
    EngineVersion::V12,
];

impl EngineVersion {
    pub fn all() -> &'static [EngineVersion] {
        ALL_VERSIONS
    }

    /// Canonical distribution identifier, as it appears in download paths.
    pub fn as_download_path(self) -> &'static str {
        match self {
            EngineVersion::V17 => "17.2-1",
            EngineVersion::V16 => "16.6-1",
            EngineVersion::V15 => "15.10-1",
            EngineVersion::V14 => "14.15-1",
            EngineVersion::V13 => "13.18-1",
            EngineVersion::V12 => "12.22-1",
        }
    }

    pub fn major(self) -> u32 {
        match self {
            EngineVersion::V17 => 17,
            EngineVersion::V16 => 16,
            EngineVersion::V15 => 15,
            EngineVersion::V14 => 14,
            EngineVersion::V13 => 13,
            EngineVersion::V12 => 12,
        }
    }
}

impl fmt::Display for EngineVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_download_path())
    }
}

/// Resolve a free-form version token to a known distribution.
///
/// Returns the first distribution (in declaration order) whose download path
/// starts with the token. The token is matched as given: surrounding
/// whitespace is not stripped, and an empty token matches the newest entry.
pub fn resolve_version(token: &str) -> Result<EngineVersion, SchemaError> {
    if let Some(found) = ALL_VERSIONS
        .iter()
        .copied()
        .find(|v| v.as_download_path().starts_with(token))
    {
        return Ok(found);
    }

    let valid = ALL_VERSIONS
        .iter()
        .map(|v| v.as_download_path())
        .collect::<Vec<_>>()
        .join(", ");
    Err(SchemaError::UnknownVersion {
        token: token.to_owned(),
        valid,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_download_path_resolves_to_itself() {
        for v in EngineVersion::all() {
            assert_eq!(resolve_version(v.as_download_path()).unwrap(), *v);
        }
    }

    #[test]
    fn resolved_version_starts_with_token() {
        for token in ["17", "16", "16.6", "15.10-1", "14", "13.1", "12.22", "1"] {
            let v = resolve_version(token).unwrap();
            assert!(
                v.as_download_path().starts_with(token),
                "{v} does not start with {token}"
            );
        }
    }

    #[test]
    fn major_token_picks_declared_release() {
        assert_eq!(resolve_version("16").unwrap(), EngineVersion::V16);
        // declaration order decides between several matches
        assert_eq!(resolve_version("1").unwrap(), EngineVersion::V17);
    }

    #[test]
    fn unknown_token_names_token_and_valid_set() {
        let err = resolve_version("9.5").unwrap_err();
        let msg = err.to_string();
        assert!(matches!(err, SchemaError::UnknownVersion { .. }));
        assert!(msg.contains("9.5"));
        assert!(msg.contains("16.6-1"));
        assert!(msg.contains("12.22-1"));
    }

    #[test]
    fn empty_token_picks_newest() {
        assert_eq!(resolve_version("").unwrap(), EngineVersion::V17);
    }

    #[test]
    fn padded_token_is_not_trimmed() {
        let err = resolve_version(" 15 ").unwrap_err();
        assert!(matches!(
            err,
            SchemaError::UnknownVersion { ref token, .. } if token == " 15 "
        ));
    }

    #[test]
    fn major_matches_download_path() {
        for v in EngineVersion::all() {
            let prefix = format!("{}.", v.major());
            assert!(v.as_download_path().starts_with(&prefix));
        }
    }
}
