//! Tool version parsing and compatibility gate

use semver::{Version, VersionReq};

use crate::{Error, Result};

/// Default supported range for the infrastructure tool
pub const DEFAULT_VERSION_REQUIREMENT: &str = ">=1.0.0, <2.0.0";

/// Extract the version from `<tool> version` output.
///
/// Accepts the first whitespace-separated token of the form `vX.Y.Z`
/// (for example `Terraform v1.5.7`), optionally with a pre-release suffix.
pub fn parse_version(output: &str) -> Result<Version> {
    output
        .split_whitespace()
        .filter_map(|token| token.strip_prefix('v'))
        .find(|rest| rest.starts_with(|c: char| c.is_ascii_digit()))
        .ok_or_else(|| {
            Error::validation(format!(
                "no version found in tool output: {}",
                output.lines().next().unwrap_or_default()
            ))
        })
        .and_then(|raw| {
            Version::parse(raw)
                .map_err(|e| Error::validation(format!("invalid tool version '{}': {}", raw, e)))
        })
}

/// Fail unless `version` satisfies `requirement`
pub fn ensure_compatible(version: &Version, requirement: &str) -> Result<()> {
    let req = VersionReq::parse(requirement).map_err(|e| {
        Error::config(format!(
            "invalid version requirement '{}': {}",
            requirement, e
        ))
    })?;

    if req.matches(version) {
        Ok(())
    } else {
        Err(Error::ToolVersion {
            found: version.to_string(),
            required: requirement.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_first_line_of_version_output() {
        let out = "Terraform v1.5.7\non linux_amd64\n";
        assert_eq!(parse_version(out).unwrap(), Version::new(1, 5, 7));
    }

    #[test]
    fn skips_tokens_that_only_look_like_versions() {
        let out = "vendored build Terraform v1.6.0-beta1";
        let v = parse_version(out).unwrap();
        assert_eq!(v.major, 1);
        assert_eq!(v.minor, 6);
        assert!(!v.pre.is_empty());
    }

    #[test]
    fn output_without_version_is_rejected() {
        assert!(parse_version("command not understood").is_err());
        assert!(parse_version("").is_err());
    }

    #[test]
    fn version_inside_range_is_accepted() {
        ensure_compatible(&Version::new(1, 5, 7), DEFAULT_VERSION_REQUIREMENT).unwrap();
    }

    #[test]
    fn version_outside_range_is_rejected_with_both_versions() {
        let err = ensure_compatible(&Version::new(0, 13, 5), DEFAULT_VERSION_REQUIREMENT)
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("0.13.5"));
        assert!(msg.contains(">=1.0.0"));
    }

    #[test]
    fn malformed_requirement_is_a_config_error() {
        let err = ensure_compatible(&Version::new(1, 0, 0), "not a range").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
