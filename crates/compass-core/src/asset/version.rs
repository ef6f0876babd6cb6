//! `major.minor` version strings carried by every asset.

use crate::error::{InvalidError, Result};

/// Version assigned to a newly inserted asset.
pub const BASE_VERSION: &str = "0.1";

/// Split a version string into its numeric components.
pub fn parse_version(version: &str) -> Result<(u64, u64)> {
    let invalid = || InvalidError::Version(version.to_string());
    let (major, minor) = version.split_once('.').ok_or_else(invalid)?;
    let major = major.parse::<u64>().map_err(|_| invalid())?;
    let minor = minor.parse::<u64>().map_err(|_| invalid())?;
    Ok((major, minor))
}

/// Bump the minor component: `0.9` becomes `0.10`.
pub fn increase_minor_version(version: &str) -> Result<String> {
    let (major, minor) = parse_version(version)?;
    Ok(format!("{major}.{}", minor + 1))
}
