//! Classification of repository-relative request paths into package coordinates.

use crate::validation::validate_package_name;
use crate::{AppError, AppResult};

/// Registry-special path serving the whole registry root.
pub const REGISTRY_ALL: &str = "all";

/// A metadata request against one repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackageRequest {
    /// `/`
    RegistryRoot,
    /// `/-/{path}`, e.g. `/-/all`
    RegistrySpecial { path: String },
    /// `/{name}`
    PackageRoot { name: String },
    /// `/{name}/{version-or-tag}`
    PackageVersion { name: String, version: String },
}

impl PackageRequest {
    /// Parse a repository-relative path.
    ///
    /// Scoped names may arrive as `@scope/name` or `@scope%2fname`. Any other
    /// shape (tarball paths included) is [`AppError::BadRequest`], letting the
    /// caller fall back to non-metadata handling.
    pub fn parse(path: &str) -> AppResult<Self> {
        let trimmed = path.trim_start_matches('/');
        if trimmed.is_empty() {
            return Ok(PackageRequest::RegistryRoot);
        }
        if let Some(special) = trimmed.strip_prefix("-/") {
            return Ok(PackageRequest::RegistrySpecial {
                path: special.trim_end_matches('/').to_string(),
            });
        }

        let decoded = trimmed.replace("%2f", "/").replace("%2F", "/");
        let segments: Vec<&str> = decoded.trim_end_matches('/').split('/').collect();
        let (name, rest) = match segments.as_slice() {
            [scope, bare, rest @ ..] if scope.starts_with('@') => (format!("{scope}/{bare}"), rest),
            [name, rest @ ..] => (name.to_string(), rest),
            [] => return Err(AppError::BadRequest(format!("Invalid package path: {path}"))),
        };
        validate_package_name(&name)?;

        match rest {
            [] => Ok(PackageRequest::PackageRoot { name }),
            [version] if !version.is_empty() && *version != "-" => Ok(PackageRequest::PackageVersion {
                name,
                version: version.to_string(),
            }),
            _ => Err(AppError::BadRequest(format!(
                "Not a package coordinate path: {path}"
            ))),
        }
    }

    /// Package name the request targets, if any.
    pub fn package_name(&self) -> Option<&str> {
        match self {
            PackageRequest::PackageRoot { name } | PackageRequest::PackageVersion { name, .. } => {
                Some(name)
            }
            PackageRequest::RegistryRoot | PackageRequest::RegistrySpecial { .. } => None,
        }
    }
}
