//! # Input Validation
//!
//! Checks applied to names that end up as filesystem paths: package names
//! (metadata store keys, artifact directories) and artifact filenames.
//! Both reject path traversal before anything touches the disk.

use crate::{AppError, AppResult};

/// npm's own upper bound for package names, scope included.
pub const MAX_PACKAGE_NAME_LENGTH: usize = 214;

const MAX_FILENAME_LENGTH: usize = 255;

const RESERVED_WINDOWS_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Validate a filename to prevent path traversal attacks.
///
/// Rejects filenames that are empty or longer than 255 characters, contain
/// null bytes, control characters or parent directory references, are
/// absolute (Unix, Windows or drive-letter), or are reserved Windows names.
///
/// # Examples
///
/// ```
/// # use vm_npm_registry::validation::validate_filename;
/// assert!(validate_filename("left-pad-1.3.0.tgz").is_ok());
/// assert!(validate_filename("../etc/passwd").is_err());
/// assert!(validate_filename("/absolute/path").is_err());
/// assert!(validate_filename("file\0name").is_err());
/// ```
pub fn validate_filename(filename: &str) -> AppResult<()> {
    if filename.is_empty() {
        tracing::warn!("Empty filename provided");
        return Err(AppError::BadRequest("Filename cannot be empty".to_string()));
    }

    if filename.len() > MAX_FILENAME_LENGTH {
        tracing::warn!(filename = %filename, length = %filename.len(), "Filename too long");
        return Err(AppError::BadRequest(format!(
            "Filename too long: {} characters (max: {})",
            filename.len(),
            MAX_FILENAME_LENGTH
        )));
    }

    if filename.contains('\0') {
        tracing::warn!(filename = %filename, "Null byte detected in filename");
        return Err(AppError::BadRequest(
            "Filename contains null byte".to_string(),
        ));
    }

    if filename.chars().any(|c| c.is_control()) {
        tracing::warn!(filename = %filename, "Control character detected in filename");
        return Err(AppError::BadRequest(
            "Filename contains control characters".to_string(),
        ));
    }

    if filename.contains("..") {
        tracing::warn!(filename = %filename, "Path traversal attempt detected (..)");
        return Err(AppError::BadRequest(
            "Filename contains parent directory reference (..)".to_string(),
        ));
    }

    if filename.contains('/') || filename.contains('\\') {
        tracing::warn!(filename = %filename, "Path separator detected in filename");
        return Err(AppError::BadRequest(
            "Filename cannot contain path separators".to_string(),
        ));
    }

    let mut chars = filename.chars();
    if let (Some(first), Some(':')) = (chars.next(), chars.next()) {
        if first.is_ascii_alphabetic() {
            tracing::warn!(filename = %filename, "Windows drive letter detected");
            return Err(AppError::BadRequest(
                "Filename cannot contain drive letter".to_string(),
            ));
        }
    }

    let base_name = match filename.rfind('.') {
        Some(dot_pos) => &filename[..dot_pos],
        None => filename,
    };
    if RESERVED_WINDOWS_NAMES
        .iter()
        .any(|&reserved| base_name.eq_ignore_ascii_case(reserved))
    {
        tracing::warn!(filename = %filename, base_name = %base_name,
                      "Reserved Windows filename detected");
        return Err(AppError::BadRequest(format!(
            "Filename '{}' is reserved on Windows systems",
            base_name
        )));
    }

    Ok(())
}

/// Validate an npm package name, optionally scoped (`@scope/name`).
///
/// Legacy upper-case names are accepted since a proxy has to serve whatever
/// the upstream registry holds.
pub fn validate_package_name(name: &str) -> AppResult<()> {
    if name.is_empty() {
        return Err(AppError::BadRequest(
            "Package name cannot be empty".to_string(),
        ));
    }

    if name.len() > MAX_PACKAGE_NAME_LENGTH {
        return Err(AppError::BadRequest(format!(
            "Package name too long: {} characters (max: {})",
            name.len(),
            MAX_PACKAGE_NAME_LENGTH
        )));
    }

    let (scope, bare) = match name.strip_prefix('@') {
        Some(scoped) => match scoped.split_once('/') {
            Some((scope, bare)) => (Some(scope), bare),
            None => {
                return Err(AppError::BadRequest(format!(
                    "Scoped package name '{name}' is missing the '/' separator"
                )))
            }
        },
        None => (None, name),
    };

    for part in scope.into_iter().chain(std::iter::once(bare)) {
        if part.is_empty() || part.starts_with('.') || part.starts_with('_') {
            return Err(AppError::BadRequest(format!(
                "Invalid package name '{name}'"
            )));
        }
        if !part
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '~'))
        {
            tracing::warn!(package = %name, "Invalid characters in package name");
            return Err(AppError::BadRequest(format!(
                "Package name '{name}' contains invalid characters"
            )));
        }
    }

    Ok(())
}
