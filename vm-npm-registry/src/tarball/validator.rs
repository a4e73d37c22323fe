//! Tarball validator chain.
//!
//! Each validator is a plain function returning a tri-state verdict. A chain
//! accepts a tarball unless some validator says [`ValidationResult::Invalid`];
//! neutral verdicts carry no weight either way.

use super::{Tarball, TarballRequest};
use std::io::Read;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationResult {
    Invalid,
    Neutral,
    Valid,
}

pub type TarballCheck = fn(&TarballRequest, &Tarball) -> ValidationResult;

/// A named check, so rejections can be reported.
#[derive(Debug, Clone, Copy)]
pub struct Validator {
    pub name: &'static str,
    pub check: TarballCheck,
}

/// Mime types a tarball may sniff as.
pub const TARBALL_MIME_TYPES: &[&str] = &["application/x-gzip", "application/gzip"];

const SNIFF_LENGTH: usize = 512;

/// Hash, size and content-type checks, in that order.
pub fn default_validators() -> Vec<Validator> {
    vec![
        Validator {
            name: "sha1",
            check: validate_sha1,
        },
        Validator {
            name: "size",
            check: validate_size,
        },
        Validator {
            name: "content-type",
            check: validate_content_type,
        },
    ]
}

/// Run `validators` in order, stopping at the first rejection.
pub fn run_validators(validators: &[Validator], request: &TarballRequest, tarball: &Tarball) -> bool {
    for validator in validators {
        let verdict = (validator.check)(request, tarball);
        tracing::trace!(validator = validator.name, verdict = ?verdict, file = %request.target_file, "Tarball check");
        if verdict == ValidationResult::Invalid {
            tracing::warn!(
                repository = %request.repository_id,
                file = %request.target_file,
                url = %tarball.origin_url(),
                validator = validator.name,
                "Tarball rejected"
            );
            return false;
        }
    }
    true
}

/// Compare the received SHA1 with `dist.shasum`.
pub fn validate_sha1(_request: &TarballRequest, tarball: &Tarball) -> ValidationResult {
    match tarball.package_version().dist_shasum() {
        None => ValidationResult::Neutral,
        Some(expected) if expected.eq_ignore_ascii_case(tarball.sha1sum()) => ValidationResult::Valid,
        Some(_) => ValidationResult::Invalid,
    }
}

pub fn validate_size(_request: &TarballRequest, tarball: &Tarball) -> ValidationResult {
    if tarball.length() > 0 {
        ValidationResult::Valid
    } else {
        ValidationResult::Invalid
    }
}

/// Sniff the file's leading bytes and require a gzip archive.
pub fn validate_content_type(_request: &TarballRequest, tarball: &Tarball) -> ValidationResult {
    let mut head = Vec::with_capacity(SNIFF_LENGTH);
    let read = std::fs::File::open(tarball.path())
        .and_then(|file| file.take(SNIFF_LENGTH as u64).read_to_end(&mut head));
    if let Err(e) = read {
        tracing::warn!(error = %e, path = %tarball.path().display(), "Cannot read tarball for sniffing");
        return ValidationResult::Invalid;
    }
    match sniff_mime_type(&head) {
        Some(mime) if TARBALL_MIME_TYPES.contains(&mime) => ValidationResult::Valid,
        _ => ValidationResult::Invalid,
    }
}

/// Best-effort archive detection from magic bytes.
pub fn sniff_mime_type(head: &[u8]) -> Option<&'static str> {
    if head.starts_with(&[0x1f, 0x8b]) {
        Some("application/gzip")
    } else if head.starts_with(b"PK\x03\x04") {
        Some("application/zip")
    } else if head.starts_with(b"BZh") {
        Some("application/x-bzip2")
    } else if head.starts_with(&[0xfd, b'7', b'z', b'X', b'Z', 0x00]) {
        Some("application/x-xz")
    } else if head.len() >= 262 && &head[257..262] == b"ustar" {
        Some("application/x-tar")
    } else if head.first().is_some_and(|b| matches!(b, b'{' | b'[' | b'<')) {
        Some("text/plain")
    } else {
        None
    }
}
