// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Client-visible error taxonomy.
//!
//! Every request-path failure is surfaced as a POSIX errno; background
//! subsystems never propagate here, they export a state tag on the owning
//! file system or group and log instead.

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MgmError {
    #[error("permission denied: {0}")]
    Permission(String),

    #[error("access denied: {0}")]
    Access(String),

    #[error("no such entry: {0}")]
    NotFound(String),

    #[error("entry exists: {0}")]
    Exists(String),

    #[error("is a directory: {0}")]
    IsDirectory(String),

    #[error("not a directory: {0}")]
    NotDirectory(String),

    #[error("no space left: {0}")]
    NoSpace(String),

    #[error("quota exceeded: {0}")]
    Quota(String),

    #[error("no replica usable: {0}")]
    Offline(String),

    #[error("file has no locations: {0}")]
    NoDevice(String),

    #[error("read-only file system: {0}")]
    ReadOnly(String),

    #[error("layout degraded, reconstruction needed: {0}")]
    StripeShort(String),

    #[error("capability too long: {0}")]
    CapabilityTooLong(String),

    #[error("signing failure: {0}")]
    SignFailure(String),

    #[error("internal consistency violation: {0}")]
    Internal(String),

    #[error("operation not supported: {0}")]
    Unsupported(String),

    #[error("file was removed: {0}")]
    Removed(String),

    #[error("invalid argument: {0}")]
    Invalid(String),

    #[error("not empty: {0}")]
    NotEmpty(String),
}

impl MgmError {
    /// POSIX code handed back to the wire layer.
    pub fn errno(&self) -> i32 {
        match self {
            Self::Permission(_) => libc::EPERM,
            Self::Access(_) => libc::EACCES,
            Self::NotFound(_) => libc::ENOENT,
            Self::Exists(_) => libc::EEXIST,
            Self::IsDirectory(_) => libc::EISDIR,
            Self::NotDirectory(_) => libc::ENOTDIR,
            Self::NoSpace(_) => libc::ENOSPC,
            Self::Quota(_) => libc::EDQUOT,
            Self::Offline(_) => libc::ENONET,
            Self::NoDevice(_) => libc::ENODEV,
            Self::ReadOnly(_) => libc::EROFS,
            Self::StripeShort(_) => libc::EXDEV,
            Self::CapabilityTooLong(_) => libc::ENOMEM,
            Self::SignFailure(_) => libc::EADV,
            Self::Internal(_) => libc::EIO,
            Self::Unsupported(_) => libc::EOPNOTSUPP,
            Self::Removed(_) => libc::EIDRM,
            Self::Invalid(_) => libc::EINVAL,
            Self::NotEmpty(_) => libc::ENOTEMPTY,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(MgmError::Quota("q".into()).errno(), libc::EDQUOT);
        assert_eq!(MgmError::StripeShort("s".into()).errno(), libc::EXDEV);
        assert_eq!(MgmError::Removed("r".into()).errno(), libc::EIDRM);
    }
}
