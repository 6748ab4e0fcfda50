use thiserror::Error;

use crate::blockdev::BlockDeviceError;

/// Errors reported by the filesystem layer.
///
/// Every variant has a POSIX counterpart, see [`Error::errno`].
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] BlockDeviceError),
    #[error("File or directory not found")]
    NotFound,
    #[error("File or directory already exists")]
    AlreadyExists,
    #[error("Not a directory")]
    NotADirectory,
    #[error("Is a directory")]
    IsADirectory,
    #[error("Directory not empty")]
    NotEmpty,
    #[error("Invalid argument")]
    InvalidArgument,
    #[error("No space left on device")]
    NoSpace,
    #[error("Out of memory")]
    NoMemory,
    #[error("Corrupted filesystem")]
    Corrupt,
    #[error("File name too long")]
    NameTooLong,
    #[error("File too large")]
    FileTooLarge,
    #[error("No such device")]
    NoDevice,
}

impl Error {
    /// Negative POSIX errno for this error.
    pub fn errno(&self) -> i32 {
        let code = match self {
            Error::Io(_) => libc::EIO,
            Error::NotFound => libc::ENOENT,
            Error::AlreadyExists => libc::EEXIST,
            Error::NotADirectory => libc::ENOTDIR,
            Error::IsADirectory => libc::EISDIR,
            Error::NotEmpty => libc::ENOTEMPTY,
            Error::InvalidArgument => libc::EINVAL,
            Error::NoSpace => libc::ENOSPC,
            Error::NoMemory => libc::ENOMEM,
            Error::Corrupt => libc::EILSEQ,
            Error::NameTooLong => libc::ENAMETOOLONG,
            Error::FileTooLarge => libc::EFBIG,
            Error::NoDevice => libc::ENODEV,
        };
        -code
    }

    /// True for errors that mean a block could not be trusted and should
    /// be relocated rather than reported.
    pub(crate) fn is_corrupt(&self) -> bool {
        matches!(self, Error::Corrupt)
    }
}

impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(BlockDeviceError::Io(e)) => e,
            other => std::io::Error::from_raw_os_error(-other.errno()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(Error::NotFound.errno(), -libc::ENOENT);
        assert_eq!(Error::Corrupt.errno(), -libc::EILSEQ);
        assert_eq!(Error::NotEmpty.errno(), -libc::ENOTEMPTY);
        assert_eq!(Error::FileTooLarge.errno(), -libc::EFBIG);
        assert_eq!(Error::Io(BlockDeviceError::ReadOnly).errno(), -libc::EIO);
    }

    #[test]
    fn test_into_io_error() {
        let err: std::io::Error = Error::NoSpace.into();
        assert_eq!(err.raw_os_error(), Some(libc::ENOSPC));
    }
}
