//! Status codes surfaced by pager and reader operations.
//!
//! Errors raised on the I/O path travel through the lazy slot's failed
//! state as a 32-bit code, so every variant round-trips through
//! [`Status::code`] / [`Status::from_code`].

use std::fmt;

/// Status code returned by pager and reader operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Status {
    /// Operation completed successfully
    #[default]
    Ok = 0,
    /// Memory limits could not be satisfied, even after eviction
    OutOfMemory = 1,
    /// A read reached the end of the underlying file
    EndOfFile = 2,
    /// The file descriptor was rejected by the kernel
    InvalidFileDescriptor = 3,
    /// A buffer or offset fell outside the accessible address space
    ParamsOutsideAccessibleAddressSpace = 4,
    /// Any other failure
    UnexpectedError = 5,
}

impl Status {
    /// Check if the status indicates success
    #[inline]
    pub const fn is_ok(&self) -> bool {
        matches!(self, Status::Ok)
    }

    /// Check if the status indicates an error
    #[inline]
    pub const fn is_error(&self) -> bool {
        !self.is_ok()
    }

    /// Get the status as a string
    pub const fn as_str(&self) -> &'static str {
        match self {
            Status::Ok => "Ok",
            Status::OutOfMemory => "OutOfMemory",
            Status::EndOfFile => "EndOfFile",
            Status::InvalidFileDescriptor => "InvalidFileDescriptor",
            Status::ParamsOutsideAccessibleAddressSpace => {
                "ParamsOutsideAccessibleAddressSpace"
            }
            Status::UnexpectedError => "UnexpectedError",
        }
    }

    /// The 32-bit encoding stored in a failed lazy slot.
    #[inline]
    pub const fn code(&self) -> u32 {
        *self as u32
    }

    /// Decode a status previously encoded with [`Status::code`].
    ///
    /// Unknown codes collapse to [`Status::UnexpectedError`].
    pub const fn from_code(code: u32) -> Self {
        match code {
            0 => Status::Ok,
            1 => Status::OutOfMemory,
            2 => Status::EndOfFile,
            3 => Status::InvalidFileDescriptor,
            4 => Status::ParamsOutsideAccessibleAddressSpace,
            _ => Status::UnexpectedError,
        }
    }

    /// Map a raw OS error code (positive errno) from the completion ring.
    pub const fn from_errno(errno: i32) -> Self {
        match errno {
            libc::EBADF => Status::InvalidFileDescriptor,
            libc::EFAULT => Status::ParamsOutsideAccessibleAddressSpace,
            libc::ENOMEM => Status::OutOfMemory,
            _ => Status::UnexpectedError,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::error::Error for Status {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_checks() {
        assert!(Status::Ok.is_ok());
        assert!(!Status::Ok.is_error());

        assert!(Status::OutOfMemory.is_error());
        assert!(Status::EndOfFile.is_error());
        assert!(Status::UnexpectedError.is_error());
    }

    #[test]
    fn test_status_as_str() {
        assert_eq!(Status::Ok.as_str(), "Ok");
        assert_eq!(Status::OutOfMemory.as_str(), "OutOfMemory");
        assert_eq!(Status::EndOfFile.as_str(), "EndOfFile");
        assert_eq!(
            Status::InvalidFileDescriptor.as_str(),
            "InvalidFileDescriptor"
        );
        assert_eq!(
            Status::ParamsOutsideAccessibleAddressSpace.as_str(),
            "ParamsOutsideAccessibleAddressSpace"
        );
        assert_eq!(Status::UnexpectedError.as_str(), "UnexpectedError");
    }

    #[test]
    fn test_status_display() {
        assert_eq!(format!("{}", Status::EndOfFile), "EndOfFile");
        assert_eq!(format!("{}", Status::OutOfMemory), "OutOfMemory");
    }

    #[test]
    fn test_code_roundtrip() {
        for status in [
            Status::Ok,
            Status::OutOfMemory,
            Status::EndOfFile,
            Status::InvalidFileDescriptor,
            Status::ParamsOutsideAccessibleAddressSpace,
            Status::UnexpectedError,
        ] {
            assert_eq!(Status::from_code(status.code()), status);
        }
    }

    #[test]
    fn test_unknown_code_collapses() {
        assert_eq!(Status::from_code(999), Status::UnexpectedError);
    }

    #[test]
    fn test_from_errno() {
        assert_eq!(
            Status::from_errno(libc::EBADF),
            Status::InvalidFileDescriptor
        );
        assert_eq!(
            Status::from_errno(libc::EFAULT),
            Status::ParamsOutsideAccessibleAddressSpace
        );
        assert_eq!(Status::from_errno(libc::ENOMEM), Status::OutOfMemory);
        assert_eq!(Status::from_errno(libc::EIO), Status::UnexpectedError);
    }

    #[test]
    fn test_status_default() {
        assert_eq!(Status::default(), Status::Ok);
    }

    #[test]
    fn test_status_as_error_trait_object() {
        let err: Box<dyn std::error::Error> = Box::new(Status::EndOfFile);
        assert_eq!(err.to_string(), "EndOfFile");
    }
}
