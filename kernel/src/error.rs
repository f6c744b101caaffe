// SPDX-License-Identifier: MPL-2.0

use core::fmt;

use num_enum::TryFromPrimitiveError;

/// Error number.
///
/// The values follow the Linux numbering, which is what System V IPC callers
/// compare against.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Errno {
    EPERM = 1,    /* Operation not permitted */
    ENOENT = 2,   /* No such file or directory */
    EINTR = 4,    /* Interrupted system call */
    E2BIG = 7,    /* Argument list too long */
    EAGAIN = 11,  /* Try again */
    ENOMEM = 12,  /* Out of memory */
    EACCES = 13,  /* Permission denied */
    EFAULT = 14,  /* Bad address */
    EEXIST = 17,  /* File exists */
    EINVAL = 22,  /* Invalid argument */
    EFBIG = 27,   /* File too large */
    ENOSPC = 28,  /* No space left on device */
    ERANGE = 34,  /* Math result not representable */
    ENOMSG = 42,  /* No message of desired type */
    EIDRM = 43,   /* Identifier removed */
}

/// error used in this crate
#[derive(Debug, Clone, Copy)]
pub struct Error {
    errno: Errno,
    msg: Option<&'static str>,
}

impl Error {
    pub const fn new(errno: Errno) -> Self {
        Error { errno, msg: None }
    }

    pub const fn with_message(errno: Errno, msg: &'static str) -> Self {
        Error {
            errno,
            msg: Some(msg),
        }
    }

    pub const fn error(&self) -> Errno {
        self.errno
    }

    pub const fn message(&self) -> Option<&'static str> {
        self.msg
    }
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        self.errno == other.errno
    }
}

impl Eq for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.msg {
            Some(msg) => write!(f, "{:?}: {}", self.errno, msg),
            None => write!(f, "{:?}", self.errno),
        }
    }
}

impl From<Errno> for Error {
    fn from(errno: Errno) -> Self {
        Error::new(errno)
    }
}

impl AsRef<Error> for Error {
    fn as_ref(&self) -> &Error {
        self
    }
}

impl From<banker::BankerError> for Error {
    fn from(error: banker::BankerError) -> Self {
        match error {
            banker::BankerError::NoSuchTask => {
                Error::with_message(Errno::EINVAL, "Task has no allocation row")
            }
            banker::BankerError::NoSuchClass => {
                Error::with_message(Errno::EINVAL, "Resource class does not exist")
            }
            banker::BankerError::ClaimBelowAllocation => {
                Error::with_message(Errno::EINVAL, "Claim is below the current allocation")
            }
            banker::BankerError::ExcessRelease => {
                Error::with_message(Errno::EINVAL, "Release exceeds the current allocation")
            }
            banker::BankerError::Overflow => {
                Error::with_message(Errno::ERANGE, "Resource count overflows")
            }
        }
    }
}

impl<T: num_enum::TryFromPrimitive> From<TryFromPrimitiveError<T>> for Error {
    fn from(_: TryFromPrimitiveError<T>) -> Self {
        Error::with_message(Errno::EINVAL, "Invalid enum value")
    }
}

#[macro_export]
macro_rules! return_errno {
    ($errno: expr) => {
        return Err($crate::error::Error::new($errno))
    };
}

#[macro_export]
macro_rules! return_errno_with_message {
    ($errno: expr, $message: expr) => {
        return Err($crate::error::Error::with_message($errno, $message))
    };
}
