// SPDX-License-Identifier: MPL-2.0

/// Error number.
///
/// Only the conditions this subsystem can actually surface are listed; the
/// values match the conventional errno assignments.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Errno {
    ENOENT = 2,      /* No such entry */
    EINTR = 4,       /* Interrupted */
    EIO = 5,         /* I/O error */
    EAGAIN = 11,     /* Try again */
    ENOMEM = 12,     /* Out of memory */
    EACCES = 13,     /* Permission denied */
    EFAULT = 14,     /* Bad address */
    EBUSY = 16,      /* Resource busy */
    ENODEV = 19,     /* No such device */
    EINVAL = 22,     /* Invalid argument */
    ENOSPC = 28,     /* No space left on backing store */
    EOPNOTSUPP = 95, /* Operation not supported by this pager */
}

/// Error used in this crate.
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
