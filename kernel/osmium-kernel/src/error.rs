#![allow(dead_code)]

/// POSIX error numbers, as returned (negated) through the syscall ABI.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Errno {
    EPERM = 1,    /* Operation not permitted */
    ENOENT = 2,   /* No such file or directory */
    ESRCH = 3,    /* No such process */
    EINTR = 4,    /* Interrupted system call */
    EIO = 5,      /* I/O error */
    ENXIO = 6,    /* No such device or address */
    E2BIG = 7,    /* Argument list too long */
    ENOEXEC = 8,  /* Exec format error */
    EBADF = 9,    /* Bad file number */
    ECHILD = 10,  /* No child processes */
    EAGAIN = 11,  /* Try again */
    ENOMEM = 12,  /* Out of memory */
    EACCES = 13,  /* Permission denied */
    EFAULT = 14,  /* Bad address */
    EBUSY = 16,   /* Device or resource busy */
    EEXIST = 17,  /* File exists */
    EXDEV = 18,   /* Cross-device link */
    ENODEV = 19,  /* No such device */
    ENOTDIR = 20, /* Not a directory */
    EISDIR = 21,  /* Is a directory */
    EINVAL = 22,  /* Invalid argument */
    ENFILE = 23,  /* File table overflow */
    EMFILE = 24,  /* Too many open files */
    ETXTBSY = 26, /* Text file busy */
    EFBIG = 27,   /* File too large */
    ENOSPC = 28,  /* No space left on device */
    ESPIPE = 29,  /* Illegal seek */
    EROFS = 30,   /* Read-only file system */
    EMLINK = 31,  /* Too many links */
    EPIPE = 32,   /* Broken pipe */
    ERANGE = 34,  /* Math result not representable */

    EDEADLK = 35,      /* Resource deadlock would occur */
    ENAMETOOLONG = 36, /* File name too long */
    ENOSYS = 38,       /* Invalid system call number */
    ENOTEMPTY = 39,    /* Directory not empty */
    ELOOP = 40,        /* Too many symbolic links encountered */
    EOVERFLOW = 75,    /* Value too large for defined data type */
    ETIMEDOUT = 110,   /* Connection timed out */
}

/// The kernel-internal error: an errno plus an optional static note for
/// the log.
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

    /// The value a syscall returns for this error.
    pub const fn as_retval(&self) -> isize {
        -(self.errno as i32 as isize)
    }
}

impl From<Errno> for Error {
    fn from(errno: Errno) -> Self {
        Error::new(errno)
    }
}

impl From<osmium_frame::Error> for Error {
    fn from(frame_error: osmium_frame::Error) -> Self {
        match frame_error {
            osmium_frame::Error::InvalidArgs => Error::new(Errno::EINVAL),
            osmium_frame::Error::NoMemory => Error::new(Errno::ENOMEM),
            osmium_frame::Error::PageFault => Error::new(Errno::EFAULT),
            osmium_frame::Error::AccessDenied => Error::new(Errno::EACCES),
            osmium_frame::Error::IoError => Error::new(Errno::EIO),
            osmium_frame::Error::NotEnoughResources => Error::new(Errno::EBUSY),
            osmium_frame::Error::Overflow => Error::new(Errno::EOVERFLOW),
            osmium_frame::Error::Interrupted => Error::new(Errno::EINTR),
            osmium_frame::Error::TimedOut => Error::new(Errno::ETIMEDOUT),
            osmium_frame::Error::WouldBlock => Error::new(Errno::EAGAIN),
        }
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
