use std::fmt;
use std::io;

/// Custom error type for InstanceForge.
/// Carries the OS detail behind a failed probe or a rejected configuration.
#[derive(Debug)]
pub enum ForgeError {
    /// Standard IO errors (lock file creation, signal registration, etc.)
    Io(io::Error),
    /// The namespace or flag cannot form a valid token.
    InvalidToken(String),
    /// No named shared memory facility exists on this target.
    Unsupported,
    /// (Windows) Specific Win32 API error code.
    #[cfg(not(unix))]
    Win32Error(u32),
    /// (Unix) Specific system call failure (shmget, shmat, flock).
    #[cfg(unix)]
    SyscallError { call: &'static str, errno: i32 },
}

impl ForgeError {
    /// Builds a `SyscallError` from the calling thread's `errno`.
    #[cfg(all(unix, not(any(target_os = "android", target_os = "ios"))))]
    pub(crate) fn last_syscall(call: &'static str) -> Self {
        ForgeError::SyscallError {
            call,
            errno: io::Error::last_os_error().raw_os_error().unwrap_or(0),
        }
    }
}

impl fmt::Display for ForgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForgeError::Io(err) => write!(f, "IO Error: {}", err),
            ForgeError::InvalidToken(msg) => write!(f, "Invalid instance token: {}", msg),
            ForgeError::Unsupported => {
                write!(f, "Named shared memory is not available on this platform")
            }
            #[cfg(not(unix))]
            ForgeError::Win32Error(code) => write!(f, "Win32 API Error Code: {}", code),
            #[cfg(unix)]
            ForgeError::SyscallError { call, errno } => {
                write!(f, "Syscall '{}' failed with errno {}", call, errno)
            }
        }
    }
}

impl std::error::Error for ForgeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ForgeError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for ForgeError {
    fn from(err: io::Error) -> Self {
        ForgeError::Io(err)
    }
}

/// A specialized Result type for InstanceForge operations.
pub type ForgeResult<T> = Result<T, ForgeError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn io_errors_keep_their_source() {
        let err = ForgeError::from(io::Error::new(io::ErrorKind::NotFound, "gone"));
        assert!(err.source().is_some());
        assert!(err.to_string().contains("gone"));
    }

    #[test]
    fn token_errors_have_no_source() {
        let err = ForgeError::InvalidToken("empty namespace".into());
        assert!(err.source().is_none());
        assert_eq!(err.to_string(), "Invalid instance token: empty namespace");
    }

    #[cfg(unix)]
    #[test]
    fn syscall_errors_name_the_call() {
        let err = ForgeError::SyscallError { call: "shmget", errno: 13 };
        assert_eq!(err.to_string(), "Syscall 'shmget' failed with errno 13");
    }
}
