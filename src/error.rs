use std::io;

pub type Result<T> = std::result::Result<T, Error>;

/// Every failure the library reports. Most variants are pure domain
/// conditions; [`Error::Other`] wraps the underlying OS error whenever no
/// more specific classification applies.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("cgroup support is not compiled in")]
    NotCompiled,
    #[error("cgroup is not mounted")]
    NotMounted,
    #[error("cgroup does not exist")]
    DoesNotExist,
    #[error("cgroup has not been created")]
    NotCreated,
    #[error("one of the needed subsystems is not mounted")]
    SubsystemNotMounted,
    #[error("request came in from non owner")]
    NotOwner,
    #[error("controllers are bound to different mount points")]
    MultipleMountpoints,
    #[error("operation not allowed")]
    NotAllowed,
    #[error("value set exceeds maximum")]
    MaxExceeded,
    #[error("controller already exists")]
    ControllerExists,
    #[error("value already exists")]
    ValueExists,
    #[error("invalid operation")]
    InvalidOperation,
    #[error("creation of controller failed")]
    ControllerCreateFailed,
    #[error("operation failed")]
    Failed,
    #[error("cgroup is not initialized")]
    NotInitialised,
    #[error("control value does not exist")]
    ValueDoesNotExist,
    #[error("generic error")]
    Generic,
    #[error("values are not equal")]
    ValuesNotEqual,
    #[error("controllers are different")]
    ControllersDiffer,
    #[error("parsing failed")]
    ParseFailed,
    #[error("rules file does not exist")]
    RulesFileMissing,
    #[error("mounting failed")]
    MountFailed,
    #[error("the config file can not be opened")]
    ConfigNotOpenable,
    #[error("end of file or iterator")]
    Eof,
    #[error("{0}")]
    Other(#[from] io::Error),
}

impl Error {
    /// The raw OS errno behind this error, when one exists.
    pub fn os_error(&self) -> Option<i32> {
        match self {
            Error::Other(err) => err.raw_os_error(),
            _ => None,
        }
    }
}

impl From<procfs::ProcError> for Error {
    fn from(err: procfs::ProcError) -> Self {
        Error::Other(io::Error::new(io::ErrorKind::Other, err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_os_error_preserved() {
        let err = Error::from(io::Error::from_raw_os_error(13));
        assert_eq!(err.os_error(), Some(13));
        assert!(Error::NotMounted.os_error().is_none());
    }

    #[test]
    fn test_display_matches_domain() {
        assert_eq!(Error::NotMounted.to_string(), "cgroup is not mounted");
        assert_eq!(
            Error::SubsystemNotMounted.to_string(),
            "one of the needed subsystems is not mounted"
        );
        assert_eq!(Error::Eof.to_string(), "end of file or iterator");
    }
}
