//! Error types for kextmgr-core
//!
//! Every failure the manager can report maps to exactly one numeric code.
//! The codes are a wire contract: a forked load task exits with the code of
//! the error it hit, and the parent reconstructs the error from the exit
//! status, so they must never be renumbered.

use thiserror::Error;

/// Result type alias using kextmgr-core's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Error kinds for the kernel extension manager
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Composite or unclassified failure
    #[error("unspecified error")]
    Unspecified,

    /// Caller contract violation
    #[error("invalid argument: {reason}")]
    InvalidArgument { reason: String },

    /// Allocation failure
    #[error("no memory")]
    NoMemory,

    /// Permission or IO error at a bundle or cache path
    #[error("file access/permissions: {path}")]
    FileAccess { path: String },

    /// Path exists but is not a directory
    #[error("not a directory: {path}")]
    NotADirectory { path: String },

    /// Out of space during cache writing
    #[error("disk full")]
    DiskFull,

    /// Property-list serialization failed
    #[error("serialization error")]
    Serialization,

    /// Compression or decompression failed
    #[error("compression error")]
    Compression,

    /// Transport failure talking to the kernel
    #[error("IPC error")]
    Ipc,

    /// Forked load task died abnormally (signaled or stopped)
    #[error("forked task exited abnormally")]
    ChildTask,

    /// Interactive cancellation
    #[error("user canceled load")]
    UserAbort,

    /// Kernel resources unavailable
    #[error("kernel resources unavailable")]
    KernelResource,

    /// Kernel access denied
    #[error("kernel access denied")]
    KernelPermission,

    /// Lookup by identifier returned no head
    #[error("requested kernel extension could not be found: {identifier}")]
    KextNotFound { identifier: String },

    /// Bundle path does not lie within any registered repository
    #[error("URL for extension does not lie within repository: {path}")]
    UrlNotInRepository { path: String },

    /// Path is not a bundle
    #[error("not a bundle: {path}")]
    NotABundle { path: String },

    /// Bundle is not a kernel extension
    #[error("not a kernel extension: {path}")]
    NotAKext { path: String },

    /// Bundle failed its validity predicate
    #[error("validation error: {identifier}")]
    Validation { identifier: String },

    /// Bundle not eligible for safe boot while safe boot is in effect
    #[error("not eligible for boot level (safe boot): {identifier}")]
    BootLevel { identifier: String },

    /// Bundle is disabled
    #[error("extension is disabled: {identifier}")]
    Disabled { identifier: String },

    /// Bundle failed authentication
    #[error("authentication error: {identifier}")]
    Authentication { identifier: String },

    /// Dependency closure could not be resolved
    #[error("error resolving dependencies: {identifier}")]
    Dependency { identifier: String },

    /// Cycle detected in the dependency closure
    #[error("possible loop in dependencies: {identifier}")]
    DependencyLoop { identifier: String },

    /// On-disk cache disagrees with the filesystem
    #[error("cached extension info dictionary doesn't match actual: {path}")]
    Cache { path: String },

    /// Target version is already loaded
    #[error("extension is already loaded: {identifier}")]
    AlreadyLoaded { identifier: String },

    /// Target identifier is loaded at a different version
    #[error("a different version of extension {identifier} is already loaded")]
    LoadedVersionDiffers { identifier: String },

    /// A transitive dependency is loaded at a different version
    #[error("a different version of dependency extension {identifier} is already loaded")]
    DependencyLoadedVersionDiffers { identifier: String },

    /// Unusable executable
    #[error("bad executable")]
    LoadExecutableBad,

    /// Executable contains no code for this computer
    #[error("executable doesn't contain code for this computer")]
    LoadExecutableNoArch,

    /// Linker error
    #[error("link/load error")]
    LinkLoad,

    /// Kernel-side failure
    #[error("kernel error")]
    KernelError,
}

impl Error {
    /// The stable numeric code for this error kind (success is 0)
    pub fn code(&self) -> i32 {
        match self {
            Error::Unspecified => 1,
            Error::InvalidArgument { .. } => 2,
            Error::NoMemory => 3,
            Error::FileAccess { .. } => 4,
            Error::NotADirectory { .. } => 5,
            Error::DiskFull => 6,
            Error::Serialization => 7,
            Error::Compression => 8,
            Error::Ipc => 9,
            Error::ChildTask => 10,
            Error::UserAbort => 11,
            Error::KernelResource => 12,
            Error::KernelPermission => 13,
            Error::KextNotFound { .. } => 14,
            Error::UrlNotInRepository { .. } => 15,
            Error::NotABundle { .. } => 16,
            Error::NotAKext { .. } => 17,
            Error::Validation { .. } => 18,
            Error::BootLevel { .. } => 19,
            Error::Disabled { .. } => 20,
            Error::Authentication { .. } => 21,
            Error::Dependency { .. } => 22,
            Error::DependencyLoop { .. } => 23,
            Error::Cache { .. } => 24,
            Error::AlreadyLoaded { .. } => 25,
            Error::LoadedVersionDiffers { .. } => 26,
            Error::DependencyLoadedVersionDiffers { .. } => 27,
            Error::LoadExecutableBad => 28,
            Error::LoadExecutableNoArch => 29,
            Error::LinkLoad => 30,
            Error::KernelError => 31,
        }
    }

    /// Reconstruct an error from a numeric code
    ///
    /// Used by the parent side of a forked load to interpret the child's
    /// exit status. Codes that carry context in-process come back with the
    /// context blank; unknown codes collapse to `Unspecified`.
    pub fn from_code(code: i32) -> Self {
        match code {
            2 => Error::invalid_argument(""),
            3 => Error::NoMemory,
            4 => Error::file_access(""),
            5 => Error::not_a_directory(""),
            6 => Error::DiskFull,
            7 => Error::Serialization,
            8 => Error::Compression,
            9 => Error::Ipc,
            10 => Error::ChildTask,
            11 => Error::UserAbort,
            12 => Error::KernelResource,
            13 => Error::KernelPermission,
            14 => Error::kext_not_found(""),
            15 => Error::url_not_in_repository(""),
            16 => Error::not_a_bundle(""),
            17 => Error::not_a_kext(""),
            18 => Error::validation(""),
            19 => Error::boot_level(""),
            20 => Error::disabled(""),
            21 => Error::authentication(""),
            22 => Error::dependency(""),
            23 => Error::dependency_loop(""),
            24 => Error::cache(""),
            25 => Error::already_loaded(""),
            26 => Error::loaded_version_differs(""),
            27 => Error::dependency_loaded_version_differs(""),
            28 => Error::LoadExecutableBad,
            29 => Error::LoadExecutableNoArch,
            30 => Error::LinkLoad,
            31 => Error::KernelError,
            _ => Error::Unspecified,
        }
    }

    /// Whether two errors are of the same kind, ignoring context
    pub fn same_kind(&self, other: &Error) -> bool {
        self.code() == other.code()
    }

    /// Create an invalid argument error
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// Create a file access error
    pub fn file_access(path: impl Into<String>) -> Self {
        Self::FileAccess { path: path.into() }
    }

    /// Create a not-a-directory error
    pub fn not_a_directory(path: impl Into<String>) -> Self {
        Self::NotADirectory { path: path.into() }
    }

    /// Create a kext-not-found error
    pub fn kext_not_found(identifier: impl Into<String>) -> Self {
        Self::KextNotFound {
            identifier: identifier.into(),
        }
    }

    /// Create a URL-not-in-repository error
    pub fn url_not_in_repository(path: impl Into<String>) -> Self {
        Self::UrlNotInRepository { path: path.into() }
    }

    /// Create a not-a-bundle error
    pub fn not_a_bundle(path: impl Into<String>) -> Self {
        Self::NotABundle { path: path.into() }
    }

    /// Create a not-a-kext error
    pub fn not_a_kext(path: impl Into<String>) -> Self {
        Self::NotAKext { path: path.into() }
    }

    /// Create a validation error
    pub fn validation(identifier: impl Into<String>) -> Self {
        Self::Validation {
            identifier: identifier.into(),
        }
    }

    /// Create a boot-level error
    pub fn boot_level(identifier: impl Into<String>) -> Self {
        Self::BootLevel {
            identifier: identifier.into(),
        }
    }

    /// Create a disabled error
    pub fn disabled(identifier: impl Into<String>) -> Self {
        Self::Disabled {
            identifier: identifier.into(),
        }
    }

    /// Create an authentication error
    pub fn authentication(identifier: impl Into<String>) -> Self {
        Self::Authentication {
            identifier: identifier.into(),
        }
    }

    /// Create a dependency error
    pub fn dependency(identifier: impl Into<String>) -> Self {
        Self::Dependency {
            identifier: identifier.into(),
        }
    }

    /// Create a dependency-loop error
    pub fn dependency_loop(identifier: impl Into<String>) -> Self {
        Self::DependencyLoop {
            identifier: identifier.into(),
        }
    }

    /// Create a cache error
    pub fn cache(path: impl Into<String>) -> Self {
        Self::Cache { path: path.into() }
    }

    /// Create an already-loaded error
    pub fn already_loaded(identifier: impl Into<String>) -> Self {
        Self::AlreadyLoaded {
            identifier: identifier.into(),
        }
    }

    /// Create a loaded-version-differs error
    pub fn loaded_version_differs(identifier: impl Into<String>) -> Self {
        Self::LoadedVersionDiffers {
            identifier: identifier.into(),
        }
    }

    /// Create a dependency-loaded-version-differs error
    pub fn dependency_loaded_version_differs(identifier: impl Into<String>) -> Self {
        Self::DependencyLoadedVersionDiffers {
            identifier: identifier.into(),
        }
    }
}
