//! Error types for archive packing.

use miette::Diagnostic;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for archive operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while packing an archive.
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// The destination extension selects no known format.
    #[error("Unsupported archive extension '{extension}' for {}", path.display())]
    #[diagnostic(
        code(kubetools::archive::unsupported_extension),
        help("Use a destination ending in .zip, .tar.gz or .gz")
    )]
    UnsupportedArchiveExtension {
        /// The rejected extension, empty when there is none
        extension: String,
        /// The destination path
        path: PathBuf,
    },

    /// The source pattern is not a valid glob.
    #[error("Invalid source pattern '{pattern}': {source}")]
    #[diagnostic(code(kubetools::archive::invalid_pattern))]
    InvalidPattern {
        /// The pattern
        pattern: String,
        /// The parse error
        #[source]
        source: glob::PatternError,
    },

    /// A matched path does not lie under the pattern's base directory.
    #[error("Matched path {} is outside the pattern base {}", path.display(), base.display())]
    #[diagnostic(
        code(kubetools::archive::outside_base),
        help("Avoid '..' after a wildcard in the source pattern")
    )]
    OutsidePatternBase {
        /// The matched path
        path: PathBuf,
        /// The directory entry names are relative to
        base: PathBuf,
    },

    /// I/O error on a known path.
    #[error("I/O error on {}: {source}", path.display())]
    #[diagnostic(code(kubetools::archive::io))]
    Io {
        /// The path being accessed
        path: PathBuf,
        /// The underlying error
        #[source]
        source: std::io::Error,
    },

    /// Walking a matched directory failed.
    #[error("Failed to walk {}: {source}", path.display())]
    #[diagnostic(code(kubetools::archive::walk))]
    Walk {
        /// The matched root being walked
        path: PathBuf,
        /// The walk error
        #[source]
        source: walkdir::Error,
    },

    /// Writing the zip stream failed.
    #[error("Failed to write zip archive {}: {source}", path.display())]
    #[diagnostic(code(kubetools::archive::zip))]
    Zip {
        /// The destination path
        path: PathBuf,
        /// The zip error
        #[source]
        source: zip::result::ZipError,
    },
}

impl Error {
    /// Create an I/O error for a path.
    #[must_use]
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Create a zip error for a destination.
    #[must_use]
    pub fn zip(path: impl Into<PathBuf>, source: zip::result::ZipError) -> Self {
        Self::Zip {
            path: path.into(),
            source,
        }
    }
}
