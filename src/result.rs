use std::{
    error::Error as StdError,
    fmt::{self, Display},
    io,
};

use crate::StripeId;

/// The top-level result type for dealing with the segment core.
pub type Result<T> = std::result::Result<T, Error>;

/// An Error type encapsulating various issues that may come up in both
/// the expected and unexpected operation of the segment core.
#[derive(Debug)]
pub enum Error {
    /// A read or write error has happened when interacting with the
    /// reverse-map file.
    Io(io::Error),
    /// A reverse-map pack header failed validation after loading.
    Corruption {
        /// The stripe whose pack header could not be interpreted.
        vsid: StripeId,
    },
    /// The system has been used in an unsupported way.
    Unsupported(String),
    /// An unexpected bug has happened. Please open an issue on github!
    ReportableBug(String),
}

impl Clone for Error {
    fn clone(&self) -> Self {
        use self::Error::*;

        match self {
            Io(ioe) => Io(io::Error::new(ioe.kind(), format!("{:?}", ioe))),
            Corruption { vsid } => Corruption { vsid: *vsid },
            Unsupported(why) => Unsupported(why.clone()),
            ReportableBug(what) => ReportableBug(what.clone()),
        }
    }
}

impl Eq for Error {}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        use self::Error::*;

        match *self {
            Corruption { vsid: l } => {
                if let Corruption { vsid: r } = *other {
                    l == r
                } else {
                    false
                }
            }
            Unsupported(ref l) => {
                if let Unsupported(ref r) = *other {
                    l == r
                } else {
                    false
                }
            }
            ReportableBug(ref l) => {
                if let ReportableBug(ref r) = *other {
                    l == r
                } else {
                    false
                }
            }
            Io(_) => false,
        }
    }
}

impl From<io::Error> for Error {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        Error::Io(io_error)
    }
}

impl StdError for Error {}

impl Display for Error {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> std::result::Result<(), fmt::Error> {
        use self::Error::*;

        match *self {
            Io(ref e) => write!(f, "IO error: {}", e),
            Corruption { vsid } => write!(
                f,
                "Read corrupted reverse map header for stripe {}",
                vsid
            ),
            Unsupported(ref e) => write!(f, "Unsupported: {}", e),
            ReportableBug(ref e) => write!(
                f,
                "Unexpected bug has happened: {}. \
                 PLEASE REPORT THIS BUG!",
                e
            ),
        }
    }
}
