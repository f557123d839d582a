use nor_flash::NorFlash;

/// Errors returned by [`crate::Filesystem`] operations.
///
/// Generic over the underlying [`NorFlash`] implementation `F` so that HAL
/// errors propagate unchanged, mirroring the way `flashmap::Error<F>` embeds
/// its backing device's error type.
#[derive(Debug, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error<F: NorFlash> {
    /// No free page or block could be found, even after garbage collection.
    #[error("filesystem full")]
    Full,
    /// No object with the requested id or name exists.
    #[error("object not found")]
    NotFound,
    /// A read extended past the end of the object.
    #[error("read past end of object")]
    EndOfObject,
    /// The file handle does not refer to an open descriptor.
    #[error("bad file descriptor")]
    BadDescriptor,
    /// The file descriptor's object was deleted out from under it.
    #[error("file was closed")]
    FileClosed,
    /// The file-descriptor table has no free slots.
    #[error("out of file descriptors")]
    OutOfFileDescriptors,
    /// An index page was expected to be alive but its `DELET` bit is cleared.
    #[error("page was deleted")]
    Deleted,
    /// An index page was expected to be finalized but its `FINAL` bit is still set.
    #[error("page not finalized")]
    NotFinalized,
    /// A page expected to be an index page has its `INDEX` bit set (is data).
    #[error("page is not an index page")]
    NotIndex,
    /// An index page's `span_ix` did not match what the caller expected.
    #[error("index span mismatch: expected {expected}, found {found}")]
    IndexSpanMismatch { expected: u16, found: u16 },
    /// The configuration failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// Error from the underlying flash device.
    #[error("flash error: {0:?}")]
    Flash(F::Error),
}

impl<F: NorFlash> From<F::Error> for Error<F> {
    fn from(e: F::Error) -> Self {
        Error::Flash(e)
    }
}

/// A coarse shadow of [`Error`] that does not borrow `F`, used so
/// [`crate::Filesystem::errno`] can report the last error kind without
/// requiring `F::Error: Clone`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ErrorKind {
    Full,
    NotFound,
    EndOfObject,
    BadDescriptor,
    FileClosed,
    OutOfFileDescriptors,
    Deleted,
    NotFinalized,
    NotIndex,
    IndexSpanMismatch,
    InvalidConfig,
    Flash,
}

impl<F: NorFlash> From<&Error<F>> for ErrorKind {
    fn from(e: &Error<F>) -> Self {
        match e {
            Error::Full => ErrorKind::Full,
            Error::NotFound => ErrorKind::NotFound,
            Error::EndOfObject => ErrorKind::EndOfObject,
            Error::BadDescriptor => ErrorKind::BadDescriptor,
            Error::FileClosed => ErrorKind::FileClosed,
            Error::OutOfFileDescriptors => ErrorKind::OutOfFileDescriptors,
            Error::Deleted => ErrorKind::Deleted,
            Error::NotFinalized => ErrorKind::NotFinalized,
            Error::NotIndex => ErrorKind::NotIndex,
            Error::IndexSpanMismatch { .. } => ErrorKind::IndexSpanMismatch,
            Error::InvalidConfig(_) => ErrorKind::InvalidConfig,
            Error::Flash(_) => ErrorKind::Flash,
        }
    }
}
