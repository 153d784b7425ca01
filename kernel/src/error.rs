//! Kernel error taxonomy and the last-error slot behind `PError`.
//!
//! User-induced failures return `-1` from the system call and park an
//! [`ErrorKind`] plus a context string (a file name, an object id) here,
//! where the `PError` system call can retrieve and print them. Anything
//! that indicates a broken kernel invariant panics instead and takes the
//! machine down.

use std::sync::Mutex;

/// Everything a system call can fail with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ErrorKind {
    #[error("incorrect value")]
    IncError,
    #[error("unable to open file")]
    OpenFileError,
    #[error("wrong format for executable file")]
    ExecFileFormatError,
    #[error("out of memory")]
    OutOfMemory,
    #[error("out of disk space")]
    OutOfDisk,
    #[error("name already present in directory")]
    AlreadyInDirectory,
    #[error("file does not exist")]
    InexistFileError,
    #[error("directory does not exist")]
    InexistDirectoryError,
    #[error("no space left in directory")]
    NoSpaceInDirectory,
    #[error("not a file")]
    NotAFile,
    #[error("not a directory")]
    NotADirectory,
    #[error("directory is not empty")]
    DirectoryNotEmpty,
    #[error("invalid counter value")]
    InvalidCounter,
    #[error("invalid semaphore identifier")]
    InvalidSemaphoreId,
    #[error("invalid lock identifier")]
    InvalidLockId,
    #[error("invalid condition identifier")]
    InvalidConditionId,
    #[error("invalid file identifier")]
    InvalidFileId,
    #[error("invalid thread identifier")]
    InvalidThreadId,
    #[error("wrong file endianness for executable file")]
    WrongFileEndianess,
    #[error("no ACIA configured on this machine")]
    NoAcia,
    #[error("file is too large")]
    FileTooLarge,
}

/// The per-kernel slot holding the last system-call failure.
#[derive(Default)]
pub struct ErrorSlot {
    last: Mutex<Option<(ErrorKind, String)>>,
}

impl ErrorSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure with its context string (e.g. the offending file
    /// name).
    pub fn set(&self, kind: ErrorKind, about: &str) {
        *self.last.lock().unwrap() = Some((kind, about.to_string()));
    }

    /// A system call succeeded; forget the previous failure.
    pub fn clear(&self) {
        *self.last.lock().unwrap() = None;
    }

    pub fn last(&self) -> Option<(ErrorKind, String)> {
        self.last.lock().unwrap().clone()
    }

    /// Render the last failure behind a user-supplied message, the way
    /// `PError` prints it.
    pub fn format_last(&self, user_msg: &str) -> String {
        match self.last() {
            Some((kind, about)) if about.is_empty() => {
                format!("{user_msg}: {kind}\n")
            }
            Some((kind, about)) => format!("{user_msg}: {kind} ({about})\n"),
            None => format!("{user_msg}: no error\n"),
        }
    }
}
