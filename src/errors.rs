use crate::trap::Trap;
use crate::types::ExternKind;

/// An error produced while loading, validating or instantiating a module.
///
/// Runtime failures (traps, restarts) are reported through
/// [`crate::Halt`] instead; instantiation is the one place where both
/// worlds meet, which is why [`Error::Trap`] exists.
#[derive(Debug, onlyerror::Error)]
pub enum Error {
    /// The input bytes are not a well-formed WebAssembly module.
    #[error("malformed module at offset {offset}: {message}")]
    Malformed {
        /// A string describing what was wrong with the encoding.
        message: String,
        /// The byte offset where the error was detected.
        offset: usize,
    },
    /// The module is well-formed but does not type-check.
    #[error("validation failed at offset {offset}: {message}")]
    Invalid {
        message: String,
        /// The bytecode offset of the offending instruction.
        offset: usize,
    },
    /// An implementation limit was exceeded.
    #[error("implementation limit exceeded: {0}")]
    ImplLimitExceeded(String),
    /// Feature used by the WebAssembly code that this build does not support.
    #[error("unsupported: {0}")]
    Unsupported(String),
    /// No entry in the import object chain matched an import.
    #[error("no entry for import {module}:{name}")]
    UnknownImport { module: String, name: String },
    /// An entry matched by name but with the wrong external kind.
    #[error("kind mismatch for import {module}:{name} (found {found:?}, expected {expected:?})")]
    ImportKindMismatch {
        module: String,
        name: String,
        found: ExternKind,
        expected: ExternKind,
    },
    /// Entries matched by name and kind, but none satisfied subtyping.
    #[error("no matching entry for import {module}:{name}: {message}")]
    IncompatibleImport {
        module: String,
        name: String,
        message: String,
    },
    /// The requested export does not exist.
    #[error("no export named {0}")]
    NoSuchExport(String),
    /// An export exists but has a different type than requested.
    #[error("export {0} has an unexpected type")]
    ExportTypeMismatch(String),
    /// A trap occurred while running init expressions or the start function.
    #[error("trap during instantiation: {0}")]
    Trap(#[from] Trap),
    /// The host ran out of memory allocating a runtime structure.
    #[error("out of memory")]
    Oom,
    /// The text-format frontend rejected the input.
    #[error("{0}")]
    Wat(#[from] wat::Error),
}

impl Error {
    pub(crate) fn malformed(offset: usize, message: impl Into<String>) -> Self {
        Self::Malformed {
            message: message.into(),
            offset,
        }
    }

    pub(crate) fn invalid(offset: usize, message: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
            offset,
        }
    }
}
