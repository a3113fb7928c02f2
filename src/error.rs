use std::io;

use thiserror::Error;

/// Errors reported while opening a password database.
///
/// The set is closed: every failure in the header, key derivation, stream
/// or XML layer maps onto exactly one of these variants. Anything below the
/// stream-start gate deliberately collapses into [`Error::AuthenticationFailed`]
/// so a wrong password and tampered ciphertext are indistinguishable.
#[derive(Error, Debug)]
pub enum Error {
    /// The file does not carry the KeePass 2 signature.
    #[error("Not a KeePass database.")]
    NotDatabase,

    /// The file is an old KeePass 1 database which must be imported, not opened.
    #[error("The selected file is an old KeePass 1 database (.kdb).\n\n\
             You can import it by clicking on Database > 'Import KeePass 1 database...'.\n\
             This is a one-way migration. You won't be able to open the imported \
             database with the old KeePassX 0.4 version.")]
    LegacyDatabase,

    /// Valid signature, but a file version outside the supported range.
    #[error("Unsupported KeePass KDBX 2 or 3 database version.")]
    UnsupportedVersion,

    /// Short reads, bad field sizes, unknown cipher, missing required fields.
    #[error("{0}")]
    MalformedHeader(String),

    /// KDF primitive failure or an empty composite key.
    #[error("Unable to calculate master key: {0}")]
    KeyDerivationFailed(String),

    /// Stream-start bytes did not match after decryption.
    #[error("Wrong key or database file is corrupt.")]
    AuthenticationFailed,

    /// Hashed-block framing violation, gzip error, or cipher error after
    /// authentication succeeded.
    #[error("Database stream is corrupt: {0}")]
    StreamCorrupted(String),

    /// XML parser error or a strict-mode structural violation.
    #[error("Malformed database XML: {0}")]
    XmlMalformed(String),

    /// The header hash stored inside the XML does not cover the header read
    /// from the file.
    #[error("Header doesn't match hash")]
    HeaderHashMismatch,

    /// Failure of the underlying byte source.
    #[error("I/O error: {0}")]
    Io(io::Error),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        crate::streams::classify_io_error(err)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
