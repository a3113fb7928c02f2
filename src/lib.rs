//! Read encrypted KDBX 3.x (KeePass 2) password databases
//!
//! The reader validates the signed header, derives the master key from a
//! composite [`Key`], then unwraps the stream stack (block cipher,
//! stream-start gate, hashed-block framing, optional gzip) and decodes
//! the XML payload into a [`Database`] tree. Attribute values marked as
//! protected are decrypted lazily against the Salsa20 inner stream as
//! they are encountered.
//!
//! ```no_run
//! # fn main() -> Result<(), kdbx3::Error> {
//! use kdbx3::{read_database_file, Key, ReadOptions};
//!
//! let mut key = Key::new();
//! key.set_user_password("secret");
//! let db = read_database_file("passwords.kdbx", &key, &ReadOptions::default())?;
//! println!("{}", db.root_group().name);
//! # Ok(())
//! # }
//! ```

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use flate2::read::GzDecoder;
use log::{debug, warn};
use openssl::symm::Cipher;
use ring::constant_time::verify_slices_are_equal;
use ring::digest::{Context, SHA256};
use zeroize::Zeroizing;

mod database;
mod error;
mod header;
mod kdf;
mod key;
pub mod protected_stream;
mod streams;
mod xml;

pub use database::{
    Attribute, AutoType, AutoTypeAssociation, Color, Database, DeletedObject, Entry, Group,
    GroupIter, Meta, MemoryProtection, Times, TriState, DEFAULT_HISTORY_MAX_ITEMS,
    DEFAULT_HISTORY_MAX_SIZE,
};
pub use error::{Error, Result};
pub use header::{
    CipherId, Compression, HeaderContext, CIPHER_ID_AES256_CBC, CIPHER_ID_TWOFISH_CBC,
    KDB1_SIGNATURE_2, KDBX2_BETA_SIGNATURE_2, KDBX_SIGNATURE_1, KDBX_SIGNATURE_2,
};
pub use kdf::{AesKdf, Kdf, KDF_AES_KDBX3};
pub use key::{ChallengeResponse, Key};

use header::StoredReader;
use streams::{CipherStream, HashedBlockReader};

/// Reader behaviour switches
#[derive(Clone, Copy, Debug, Default)]
pub struct ReadOptions {
    /// Treat repairable structural anomalies in the XML as fatal
    pub strict: bool,
    /// On an XML-phase error, return whatever was decoded instead of failing
    pub keep_on_xml_error: bool,
}

/// Open and decrypt a database from any byte source.
///
/// The source is consumed strictly sequentially. The first error wins;
/// everything read before a pre-XML failure is discarded.
pub fn read_database<R: Read>(source: R, key: &Key, options: &ReadOptions) -> Result<Database> {
    let mut header_stream = StoredReader::new(source);
    let header = header::read_header(&mut header_stream)?;
    let (source, header_bytes) = header_stream.into_parts();

    let final_key = final_key(&header, key)?;

    let cipher = match header.cipher {
        CipherId::Aes256Cbc => Cipher::aes_256_cbc(),
        CipherId::TwofishCbc => {
            return Err(Error::MalformedHeader(
                "Twofish cipher is not supported".to_string(),
            ));
        }
    };
    let mut cipher_stream = CipherStream::new(cipher, &final_key, &header.encryption_iv, source)?;

    // Authentication gate: the first 32 plaintext bytes must repeat the
    // stream start bytes from the header before anything else is parsed.
    let mut real_start = [0u8; 32];
    if let Err(err) = cipher_stream.read_exact(&mut real_start) {
        return Err(match streams::classify_io_error(err) {
            Error::Io(io_err) => Error::Io(io_err),
            _ => Error::AuthenticationFailed,
        });
    }
    verify_slices_are_equal(&real_start, &header.stream_start_bytes)
        .map_err(|_| Error::AuthenticationFailed)?;
    debug!("Stream start bytes match");

    let hashed_stream = HashedBlockReader::new(cipher_stream);
    let xml_source: Box<dyn Read + '_> = match header.compression {
        Compression::Gzip => Box::new(GzDecoder::new(hashed_stream)),
        Compression::None => Box::new(hashed_stream),
    };

    let random_stream =
        protected_stream::new_stream(header.inner_stream, &header.protected_stream_key)
            .map_err(|_| {
                Error::MalformedHeader("Invalid inner random stream cipher".to_string())
            })?;

    let mut db = Database::default();
    if let Err(err) = xml::decode_database(xml_source, random_stream, options.strict, &mut db) {
        if options.keep_on_xml_error {
            warn!("Keeping partially read database: {}", err);
            return Ok(db);
        }
        return Err(err);
    }

    // Header binding: the XML may carry a hash of the exact header bytes.
    if let Some(expected) = &db.meta.header_hash {
        let mut context = Context::new(&SHA256);
        context.update(&header_bytes);
        let digest = context.finish();
        verify_slices_are_equal(digest.as_ref(), expected)
            .map_err(|_| Error::HeaderHashMismatch)?;
        debug!("Header hash verified");
    }

    Ok(db)
}

/// Open a database file from disk
pub fn read_database_file<P: AsRef<Path>>(
    path: P,
    key: &Key,
    options: &ReadOptions,
) -> Result<Database> {
    let file = File::open(path).map_err(Error::Io)?;
    read_database(BufReader::new(file), key, options)
}

/// SHA-256 of master seed, challenge-response contribution and the
/// KDF-transformed composite key
fn final_key(header: &HeaderContext, key: &Key) -> Result<Zeroizing<Vec<u8>>> {
    if key.is_empty() {
        return Err(Error::KeyDerivationFailed("empty composite key".to_string()));
    }
    let composite = key.composite_key();
    let transformed = header
        .kdf
        .transform_key(&composite)
        .map_err(|err| Error::KeyDerivationFailed(err.to_string()))?;
    let challenge_response = Zeroizing::new(
        key.challenge_master_seed(&header.master_seed)
            .map_err(|err| Error::KeyDerivationFailed(err.to_string()))?,
    );

    let mut context = Context::new(&SHA256);
    context.update(&header.master_seed);
    context.update(&challenge_response);
    context.update(&transformed);
    Ok(Zeroizing::new(context.finish().as_ref().to_owned()))
}
