use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Read};

use byteorder::{LittleEndian, ReadBytesExt};
use log::debug;
use openssl::symm::{Cipher, Crypter, Mode};
use ring::digest::{Context, SHA256};

use crate::error::Error;

/// Marker carried inside an `io::Error` when a stream layer detects
/// corruption, so the top of the pipeline can tell framing violations
/// apart from transport failures.
#[derive(Debug)]
pub(crate) struct CorruptStream(pub(crate) String);

impl fmt::Display for CorruptStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::error::Error for CorruptStream {}

pub(crate) fn corrupt(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, CorruptStream(msg.into()))
}

/// Map an `io::Error` bubbling out of the stream stack onto the public
/// error taxonomy. Framing violations, decoder errors and truncation are
/// all stream corruption; anything else is a genuine I/O failure.
pub(crate) fn classify_io_error(err: io::Error) -> Error {
    if let Some(inner) = err.get_ref() {
        if let Some(corrupt) = inner.downcast_ref::<CorruptStream>() {
            return Error::StreamCorrupted(corrupt.0.clone());
        }
    }
    match err.kind() {
        io::ErrorKind::InvalidData | io::ErrorKind::InvalidInput | io::ErrorKind::UnexpectedEof => {
            Error::StreamCorrupted(err.to_string())
        }
        _ => Error::Io(err),
    }
}

const CIPHER_CHUNK: usize = 4096;

/// One-direction CBC decrypt adapter over the raw byte source.
///
/// Reads the source in chunks and feeds them through the cipher primitive,
/// carrying the CBC state across reads. PKCS#7 padding is stripped from
/// the terminal block when the source reports EOF.
pub(crate) struct CipherStream<R: Read> {
    crypter: Crypter,
    inner: R,
    block_size: usize,
    plaintext: VecDeque<u8>,
    eof: bool,
}

impl<R: Read> CipherStream<R> {
    pub(crate) fn new(cipher: Cipher, key: &[u8], iv: &[u8], inner: R) -> Result<Self, Error> {
        let crypter = Crypter::new(cipher, Mode::Decrypt, key, Some(iv))
            .map_err(|e| Error::MalformedHeader(format!("Invalid cipher parameters: {}", e)))?;
        Ok(Self {
            crypter,
            inner,
            block_size: cipher.block_size(),
            plaintext: VecDeque::new(),
            eof: false,
        })
    }

    fn fill(&mut self) -> io::Result<()> {
        let mut ciphertext = [0u8; CIPHER_CHUNK];
        let mut out = vec![0u8; CIPHER_CHUNK + self.block_size];
        while self.plaintext.is_empty() && !self.eof {
            let count = self.inner.read(&mut ciphertext)?;
            if count == 0 {
                let rest = self
                    .crypter
                    .finalize(&mut out)
                    .map_err(|e| corrupt(format!("Decryption failed: {}", e)))?;
                self.plaintext.extend(&out[..rest]);
                self.eof = true;
            } else {
                let produced = self
                    .crypter
                    .update(&ciphertext[..count], &mut out)
                    .map_err(|e| corrupt(format!("Decryption failed: {}", e)))?;
                self.plaintext.extend(&out[..produced]);
            }
        }
        Ok(())
    }
}

impl<R: Read> Read for CipherStream<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.plaintext.is_empty() {
            self.fill()?;
        }
        let mut index = 0;
        while index < buf.len() {
            match self.plaintext.pop_front() {
                Some(val) => {
                    buf[index] = val;
                    index += 1;
                }
                None => break,
            }
        }
        Ok(index)
    }
}

/// Hash-framed plaintext stream layered atop the cipher stream.
///
/// Each block is `index:u32 LE, sha256:[u8;32], size:u32 LE, payload`.
/// Indices start at zero and increase strictly; a zero-size block with an
/// all-zero hash terminates the stream. Block boundaries are invisible to
/// the consumer.
pub(crate) struct HashedBlockReader<R: Read> {
    inner: R,
    index: u32,
    buf: VecDeque<u8>,
    complete: bool,
}

impl<R: Read> HashedBlockReader<R> {
    pub(crate) fn new(inner: R) -> Self {
        Self {
            inner,
            index: 0,
            buf: VecDeque::new(),
            complete: false,
        }
    }

    fn load_next_block(&mut self) -> io::Result<()> {
        debug!("Block {}", self.index);
        let block_index = self
            .inner
            .read_u32::<LittleEndian>()
            .map_err(truncated_block)?;
        if block_index != self.index {
            return Err(corrupt("Invalid block index: block corrupted"));
        }
        let mut expected_hash = [0u8; 32];
        self.inner
            .read_exact(&mut expected_hash)
            .map_err(truncated_block)?;
        let block_size = self
            .inner
            .read_u32::<LittleEndian>()
            .map_err(truncated_block)?;
        if block_size == 0 {
            if expected_hash != [0u8; 32] {
                return Err(corrupt("Invalid hash of final block: block corrupted"));
            }
            self.complete = true;
            return Ok(());
        }
        let mut block = vec![0; block_size as usize];
        self.inner.read_exact(&mut block).map_err(truncated_block)?;

        let mut context = Context::new(&SHA256);
        context.update(&block);
        if context.finish().as_ref() != expected_hash {
            return Err(corrupt("Invalid block hash: block corrupted"));
        }
        self.index += 1;
        self.buf = block.into();
        Ok(())
    }
}

fn truncated_block(err: io::Error) -> io::Error {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        corrupt("Truncated block: block corrupted")
    } else {
        err
    }
}

impl<R: Read> Read for HashedBlockReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.buf.is_empty() && !self.complete {
            self.load_next_block()?;
        }
        if self.complete {
            return Ok(0);
        }
        let mut index = 0;
        while index < buf.len() {
            match self.buf.pop_front() {
                Some(val) => {
                    buf[index] = val;
                    index += 1;
                }
                None => break,
            }
        }
        Ok(index)
    }
}
