use std::io;

use log::debug;
use openssl::symm::{Cipher, Crypter, Mode};
use ring::digest::{Context, SHA256};
use uuid::{uuid, Uuid};
use zeroize::Zeroizing;

/// KDF used by KDBX 3.x files
pub const KDF_AES_KDBX3: Uuid = uuid!("c9d9f39a-628a-4460-bf74-0d08c18a4fea");

pub const DEFAULT_TRANSFORM_ROUNDS: u64 = 60000;

/// Key-derivation function attached to a database.
///
/// Each KDF family is one case carrying its own parameters. KDBX 3.x
/// headers only ever produce the AES case; header parsing either mutates
/// the AES parameters in place or replaces whatever the default was with
/// a fresh AES case.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Kdf {
    Aes(AesKdf),
}

impl Kdf {
    pub fn uuid(&self) -> Uuid {
        match self {
            Kdf::Aes(_) => KDF_AES_KDBX3,
        }
    }

    pub fn transform_key(&self, composite_key: &[u8]) -> io::Result<Zeroizing<Vec<u8>>> {
        match self {
            Kdf::Aes(kdf) => kdf.transform_key(composite_key),
        }
    }

    pub(crate) fn as_aes_mut(&mut self) -> &mut AesKdf {
        match self {
            Kdf::Aes(kdf) => kdf,
        }
    }
}

impl Default for Kdf {
    fn default() -> Self {
        Kdf::Aes(AesKdf::default())
    }
}

/// AES-KDF parameters: a 32-byte transform seed and a round count
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AesKdf {
    pub seed: [u8; 32],
    pub rounds: u64,
}

impl AesKdf {
    /// Derive the transformed master key from the composite key.
    ///
    /// The composite key is treated as two independent 16-byte AES-ECB
    /// blocks, each encrypted `rounds` times under the transform seed,
    /// then hashed once with SHA-256.
    pub fn transform_key(&self, composite_key: &[u8]) -> io::Result<Zeroizing<Vec<u8>>> {
        debug!("Calculating transformed key ({})", self.rounds);

        let cipher = Cipher::aes_256_ecb();
        let mut c = Crypter::new(cipher, Mode::Encrypt, &self.seed, None)?;
        c.pad(false);
        let mut transform_key = Zeroizing::new(composite_key.to_owned());
        for _ in 0..cipher.block_size() {
            transform_key.push(0);
        }
        let mut out = Zeroizing::new(vec![0; 16 + 16 + cipher.block_size()]);
        for _ in 0..self.rounds {
            c.update(&transform_key[0..32], &mut out)?;
            std::mem::swap(&mut transform_key, &mut out);
        }
        transform_key.truncate(32);
        let mut context = Context::new(&SHA256);
        context.update(&transform_key);
        Ok(Zeroizing::new(context.finish().as_ref().to_owned()))
    }
}

impl Default for AesKdf {
    fn default() -> Self {
        Self {
            seed: [0; 32],
            rounds: DEFAULT_TRANSFORM_ROUNDS,
        }
    }
}
