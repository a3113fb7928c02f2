use generic_array::GenericArray;
use hex_literal::hex;
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;

use chacha20::ChaCha20;
use ring::digest::{Context, SHA256, SHA512};
use salsa20::cipher::{KeyIvInit, StreamCipher};
use salsa20::Key as Salsa20Key;
use salsa20::Salsa20;

/// Nonce fixed by the KDBX 3.x format for the Salsa20 inner stream
const SALSA20_NONCE: [u8; 8] = hex!("E830094B97205D2A");

/// Inner random stream algorithm ids as stored in the header
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum InnerStreamId {
    Null = 0,
    ArcFourVariant = 1,
    Salsa20 = 2,
    ChaCha20 = 3,
}

impl InnerStreamId {
    pub(crate) fn from_u32_id(id: u32) -> Option<Self> {
        Self::from_u32(id)
    }
}

impl Default for InnerStreamId {
    fn default() -> Self {
        InnerStreamId::Salsa20
    }
}

/// Keystream source for protected XML attribute values.
///
/// The stream is consumed lazily and strictly in document order; the XML
/// decoder is its only consumer. ChaCha20 is reserved for a future format
/// version and never selected by a 3.x header.
pub enum CipherValue {
    Null,
    Salsa20(Salsa20),
    ChaCha20(ChaCha20),
}

impl CipherValue {
    pub fn apply_keystream(&mut self, buf: &mut [u8]) {
        match self {
            Self::Null => (),
            Self::Salsa20(c) => c.apply_keystream(buf),
            Self::ChaCha20(c) => c.apply_keystream(buf),
        }
    }
}

#[derive(Debug)]
pub enum Error {
    InvalidCipher(u32),
}

pub fn new_stream(id: InnerStreamId, key: &[u8]) -> Result<CipherValue, Error> {
    Ok(match id {
        InnerStreamId::Null => CipherValue::Null,
        InnerStreamId::ArcFourVariant => {
            return Err(Error::InvalidCipher(id as u32));
        }
        InnerStreamId::Salsa20 => {
            let mut context = Context::new(&SHA256);
            context.update(key);
            let p2_key = context.finish().as_ref().to_owned();
            let key = Salsa20Key::from_slice(&p2_key[0..32]);
            CipherValue::Salsa20(Salsa20::new(key, &SALSA20_NONCE.into()))
        }
        InnerStreamId::ChaCha20 => {
            let mut context = Context::new(&SHA512);
            context.update(key);
            let p2_key = context.finish().as_ref().to_owned();
            let key = GenericArray::from_slice(&p2_key[0..32]);
            let nonce = GenericArray::from_slice(&p2_key[32..32 + 12]);
            CipherValue::ChaCha20(ChaCha20::new(key, nonce))
        }
    })
}
