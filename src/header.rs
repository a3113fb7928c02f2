use std::io::{self, Read};

use byteorder::{LittleEndian, ReadBytesExt};
use log::{debug, warn};
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;
use uuid::{uuid, Uuid};

use crate::error::Error;
use crate::kdf::Kdf;
use crate::protected_stream::InnerStreamId;

pub const KDBX_SIGNATURE_1: u32 = 0x9AA2D903;
pub const KDBX_SIGNATURE_2: u32 = 0xB54BFB67;
pub const KDB1_SIGNATURE_2: u32 = 0xB54BFB65;
pub const KDBX2_BETA_SIGNATURE_2: u32 = 0xB54BFB66;

pub const FILE_VERSION_CRITICAL_MASK: u32 = 0xFFFF0000;
pub const FILE_VERSION_MIN: u32 = 0x0003_0000;
pub const FILE_VERSION_MAX: u32 = 0x0003_0001;

pub const CIPHER_ID_AES256_CBC: Uuid = uuid!("31c1f2e6-bf71-4350-be58-05216afc5aff");
pub const CIPHER_ID_TWOFISH_CBC: Uuid = uuid!("ad68f29f-576f-4bb9-a36a-d47af965346c");

/// Bulk ciphers a 3.x header may name.
///
/// Twofish resolves at header parse but is not exercised by this reader;
/// building its stream reports it unsupported.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CipherId {
    Aes256Cbc,
    TwofishCbc,
}

impl CipherId {
    pub fn from_uuid(uuid: Uuid) -> Option<Self> {
        match uuid {
            CIPHER_ID_AES256_CBC => Some(CipherId::Aes256Cbc),
            CIPHER_ID_TWOFISH_CBC => Some(CipherId::TwofishCbc),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum Compression {
    None = 0,
    Gzip = 1,
}

const COMPRESSION_MAX: u32 = Compression::Gzip as u32;

#[derive(FromPrimitive, ToPrimitive)]
enum TlvType {
    End = 0,
    Comment = 1,
    CipherId = 2,
    CompressionFlags = 3,
    MasterSeed = 4,
    TransformSeed = 5,
    TransformRounds = 6,
    EncryptionIv = 7,
    ProtectedStreamKey = 8,
    StreamStartBytes = 9,
    InnerRandomStreamId = 10,
}

/// Tee that retains every byte consumed through it.
///
/// The header is later hashed and compared against the `HeaderHash`
/// element inside the XML, so the exact bytes read during the header
/// phase must be kept.
pub(crate) struct StoredReader<R> {
    inner: R,
    stored: Vec<u8>,
}

impl<R: Read> StoredReader<R> {
    pub(crate) fn new(inner: R) -> Self {
        Self {
            inner,
            stored: Vec::new(),
        }
    }

    pub(crate) fn into_parts(self) -> (R, Vec<u8>) {
        (self.inner, self.stored)
    }
}

impl<R: Read> Read for StoredReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let count = self.inner.read(buf)?;
        self.stored.extend(&buf[..count]);
        Ok(count)
    }
}

/// Everything the crypto chain needs, collected from the header
#[derive(Debug)]
pub struct HeaderContext {
    pub cipher: CipherId,
    pub compression: Compression,
    pub master_seed: Vec<u8>,
    pub kdf: Kdf,
    pub encryption_iv: Vec<u8>,
    pub protected_stream_key: Vec<u8>,
    pub stream_start_bytes: Vec<u8>,
    pub inner_stream: InnerStreamId,
}

#[derive(Default)]
struct PartialHeader {
    cipher: Option<CipherId>,
    compression: Compression,
    master_seed: Option<Vec<u8>>,
    kdf: Option<Kdf>,
    encryption_iv: Option<Vec<u8>>,
    protected_stream_key: Option<Vec<u8>>,
    stream_start_bytes: Option<Vec<u8>>,
    inner_stream: InnerStreamId,
}

impl Default for Compression {
    fn default() -> Self {
        Compression::Gzip
    }
}

impl PartialHeader {
    fn kdf_aes_mut(&mut self) -> &mut crate::kdf::AesKdf {
        self.kdf.get_or_insert_with(Kdf::default).as_aes_mut()
    }

    fn finish(self) -> Result<HeaderContext, Error> {
        let (master_seed, encryption_iv, stream_start_bytes, protected_stream_key, cipher) = match (
            self.master_seed,
            self.encryption_iv,
            self.stream_start_bytes,
            self.protected_stream_key,
            self.cipher,
        ) {
            (Some(seed), Some(iv), Some(start), Some(key), Some(cipher))
                if !seed.is_empty() && !iv.is_empty() && !start.is_empty() && !key.is_empty() =>
            {
                (seed, iv, start, key, cipher)
            }
            _ => {
                return Err(Error::MalformedHeader("missing database headers".to_string()));
            }
        };
        Ok(HeaderContext {
            cipher,
            compression: self.compression,
            master_seed,
            kdf: self.kdf.unwrap_or_default(),
            encryption_iv,
            protected_stream_key,
            stream_start_bytes,
            inner_stream: self.inner_stream,
        })
    }
}

/// Parse signatures, version and the TLV field sequence.
///
/// On success the version gate has passed, every known field satisfied its
/// size constraint and all required fields are present.
pub(crate) fn read_header<R: Read>(input: &mut R) -> Result<HeaderContext, Error> {
    let signature1 = input
        .read_u32::<LittleEndian>()
        .map_err(|_| Error::NotDatabase)?;
    if signature1 != KDBX_SIGNATURE_1 {
        return Err(Error::NotDatabase);
    }

    let signature2 = input
        .read_u32::<LittleEndian>()
        .map_err(|_| Error::NotDatabase)?;
    if signature2 == KDB1_SIGNATURE_2 {
        return Err(Error::LegacyDatabase);
    } else if signature2 != KDBX_SIGNATURE_2 {
        return Err(Error::NotDatabase);
    }

    let version = input
        .read_u32::<LittleEndian>()
        .map_err(|_| Error::UnsupportedVersion)?
        & FILE_VERSION_CRITICAL_MASK;
    let max_version = FILE_VERSION_MAX & FILE_VERSION_CRITICAL_MASK;
    if version < FILE_VERSION_MIN || version > max_version {
        return Err(Error::UnsupportedVersion);
    }

    let mut header = PartialHeader::default();
    loop {
        if !read_header_field(input, &mut header)? {
            break;
        }
    }
    header.finish()
}

/// Read one TLV field; false means the end sentinel was reached.
fn read_header_field<R: Read>(input: &mut R, header: &mut PartialHeader) -> Result<bool, Error> {
    let field_id = input
        .read_u8()
        .map_err(|_| Error::MalformedHeader("Invalid header id size".to_string()))?;
    let field_len = input
        .read_u16::<LittleEndian>()
        .map_err(|_| Error::MalformedHeader("Invalid header field length".to_string()))?;
    let mut field_data = vec![0; field_len as usize];
    input
        .read_exact(&mut field_data)
        .map_err(|_| Error::MalformedHeader("Invalid header data length".to_string()))?;
    debug!("TLV({}, {}): {:?}", field_id, field_len, field_data);

    match TlvType::from_u8(field_id) {
        Some(TlvType::End) => return Ok(false),
        Some(TlvType::Comment) => {
            debug!("Skipping header comment");
        }
        Some(TlvType::CipherId) => {
            if field_data.len() != 16 {
                return Err(Error::MalformedHeader("Invalid cipher uuid length".to_string()));
            }
            let uuid = Uuid::from_slice(&field_data)
                .map_err(|_| Error::MalformedHeader("Invalid cipher uuid length".to_string()))?;
            header.cipher = Some(
                CipherId::from_uuid(uuid)
                    .ok_or_else(|| Error::MalformedHeader("Unsupported cipher".to_string()))?,
            );
        }
        Some(TlvType::CompressionFlags) => {
            let id = unmake_u32(&field_data).ok_or_else(|| {
                Error::MalformedHeader("Invalid compression flags length".to_string())
            })?;
            if id > COMPRESSION_MAX {
                return Err(Error::MalformedHeader(
                    "Unsupported compression algorithm".to_string(),
                ));
            }
            header.compression = Compression::from_u32(id).expect("id bounded above");
        }
        Some(TlvType::MasterSeed) => {
            if field_data.len() != 32 {
                return Err(Error::MalformedHeader("Invalid master seed size".to_string()));
            }
            header.master_seed = Some(field_data);
        }
        Some(TlvType::TransformSeed) => {
            let seed: [u8; 32] = field_data
                .try_into()
                .map_err(|_| Error::MalformedHeader("Invalid transform seed size".to_string()))?;
            header.kdf_aes_mut().seed = seed;
        }
        Some(TlvType::TransformRounds) => {
            let rounds = unmake_u64(&field_data).ok_or_else(|| {
                Error::MalformedHeader("Invalid transform rounds size".to_string())
            })?;
            header.kdf_aes_mut().rounds = rounds;
        }
        Some(TlvType::EncryptionIv) => {
            header.encryption_iv = Some(field_data);
        }
        Some(TlvType::ProtectedStreamKey) => {
            header.protected_stream_key = Some(field_data);
        }
        Some(TlvType::StreamStartBytes) => {
            if field_data.len() != 32 {
                return Err(Error::MalformedHeader("Invalid start bytes size".to_string()));
            }
            header.stream_start_bytes = Some(field_data);
        }
        Some(TlvType::InnerRandomStreamId) => {
            let id = unmake_u32(&field_data).ok_or_else(|| {
                Error::MalformedHeader("Invalid random stream id size".to_string())
            })?;
            match InnerStreamId::from_u32_id(id) {
                Some(InnerStreamId::Salsa20) => {
                    header.inner_stream = InnerStreamId::Salsa20;
                }
                _ => {
                    return Err(Error::MalformedHeader(
                        "Invalid inner random stream cipher".to_string(),
                    ));
                }
            }
        }
        None => {
            warn!("Unknown header field read: id={}", field_id);
        }
    }
    Ok(true)
}

fn unmake_u32(value: &[u8]) -> Option<u32> {
    Some(u32::from_le_bytes(value.try_into().ok()?))
}

fn unmake_u64(value: &[u8]) -> Option<u64> {
    Some(u64::from_le_bytes(value.try_into().ok()?))
}

#[cfg(test)]
mod tests {
    use std::io::{Cursor, Write};

    use byteorder::WriteBytesExt;

    use super::*;

    fn tlv(out: &mut Vec<u8>, id: u8, data: &[u8]) {
        out.write_u8(id).unwrap();
        out.write_u16::<LittleEndian>(data.len() as u16).unwrap();
        out.write_all(data).unwrap();
    }

    fn minimal_header(version: u32) -> Vec<u8> {
        let mut out = Vec::new();
        out.write_u32::<LittleEndian>(KDBX_SIGNATURE_1).unwrap();
        out.write_u32::<LittleEndian>(KDBX_SIGNATURE_2).unwrap();
        out.write_u32::<LittleEndian>(version).unwrap();
        tlv(&mut out, 2, CIPHER_ID_AES256_CBC.as_bytes());
        tlv(&mut out, 3, &1u32.to_le_bytes());
        tlv(&mut out, 4, &[1; 32]);
        tlv(&mut out, 5, &[2; 32]);
        tlv(&mut out, 6, &6000u64.to_le_bytes());
        tlv(&mut out, 7, &[3; 16]);
        tlv(&mut out, 8, &[4; 32]);
        tlv(&mut out, 9, &[5; 32]);
        tlv(&mut out, 10, &2u32.to_le_bytes());
        tlv(&mut out, 0, b"\r\n\r\n");
        out
    }

    #[test]
    fn test_parse_complete_header() {
        let bytes = minimal_header(0x0003_0001);
        let header = read_header(&mut Cursor::new(bytes)).unwrap();
        assert_eq!(header.cipher, CipherId::Aes256Cbc);
        assert_eq!(header.compression, Compression::Gzip);
        assert_eq!(header.master_seed, vec![1; 32]);
        let Kdf::Aes(aes) = &header.kdf;
        assert_eq!(aes.seed, [2; 32]);
        assert_eq!(aes.rounds, 6000);
        assert_eq!(header.encryption_iv, vec![3; 16]);
        assert_eq!(header.stream_start_bytes, vec![5; 32]);
        assert_eq!(header.inner_stream, InnerStreamId::Salsa20);
    }

    #[test]
    fn test_wrong_signature() {
        let mut bytes = minimal_header(0x0003_0000);
        bytes[0] ^= 0xFF;
        assert!(matches!(
            read_header(&mut Cursor::new(bytes)),
            Err(Error::NotDatabase)
        ));
    }

    #[test]
    fn test_kdb1_signature_reports_migration() {
        let mut bytes = Vec::new();
        bytes.write_u32::<LittleEndian>(KDBX_SIGNATURE_1).unwrap();
        bytes.write_u32::<LittleEndian>(KDB1_SIGNATURE_2).unwrap();
        let err = read_header(&mut Cursor::new(bytes)).unwrap_err();
        assert!(matches!(err, Error::LegacyDatabase));
        assert!(err.to_string().contains(".kdb"));
    }

    #[test]
    fn test_beta_signature_rejected() {
        let mut bytes = Vec::new();
        bytes.write_u32::<LittleEndian>(KDBX_SIGNATURE_1).unwrap();
        bytes
            .write_u32::<LittleEndian>(KDBX2_BETA_SIGNATURE_2)
            .unwrap();
        assert!(matches!(
            read_header(&mut Cursor::new(bytes)),
            Err(Error::NotDatabase)
        ));
    }

    #[test]
    fn test_version_gate() {
        assert!(read_header(&mut Cursor::new(minimal_header(0x0003_0000))).is_ok());
        assert!(read_header(&mut Cursor::new(minimal_header(0x0003_0001))).is_ok());
        // Non-critical minor bits are ignored
        assert!(read_header(&mut Cursor::new(minimal_header(0x0003_F001))).is_ok());
        assert!(matches!(
            read_header(&mut Cursor::new(minimal_header(0x0004_0000))),
            Err(Error::UnsupportedVersion)
        ));
        assert!(matches!(
            read_header(&mut Cursor::new(minimal_header(0x0002_0000))),
            Err(Error::UnsupportedVersion)
        ));
    }

    #[test]
    fn test_missing_required_field() {
        let mut out = Vec::new();
        out.write_u32::<LittleEndian>(KDBX_SIGNATURE_1).unwrap();
        out.write_u32::<LittleEndian>(KDBX_SIGNATURE_2).unwrap();
        out.write_u32::<LittleEndian>(0x0003_0001).unwrap();
        tlv(&mut out, 2, CIPHER_ID_AES256_CBC.as_bytes());
        tlv(&mut out, 4, &[1; 32]);
        tlv(&mut out, 0, b"");
        let err = read_header(&mut Cursor::new(out)).unwrap_err();
        assert!(matches!(err, Error::MalformedHeader(msg) if msg.contains("missing")));
    }

    #[test]
    fn test_bad_field_sizes() {
        for (id, data) in [
            (2u8, &[0u8; 15][..]),
            (3, &[0; 3]),
            (4, &[0; 31]),
            (5, &[0; 33]),
            (6, &[0; 7]),
            (9, &[0; 8]),
            (10, &[0; 2]),
        ] {
            let mut out = Vec::new();
            out.write_u32::<LittleEndian>(KDBX_SIGNATURE_1).unwrap();
            out.write_u32::<LittleEndian>(KDBX_SIGNATURE_2).unwrap();
            out.write_u32::<LittleEndian>(0x0003_0001).unwrap();
            tlv(&mut out, id, data);
            let err = read_header(&mut Cursor::new(out)).unwrap_err();
            assert!(
                matches!(err, Error::MalformedHeader(_)),
                "field {} accepted bad size",
                id
            );
        }
    }

    #[test]
    fn test_unknown_cipher_uuid() {
        let mut out = Vec::new();
        out.write_u32::<LittleEndian>(KDBX_SIGNATURE_1).unwrap();
        out.write_u32::<LittleEndian>(KDBX_SIGNATURE_2).unwrap();
        out.write_u32::<LittleEndian>(0x0003_0001).unwrap();
        tlv(&mut out, 2, &[0xEE; 16]);
        let err = read_header(&mut Cursor::new(out)).unwrap_err();
        assert!(matches!(err, Error::MalformedHeader(msg) if msg.contains("Unsupported cipher")));
    }

    #[test]
    fn test_arc4_inner_stream_rejected() {
        let mut out = Vec::new();
        out.write_u32::<LittleEndian>(KDBX_SIGNATURE_1).unwrap();
        out.write_u32::<LittleEndian>(KDBX_SIGNATURE_2).unwrap();
        out.write_u32::<LittleEndian>(0x0003_0001).unwrap();
        tlv(&mut out, 10, &1u32.to_le_bytes());
        let err = read_header(&mut Cursor::new(out)).unwrap_err();
        assert!(matches!(err, Error::MalformedHeader(msg) if msg.contains("inner random stream")));
    }

    #[test]
    fn test_unknown_field_skipped() {
        let mut bytes = minimal_header(0x0003_0001);
        // Splice an unknown field in front of the sentinel
        let sentinel = bytes.len() - 7;
        let mut unknown = Vec::new();
        tlv(&mut unknown, 200, &[1, 2, 3]);
        bytes.splice(sentinel..sentinel, unknown);
        assert!(read_header(&mut Cursor::new(bytes)).is_ok());
    }

    #[test]
    fn test_stored_reader_retains_exact_bytes() {
        let bytes = minimal_header(0x0003_0001);
        let mut tee = StoredReader::new(Cursor::new(bytes.clone()));
        read_header(&mut tee).unwrap();
        let (_, stored) = tee.into_parts();
        assert_eq!(stored, bytes);
    }

    #[test]
    fn test_twofish_resolves() {
        let mut bytes = minimal_header(0x0003_0001);
        let pos = bytes
            .windows(16)
            .position(|w| w == CIPHER_ID_AES256_CBC.as_bytes())
            .unwrap();
        bytes[pos..pos + 16].copy_from_slice(CIPHER_ID_TWOFISH_CBC.as_bytes());
        let header = read_header(&mut Cursor::new(bytes)).unwrap();
        assert_eq!(header.cipher, CipherId::TwofishCbc);
    }
}
