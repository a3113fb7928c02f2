//! In-memory KDBX 3.1 image builder shared by the integration tests.
//!
//! Layout produced: signatures, version, TLV header, then AES-256-CBC
//! ciphertext of (stream start bytes ++ hashed-block framing of the
//! optionally gzipped XML document).

use std::io::Write;

use byteorder::{LittleEndian, WriteBytesExt};
use flate2::write::GzEncoder;
use openssl::symm::{encrypt, Cipher};
use ring::digest::{Context, SHA256};

use kdbx3::protected_stream::{new_stream, CipherValue, InnerStreamId};
use kdbx3::{AesKdf, CIPHER_ID_AES256_CBC, KDBX_SIGNATURE_1, KDBX_SIGNATURE_2};

pub const PASSWORD: &str = "test";

pub const MASTER_SEED: [u8; 32] = [0xA1; 32];
pub const TRANSFORM_SEED: [u8; 32] = [0xB2; 32];
pub const TRANSFORM_ROUNDS: u64 = 64;
pub const ENCRYPTION_IV: [u8; 16] = [0xC3; 16];
pub const PROTECTED_STREAM_KEY: [u8; 32] = [0xD4; 32];
pub const STREAM_START_BYTES: [u8; 32] = [0xE5; 32];

const BLOCK_SIZE: usize = 512;

fn sha256(data: &[u8]) -> Vec<u8> {
    let mut context = Context::new(&SHA256);
    context.update(data);
    context.finish().as_ref().to_owned()
}

fn tlv(out: &mut Vec<u8>, id: u8, data: &[u8]) {
    out.write_u8(id).unwrap();
    out.write_u16::<LittleEndian>(data.len() as u16).unwrap();
    out.write_all(data).unwrap();
}

/// The exact header bytes, including the end sentinel
pub fn build_header(gzip: bool) -> Vec<u8> {
    let mut out = Vec::new();
    out.write_u32::<LittleEndian>(KDBX_SIGNATURE_1).unwrap();
    out.write_u32::<LittleEndian>(KDBX_SIGNATURE_2).unwrap();
    out.write_u32::<LittleEndian>(0x0003_0001).unwrap();
    tlv(&mut out, 1, b"synthetic test database");
    tlv(&mut out, 2, CIPHER_ID_AES256_CBC.as_bytes());
    tlv(&mut out, 3, &(gzip as u32).to_le_bytes());
    tlv(&mut out, 4, &MASTER_SEED);
    tlv(&mut out, 5, &TRANSFORM_SEED);
    tlv(&mut out, 6, &TRANSFORM_ROUNDS.to_le_bytes());
    tlv(&mut out, 7, &ENCRYPTION_IV);
    tlv(&mut out, 8, &PROTECTED_STREAM_KEY);
    tlv(&mut out, 9, &STREAM_START_BYTES);
    tlv(&mut out, 10, &2u32.to_le_bytes());
    tlv(&mut out, 0, b"\r\n\r\n");
    out
}

/// Base64 SHA-256 of the header, for embedding as `Meta/HeaderHash`
pub fn header_hash(gzip: bool) -> String {
    base64::encode(sha256(&build_header(gzip)))
}

fn final_key(password: &str) -> Vec<u8> {
    let composite = sha256(&sha256(password.as_bytes()));
    let kdf = AesKdf {
        seed: TRANSFORM_SEED,
        rounds: TRANSFORM_ROUNDS,
    };
    let transformed = kdf.transform_key(&composite).unwrap();
    let mut keyed = MASTER_SEED.to_vec();
    keyed.extend(transformed.iter());
    sha256(&keyed)
}

fn frame_blocks(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut index = 0u32;
    for chunk in payload.chunks(BLOCK_SIZE) {
        out.write_u32::<LittleEndian>(index).unwrap();
        out.write_all(&sha256(chunk)).unwrap();
        out.write_u32::<LittleEndian>(chunk.len() as u32).unwrap();
        out.write_all(chunk).unwrap();
        index += 1;
    }
    out.write_u32::<LittleEndian>(index).unwrap();
    out.write_all(&[0u8; 32]).unwrap();
    out.write_u32::<LittleEndian>(0).unwrap();
    out
}

/// Assemble a complete database image around the given XML document
pub fn build_file(xml: &str, password: &str, gzip: bool) -> Vec<u8> {
    let document = if gzip {
        let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(xml.as_bytes()).unwrap();
        encoder.finish().unwrap()
    } else {
        xml.as_bytes().to_vec()
    };

    let mut plaintext = STREAM_START_BYTES.to_vec();
    plaintext.extend(frame_blocks(&document));

    let ciphertext = encrypt(
        Cipher::aes_256_cbc(),
        &final_key(password),
        Some(&ENCRYPTION_IV),
        &plaintext,
    )
    .unwrap();

    let mut file = build_header(gzip);
    file.extend(ciphertext);
    file
}

/// A protection stream positioned at the start, keyed like the header says
pub fn protect_stream() -> CipherValue {
    new_stream(InnerStreamId::Salsa20, &PROTECTED_STREAM_KEY).unwrap()
}

/// Encrypt consecutive protected values, returning their base64 forms in
/// document order
pub fn protect_values(values: &[&str]) -> Vec<String> {
    let mut stream = protect_stream();
    values
        .iter()
        .map(|value| {
            let mut buf = value.as_bytes().to_vec();
            stream.apply_keystream(&mut buf);
            base64::encode(&buf)
        })
        .collect()
}

/// The XML document behind most happy-path tests: a root group named
/// NewDatabase with three child groups and one entry carrying tags and
/// two history revisions.
pub fn new_database_xml(header_hash: &str) -> String {
    let protected = protect_values(&["first secret", "second secret"]);
    format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<KeePassFile>
    <Meta>
        <Generator>KeePassX</Generator>
        <HeaderHash>{hash}</HeaderHash>
        <DatabaseName>NewDatabase</DatabaseName>
        <DatabaseNameChanged>2014-05-01T10:08:24Z</DatabaseNameChanged>
        <RecycleBinEnabled>True</RecycleBinEnabled>
        <RecycleBinUUID>eICTbJhHfUKzX4MAjxLCHQ==</RecycleBinUUID>
        <HistoryMaxItems>10</HistoryMaxItems>
        <HistoryMaxSize>6291456</HistoryMaxSize>
    </Meta>
    <Root>
        <Group>
            <UUID>lmU+9n0aeESKZvcEze+bRg==</UUID>
            <Name>NewDatabase</Name>
            <IconID>49</IconID>
            <IsExpanded>True</IsExpanded>
            <Entry>
                <UUID>ZAw4YRw+pEic7TYfVOQ9vg==</UUID>
                <IconID>0</IconID>
                <Tags>a b c</Tags>
                <Times>
                    <CreationTime>2014-05-10T18:20:49Z</CreationTime>
                    <LastModificationTime>2014-05-10T18:22:05Z</LastModificationTime>
                    <LastAccessTime>2014-05-10T18:22:05Z</LastAccessTime>
                    <ExpiryTime>2014-05-10T18:20:49Z</ExpiryTime>
                    <LocationChanged>2014-05-10T18:20:49Z</LocationChanged>
                    <Expires>False</Expires>
                    <UsageCount>0</UsageCount>
                </Times>
                <String><Key>Title</Key><Value>Sample Entry</Value></String>
                <String><Key>UserName</Key><Value>User Name</Value></String>
                <String><Key>Password</Key><Value Protected="True">{pw}</Value></String>
                <String><Key>Notes</Key><Value Protected="True">{notes}</Value></String>
                <History>
                    <Entry>
                        <UUID>ZAw4YRw+pEic7TYfVOQ9vg==</UUID>
                        <String><Key>Title</Key><Value>Old Title 1</Value></String>
                    </Entry>
                    <Entry>
                        <UUID>ZAw4YRw+pEic7TYfVOQ9vg==</UUID>
                        <String><Key>Title</Key><Value>Old Title 2</Value></String>
                    </Entry>
                </History>
            </Entry>
            <Group>
                <UUID>Lz2+eCLBcUqwotYnp9lNgQ==</UUID>
                <Name>General</Name>
            </Group>
            <Group>
                <UUID>Tq7/yYNoukeSpP3AY0d8cg==</UUID>
                <Name>Windows</Name>
            </Group>
            <Group>
                <UUID>eICTbJhHfUKzX4MAjxLCHQ==</UUID>
                <Name>Recycle Bin</Name>
            </Group>
        </Group>
    </Root>
</KeePassFile>"#,
        hash = header_hash,
        pw = protected[0],
        notes = protected[1],
    )
}
