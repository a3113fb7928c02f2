use byteorder::{LittleEndian, WriteBytesExt};

use kdbx3::{read_database, Error, Key, ReadOptions};

mod common;

fn test_key() -> Key {
    let mut key = Key::new();
    key.set_user_password(common::PASSWORD);
    key
}

fn new_database_file() -> Vec<u8> {
    let xml = common::new_database_xml(&common::header_hash(true));
    common::build_file(&xml, common::PASSWORD, true)
}

#[test]
fn wrong_password_is_authentication_failure() {
    let file = new_database_file();
    let mut key = Key::new();
    key.set_user_password("tset");

    let err = read_database(&file[..], &key, &ReadOptions::default()).unwrap_err();
    // Never a stream or XML error: the start gate fires first
    assert!(matches!(err, Error::AuthenticationFailed));
    assert_eq!(err.to_string(), "Wrong key or database file is corrupt.");
}

#[test]
fn kdb1_signature_names_import_path() {
    let mut file = Vec::new();
    file.write_u32::<LittleEndian>(kdbx3::KDBX_SIGNATURE_1).unwrap();
    file.write_u32::<LittleEndian>(kdbx3::KDB1_SIGNATURE_2).unwrap();
    file.extend([0u8; 64]);

    let err = read_database(&file[..], &test_key(), &ReadOptions::default()).unwrap_err();
    assert!(matches!(err, Error::LegacyDatabase));
    assert!(err.to_string().contains(".kdb"));
}

#[test]
fn garbage_is_not_a_database() {
    let file = b"PK\x03\x04 definitely a zip file".to_vec();
    let err = read_database(&file[..], &test_key(), &ReadOptions::default()).unwrap_err();
    assert!(matches!(err, Error::NotDatabase));
}

#[test]
fn future_version_is_unsupported() {
    let mut file = new_database_file();
    // Patch the version word at offset 8 to 4.0
    file[8..12].copy_from_slice(&0x0004_0000u32.to_le_bytes());
    let err = read_database(&file[..], &test_key(), &ReadOptions::default()).unwrap_err();
    assert!(matches!(err, Error::UnsupportedVersion));
}

#[test]
fn empty_key_fails_key_derivation() {
    let file = new_database_file();
    let err = read_database(&file[..], &Key::new(), &ReadOptions::default()).unwrap_err();
    assert!(matches!(err, Error::KeyDerivationFailed(_)));
}

#[test]
fn truncation_after_stream_start_is_corruption() {
    let file = new_database_file();
    let header_len = common::build_header(true).len();
    // Keep the header plus four cipher blocks: enough to pass the start
    // gate, not enough to carry a whole hashed block
    let truncated = &file[..header_len + 64];
    let err = read_database(truncated, &test_key(), &ReadOptions::default()).unwrap_err();
    assert!(matches!(err, Error::StreamCorrupted(_)));
}

#[test]
fn flipped_ciphertext_is_corruption() {
    let mut file = new_database_file();
    let header_len = common::build_header(true).len();
    // Past the stream start bytes, inside the first hashed block payload
    file[header_len + 200] ^= 0x01;
    let err = read_database(&file[..], &test_key(), &ReadOptions::default()).unwrap_err();
    assert!(matches!(err, Error::StreamCorrupted(_)));
}

#[test]
fn flipped_header_byte_fails_hash_binding() {
    let mut file = new_database_file();
    // Flip a byte inside the header comment field: parsing and key
    // derivation are unaffected, only the retained bytes change
    let comment_offset = 12 + 3 + 4;
    assert_eq!(file[12], 1, "expected comment TLV first");
    file[comment_offset] ^= 0x01;
    let err = read_database(&file[..], &test_key(), &ReadOptions::default()).unwrap_err();
    assert!(matches!(err, Error::HeaderHashMismatch));
}

const NO_ROOT_GROUP_XML: &str = r#"<KeePassFile><Meta/><Root></Root></KeePassFile>"#;

#[test]
fn no_root_group_fails_in_both_modes() {
    for strict in [true, false] {
        let file = common::build_file(NO_ROOT_GROUP_XML, common::PASSWORD, true);
        let options = ReadOptions {
            strict,
            ..ReadOptions::default()
        };
        let err = read_database(&file[..], &test_key(), &options).unwrap_err();
        assert!(
            matches!(err, Error::XmlMalformed(ref msg) if msg.contains("No root group")),
            "strict={}",
            strict
        );
    }
}

fn history_mismatch_xml() -> String {
    r#"<KeePassFile><Meta>
        <DatabaseName>Broken</DatabaseName>
    </Meta><Root>
        <Group><UUID>lmU+9n0aeESKZvcEze+bRg==</UUID><Name>root</Name>
            <Entry><UUID>AAECAwQFBgcICQoLDA0ODw==</UUID>
                <String><Key>Title</Key><Value>current</Value></String>
                <History>
                    <Entry><UUID>Dw4NDAsKCQgHBgUEAwIBAA==</UUID>
                        <String><Key>Title</Key><Value>old</Value></String>
                    </Entry>
                </History>
            </Entry>
        </Group>
    </Root></KeePassFile>"#
        .to_string()
}

#[test]
fn history_uuid_mismatch_strict_vs_repair() {
    let file = common::build_file(&history_mismatch_xml(), common::PASSWORD, true);

    let strict = ReadOptions {
        strict: true,
        ..ReadOptions::default()
    };
    let err = read_database(&file[..], &test_key(), &strict).unwrap_err();
    assert!(matches!(err, Error::XmlMalformed(_)));

    let db = read_database(&file[..], &test_key(), &ReadOptions::default()).unwrap();
    let entry = &db.root_group().entries[0];
    assert_eq!(entry.history.len(), 1);
    assert_eq!(entry.history[0].uuid, entry.uuid);
}

#[test]
fn keep_on_xml_error_returns_partial_database() {
    let file = common::build_file(&history_mismatch_xml(), common::PASSWORD, true);
    let options = ReadOptions {
        strict: true,
        keep_on_xml_error: true,
    };
    let db = read_database(&file[..], &test_key(), &options).unwrap();
    // The metadata parsed before the failure is retained
    assert_eq!(db.meta.database_name, "Broken");
}

#[test]
fn malformed_xml_is_reported_as_such() {
    let file = common::build_file("<KeePassFile><Meta>", common::PASSWORD, true);
    let err = read_database(&file[..], &test_key(), &ReadOptions::default()).unwrap_err();
    assert!(matches!(err, Error::XmlMalformed(_)));
}
