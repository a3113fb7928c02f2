use std::collections::HashMap;
use std::io::{self, Read};

use base64::decode as base64_decode;
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use log::{debug, warn};
use uuid::Uuid;
use xml::attribute::OwnedAttribute;
use xml::name::OwnedName;
use xml::reader::{EventReader, ParserConfig, XmlEvent};

use crate::database::{
    Attribute, AutoType, AutoTypeAssociation, Color, Database, DeletedObject, Entry, Group, Meta,
    MemoryProtection, Times, TriState,
};
use crate::error::Error;
use crate::protected_stream::CipherValue;
use crate::streams::CorruptStream;

/// Decoder state shared across the document walk.
///
/// The inner random stream is drawn strictly in the order protected values
/// appear; this struct is its only owner during the parse.
pub(crate) struct XmlReadContext {
    random_stream: CipherValue,
    strict: bool,
    binaries: HashMap<i64, Vec<u8>>,
}

/// Decode the full XML document into `db`.
///
/// On error the partially populated `db` is left as-is so the caller can
/// honour the keep-on-error contract.
pub(crate) fn decode_database<R: Read>(
    source: R,
    random_stream: CipherValue,
    strict: bool,
    db: &mut Database,
) -> Result<(), Error> {
    let mut reader = ParserConfig::new().create_reader(source);
    let mut context = XmlReadContext {
        random_stream,
        strict,
        binaries: HashMap::new(),
    };

    loop {
        match next_event(&mut reader)? {
            XmlEvent::StartDocument { .. } => {}
            XmlEvent::StartElement { name, .. } if name.local_name == "KeePassFile" => {
                decode_document(&mut reader, &mut context, db)?;
                break;
            }
            XmlEvent::StartElement { name, .. } => {
                return Err(Error::XmlMalformed(format!(
                    "Unexpected root element <{}>",
                    name
                )));
            }
            XmlEvent::EndDocument => {
                return Err(Error::XmlMalformed("Empty XML document".to_string()));
            }
            _ => {}
        }
    }

    resolve_group_references(db);
    Ok(())
}

fn decode_document<R: Read>(
    reader: &mut EventReader<R>,
    context: &mut XmlReadContext,
    db: &mut Database,
) -> Result<(), Error> {
    let mut root_seen = false;
    let mut root_group = None;
    loop {
        match find_next_element(reader)? {
            ElementEvent::StartElement { name, .. } if name.local_name == "Meta" => {
                decode_meta(reader, context, &mut db.meta)?;
            }
            ElementEvent::StartElement { name, .. } if name.local_name == "Root" => {
                if root_seen {
                    if context.strict {
                        return Err(Error::XmlMalformed(
                            "Multiple root elements".to_string(),
                        ));
                    }
                    warn!("Multiple root elements; keeping the first");
                    let mut discarded = Database::default();
                    decode_root(reader, context, &mut discarded, &mut None)?;
                    continue;
                }
                root_seen = true;
                decode_root(reader, context, db, &mut root_group)?;
            }
            ElementEvent::StartElement { name, .. } => {
                debug!("Skipping document element <{}>", name);
                consume_element(reader, name)?;
            }
            ElementEvent::EndElement { name } if name.local_name == "KeePassFile" => {
                break;
            }
            ElementEvent::EndElement { name } => {
                return Err(Error::XmlMalformed(format!("Unexpected </{}>", name)));
            }
        }
    }

    match root_group {
        Some(group) => {
            db.root = group;
            Ok(())
        }
        None => Err(Error::XmlMalformed("No root group".to_string())),
    }
}

fn decode_root<R: Read>(
    reader: &mut EventReader<R>,
    context: &mut XmlReadContext,
    db: &mut Database,
    root_group: &mut Option<Group>,
) -> Result<(), Error> {
    loop {
        match find_next_element(reader)? {
            ElementEvent::StartElement { name, .. } if name.local_name == "Group" => {
                let group = decode_group(reader, context)?;
                if root_group.is_some() {
                    if context.strict {
                        return Err(Error::XmlMalformed("Multiple root groups".to_string()));
                    }
                    warn!("Multiple root groups; keeping the first");
                } else {
                    *root_group = Some(group);
                }
            }
            ElementEvent::StartElement { name, .. } if name.local_name == "DeletedObjects" => {
                decode_deleted_objects(reader, context, &mut db.deleted_objects)?;
            }
            ElementEvent::StartElement { name, .. } => {
                consume_element(reader, name)?;
            }
            ElementEvent::EndElement { name } if name.local_name == "Root" => {
                return Ok(());
            }
            ElementEvent::EndElement { name } => {
                return Err(Error::XmlMalformed(format!("Unexpected </{}>", name)));
            }
        }
    }
}

fn decode_meta<R: Read>(
    reader: &mut EventReader<R>,
    context: &mut XmlReadContext,
    meta: &mut Meta,
) -> Result<(), Error> {
    loop {
        let name = match find_next_element(reader)? {
            ElementEvent::StartElement { name, .. } => name,
            ElementEvent::EndElement { name } if name.local_name == "Meta" => return Ok(()),
            ElementEvent::EndElement { name } => {
                return Err(Error::XmlMalformed(format!("Unexpected </{}>", name)));
            }
        };
        let tag = name.local_name.clone();
        match tag.as_str() {
            "Generator" => meta.generator = decode_string(reader, name)?,
            "HeaderHash" => {
                let hash = decode_base64(reader, name)?;
                if !hash.is_empty() {
                    meta.header_hash = Some(hash);
                }
            }
            "DatabaseName" => meta.database_name = decode_string(reader, name)?,
            "DatabaseNameChanged" => {
                meta.database_name_changed = decode_optional_datetime(reader, name)?
            }
            "DatabaseDescription" => meta.database_description = decode_string(reader, name)?,
            "DatabaseDescriptionChanged" => {
                meta.database_description_changed = decode_optional_datetime(reader, name)?
            }
            "DefaultUserName" => meta.default_user_name = decode_string(reader, name)?,
            "DefaultUserNameChanged" => {
                meta.default_user_name_changed = decode_optional_datetime(reader, name)?
            }
            "Color" => meta.color = decode_color(reader, name)?,
            "MasterKeyChanged" => meta.master_key_changed = decode_optional_datetime(reader, name)?,
            "MemoryProtection" => {
                decode_memory_protection(reader, &mut meta.memory_protection)?
            }
            "RecycleBinEnabled" => meta.recycle_bin_enabled = decode_bool(reader, name)?,
            "RecycleBinUUID" => meta.recycle_bin = decode_optional_uuid(reader, name)?,
            "RecycleBinChanged" => {
                meta.recycle_bin_changed = decode_optional_datetime(reader, name)?
            }
            "EntryTemplatesGroup" => {
                meta.entry_templates_group = decode_optional_uuid(reader, name)?
            }
            "EntryTemplatesGroupChanged" => {
                meta.entry_templates_group_changed = decode_optional_datetime(reader, name)?
            }
            "HistoryMaxItems" => meta.history_max_items = decode_i64(reader, name)? as i32,
            "HistoryMaxSize" => meta.history_max_size = decode_i64(reader, name)?,
            "CustomIcons" => decode_custom_icons(reader, &mut meta.custom_icons)?,
            "Binaries" => decode_binaries(reader, context)?,
            "CustomData" => decode_custom_data(reader, &mut meta.custom_data)?,
            "LastSelectedGroup" => meta.last_selected_group = decode_optional_uuid(reader, name)?,
            "LastTopVisibleGroup" => {
                meta.last_top_visible_group = decode_optional_uuid(reader, name)?
            }
            _ => {
                debug!("Skipping meta element <{}>", name);
                consume_element(reader, name)?;
            }
        }
    }
}

fn decode_memory_protection<R: Read>(
    reader: &mut EventReader<R>,
    protection: &mut MemoryProtection,
) -> Result<(), Error> {
    loop {
        let name = match find_next_element(reader)? {
            ElementEvent::StartElement { name, .. } => name,
            ElementEvent::EndElement { name } if name.local_name == "MemoryProtection" => {
                return Ok(());
            }
            ElementEvent::EndElement { name } => {
                return Err(Error::XmlMalformed(format!("Unexpected </{}>", name)));
            }
        };
        let tag = name.local_name.clone();
        match tag.as_str() {
            "ProtectTitle" => protection.protect_title = decode_bool(reader, name)?,
            "ProtectUserName" => protection.protect_user_name = decode_bool(reader, name)?,
            "ProtectPassword" => protection.protect_password = decode_bool(reader, name)?,
            "ProtectURL" => protection.protect_url = decode_bool(reader, name)?,
            "ProtectNotes" => protection.protect_notes = decode_bool(reader, name)?,
            _ => {
                consume_element(reader, name)?;
            }
        }
    }
}

fn decode_custom_icons<R: Read>(
    reader: &mut EventReader<R>,
    icons: &mut HashMap<Uuid, Vec<u8>>,
) -> Result<(), Error> {
    loop {
        match find_next_element(reader)? {
            ElementEvent::StartElement { name, .. } if name.local_name == "Icon" => {
                let mut uuid = None;
                let mut data = Vec::new();
                loop {
                    match find_next_element(reader)? {
                        ElementEvent::StartElement { name, .. } if name.local_name == "UUID" => {
                            uuid = decode_optional_uuid(reader, name)?;
                        }
                        ElementEvent::StartElement { name, .. } if name.local_name == "Data" => {
                            data = decode_base64(reader, name)?;
                        }
                        ElementEvent::StartElement { name, .. } => {
                            consume_element(reader, name)?;
                        }
                        ElementEvent::EndElement { name } if name.local_name == "Icon" => break,
                        ElementEvent::EndElement { name } => {
                            return Err(Error::XmlMalformed(format!("Unexpected </{}>", name)));
                        }
                    }
                }
                if let Some(uuid) = uuid {
                    icons.insert(uuid, data);
                }
            }
            ElementEvent::StartElement { name, .. } => {
                consume_element(reader, name)?;
            }
            ElementEvent::EndElement { name } if name.local_name == "CustomIcons" => {
                return Ok(());
            }
            ElementEvent::EndElement { name } => {
                return Err(Error::XmlMalformed(format!("Unexpected </{}>", name)));
            }
        }
    }
}

/// The `Meta/Binaries` pool: integer ids shared by entry attachments
fn decode_binaries<R: Read>(
    reader: &mut EventReader<R>,
    context: &mut XmlReadContext,
) -> Result<(), Error> {
    loop {
        match find_next_element(reader)? {
            ElementEvent::StartElement { name, attributes } if name.local_name == "Binary" => {
                let id = match attribute_value(&attributes, "ID") {
                    Some(text) => text.parse::<i64>().map_err(|_| {
                        Error::XmlMalformed("Invalid binary id".to_string())
                    })?,
                    None => {
                        return Err(Error::XmlMalformed("Missing binary id".to_string()));
                    }
                };
                let compressed = attribute_bool(&attributes, "Compressed");
                let mut data = decode_base64(reader, name)?;
                if compressed {
                    data = gunzip(&data)
                        .map_err(|_| Error::XmlMalformed("Invalid compressed binary".to_string()))?;
                }
                context.binaries.insert(id, data);
            }
            ElementEvent::StartElement { name, .. } => {
                consume_element(reader, name)?;
            }
            ElementEvent::EndElement { name } if name.local_name == "Binaries" => {
                return Ok(());
            }
            ElementEvent::EndElement { name } => {
                return Err(Error::XmlMalformed(format!("Unexpected </{}>", name)));
            }
        }
    }
}

fn decode_custom_data<R: Read>(
    reader: &mut EventReader<R>,
    data: &mut HashMap<String, String>,
) -> Result<(), Error> {
    loop {
        match find_next_element(reader)? {
            ElementEvent::StartElement { name, .. } if name.local_name == "Item" => {
                let (key, value) = decode_item(reader)?;
                data.insert(key, value);
            }
            ElementEvent::StartElement { name, .. } => {
                consume_element(reader, name)?;
            }
            ElementEvent::EndElement { name } if name.local_name == "CustomData" => {
                return Ok(());
            }
            ElementEvent::EndElement { name } => {
                return Err(Error::XmlMalformed(format!("Unexpected </{}>", name)));
            }
        }
    }
}

fn decode_item<R: Read>(reader: &mut EventReader<R>) -> Result<(String, String), Error> {
    let mut key = String::new();
    let mut value = String::new();
    loop {
        match find_next_element(reader)? {
            ElementEvent::StartElement { name, .. } if name.local_name == "Key" => {
                key = decode_string(reader, name)?;
            }
            ElementEvent::StartElement { name, .. } if name.local_name == "Value" => {
                value = decode_string(reader, name)?;
            }
            ElementEvent::StartElement { name, .. } => {
                consume_element(reader, name)?;
            }
            ElementEvent::EndElement { name } if name.local_name == "Item" => {
                return Ok((key, value));
            }
            ElementEvent::EndElement { name } => {
                return Err(Error::XmlMalformed(format!("Unexpected </{}>", name)));
            }
        }
    }
}

fn decode_group<R: Read>(
    reader: &mut EventReader<R>,
    context: &mut XmlReadContext,
) -> Result<Group, Error> {
    let mut group = Group::default();
    loop {
        let name = match find_next_element(reader)? {
            ElementEvent::StartElement { name, .. } => name,
            ElementEvent::EndElement { name } if name.local_name == "Group" => break,
            ElementEvent::EndElement { name } => {
                return Err(Error::XmlMalformed(format!("Unexpected </{}>", name)));
            }
        };
        let tag = name.local_name.clone();
        match tag.as_str() {
            "UUID" => group.uuid = decode_uuid(reader, name)?,
            "Name" => group.name = decode_string(reader, name)?,
            "Notes" => group.notes = decode_string(reader, name)?,
            "IconID" => group.icon_id = decode_i64(reader, name)? as u32,
            "CustomIconUUID" => group.custom_icon = decode_optional_uuid(reader, name)?,
            "Times" => group.times = decode_times(reader)?,
            "IsExpanded" => group.is_expanded = decode_bool(reader, name)?,
            "DefaultAutoTypeSequence" => {
                group.default_auto_type_sequence = decode_string(reader, name)?
            }
            "EnableAutoType" => group.enable_auto_type = decode_tristate(reader, name)?,
            "EnableSearching" => group.enable_searching = decode_tristate(reader, name)?,
            "LastTopVisibleEntry" => {
                group.last_top_visible_entry = decode_optional_uuid(reader, name)?
            }
            "Entry" => {
                let entry = decode_entry(reader, context, false)?;
                group.entries.push(entry);
            }
            "Group" => {
                let child = decode_group(reader, context)?;
                group.groups.push(child);
            }
            _ => {
                debug!("Skipping group element <{}>", name);
                consume_element(reader, name)?;
            }
        }
    }

    if group.uuid.is_nil() {
        if context.strict {
            return Err(Error::XmlMalformed("Null group uuid".to_string()));
        }
        warn!("Group \"{}\" has no uuid; generating one", group.name);
        group.uuid = Uuid::new_v4();
    }
    Ok(group)
}

fn decode_entry<R: Read>(
    reader: &mut EventReader<R>,
    context: &mut XmlReadContext,
    in_history: bool,
) -> Result<Entry, Error> {
    let mut entry = Entry::default();
    loop {
        let name = match find_next_element(reader)? {
            ElementEvent::StartElement { name, .. } => name,
            ElementEvent::EndElement { name } if name.local_name == "Entry" => break,
            ElementEvent::EndElement { name } => {
                return Err(Error::XmlMalformed(format!("Unexpected </{}>", name)));
            }
        };
        let tag = name.local_name.clone();
        match tag.as_str() {
            "UUID" => entry.uuid = decode_uuid(reader, name)?,
            "IconID" => entry.icon_id = decode_i64(reader, name)? as u32,
            "CustomIconUUID" => entry.custom_icon = decode_optional_uuid(reader, name)?,
            "ForegroundColor" => entry.foreground_color = decode_color(reader, name)?,
            "BackgroundColor" => entry.background_color = decode_color(reader, name)?,
            "OverrideURL" => entry.override_url = decode_string(reader, name)?,
            "Tags" => entry.tags = decode_string(reader, name)?,
            "Times" => entry.times = decode_times(reader)?,
            "String" => {
                let (key, attribute) = decode_entry_string(reader, context)?;
                entry.attributes.insert(key, attribute);
            }
            "Binary" => {
                if let Some((key, data)) = decode_entry_binary(reader, context)? {
                    entry.attachments.insert(key, data);
                }
            }
            "AutoType" => entry.auto_type = decode_auto_type(reader)?,
            "History" => {
                if in_history {
                    warn!("Ignoring nested history");
                    consume_element(reader, name)?;
                } else {
                    decode_history(reader, context, &mut entry.history)?;
                }
            }
            _ => {
                debug!("Skipping entry element <{}>", name);
                consume_element(reader, name)?;
            }
        }
    }

    if entry.uuid.is_nil() {
        if context.strict {
            return Err(Error::XmlMalformed("Null entry uuid".to_string()));
        }
        warn!("Entry \"{}\" has no uuid; generating one", entry.title());
        entry.uuid = Uuid::new_v4();
    }

    if !in_history {
        let entry_uuid = entry.uuid;
        let entry_title = entry.title().to_string();
        for history in &mut entry.history {
            if history.uuid != entry_uuid {
                if context.strict {
                    return Err(Error::XmlMalformed(
                        "History element with different uuid".to_string(),
                    ));
                }
                warn!("Repairing history uuid for entry \"{}\"", entry_title);
                history.uuid = entry_uuid;
            }
        }
    }
    Ok(entry)
}

fn decode_history<R: Read>(
    reader: &mut EventReader<R>,
    context: &mut XmlReadContext,
    history: &mut Vec<Entry>,
) -> Result<(), Error> {
    loop {
        match find_next_element(reader)? {
            ElementEvent::StartElement { name, .. } if name.local_name == "Entry" => {
                history.push(decode_entry(reader, context, true)?);
            }
            ElementEvent::StartElement { name, .. } => {
                consume_element(reader, name)?;
            }
            ElementEvent::EndElement { name } if name.local_name == "History" => {
                return Ok(());
            }
            ElementEvent::EndElement { name } => {
                return Err(Error::XmlMalformed(format!("Unexpected </{}>", name)));
            }
        }
    }
}

/// One `String` child: a key plus a possibly protected value.
///
/// Protected values draw keystream at the exact moment they are decoded,
/// which keeps reader and writer in lockstep on stream position.
fn decode_entry_string<R: Read>(
    reader: &mut EventReader<R>,
    context: &mut XmlReadContext,
) -> Result<(String, Attribute), Error> {
    let mut key = String::new();
    let mut attribute = Attribute::default();
    loop {
        match find_next_element(reader)? {
            ElementEvent::StartElement { name, .. } if name.local_name == "Key" => {
                key = decode_string(reader, name)?;
            }
            ElementEvent::StartElement { name, attributes } if name.local_name == "Value" => {
                if attribute_bool(&attributes, "Protected") {
                    let ciphertext = decode_base64(reader, name)?;
                    attribute.value = unprotect_value(context, ciphertext);
                    attribute.protected = true;
                } else {
                    attribute.value = decode_string(reader, name)?;
                }
            }
            ElementEvent::StartElement { name, .. } => {
                consume_element(reader, name)?;
            }
            ElementEvent::EndElement { name } if name.local_name == "String" => {
                return Ok((key, attribute));
            }
            ElementEvent::EndElement { name } => {
                return Err(Error::XmlMalformed(format!("Unexpected </{}>", name)));
            }
        }
    }
}

fn unprotect_value(context: &mut XmlReadContext, mut ciphertext: Vec<u8>) -> String {
    context.random_stream.apply_keystream(&mut ciphertext);
    strip_invalid_xml_chars(String::from_utf8_lossy(&ciphertext).into_owned())
}

/// An entry attachment: named reference into the binary pool, or inline data
fn decode_entry_binary<R: Read>(
    reader: &mut EventReader<R>,
    context: &mut XmlReadContext,
) -> Result<Option<(String, Vec<u8>)>, Error> {
    let mut key = String::new();
    let mut data = None;
    loop {
        match find_next_element(reader)? {
            ElementEvent::StartElement { name, .. } if name.local_name == "Key" => {
                key = decode_string(reader, name)?;
            }
            ElementEvent::StartElement { name, attributes } if name.local_name == "Value" => {
                if let Some(reference) = attribute_value(&attributes, "Ref") {
                    let id = reference.parse::<i64>().map_err(|_| {
                        Error::XmlMalformed("Invalid binary reference".to_string())
                    })?;
                    consume_element(reader, name)?;
                    match context.binaries.get(&id) {
                        Some(bytes) => data = Some(bytes.clone()),
                        None => {
                            if context.strict {
                                return Err(Error::XmlMalformed(format!(
                                    "Unmapped binary reference {}",
                                    id
                                )));
                            }
                            warn!("Dropping attachment with unmapped binary reference {}", id);
                        }
                    }
                } else {
                    let compressed = attribute_bool(&attributes, "Compressed");
                    let mut inline = decode_base64(reader, name)?;
                    if compressed {
                        inline = gunzip(&inline).map_err(|_| {
                            Error::XmlMalformed("Invalid compressed binary".to_string())
                        })?;
                    }
                    data = Some(inline);
                }
            }
            ElementEvent::StartElement { name, .. } => {
                consume_element(reader, name)?;
            }
            ElementEvent::EndElement { name } if name.local_name == "Binary" => {
                return Ok(data.map(|d| (key, d)));
            }
            ElementEvent::EndElement { name } => {
                return Err(Error::XmlMalformed(format!("Unexpected </{}>", name)));
            }
        }
    }
}

fn decode_auto_type<R: Read>(reader: &mut EventReader<R>) -> Result<AutoType, Error> {
    let mut auto_type = AutoType::default();
    loop {
        let name = match find_next_element(reader)? {
            ElementEvent::StartElement { name, .. } => name,
            ElementEvent::EndElement { name } if name.local_name == "AutoType" => {
                return Ok(auto_type);
            }
            ElementEvent::EndElement { name } => {
                return Err(Error::XmlMalformed(format!("Unexpected </{}>", name)));
            }
        };
        let tag = name.local_name.clone();
        match tag.as_str() {
            "Enabled" => auto_type.enabled = decode_bool(reader, name)?,
            "DataTransferObfuscation" => {
                auto_type.obfuscation = decode_i64(reader, name)? as i32
            }
            "DefaultSequence" => auto_type.default_sequence = decode_string(reader, name)?,
            "Association" => {
                auto_type.associations.push(decode_association(reader)?);
            }
            _ => {
                consume_element(reader, name)?;
            }
        }
    }
}

fn decode_association<R: Read>(
    reader: &mut EventReader<R>,
) -> Result<AutoTypeAssociation, Error> {
    let mut association = AutoTypeAssociation::default();
    loop {
        match find_next_element(reader)? {
            ElementEvent::StartElement { name, .. } if name.local_name == "Window" => {
                association.window = decode_string(reader, name)?;
            }
            ElementEvent::StartElement { name, .. }
                if name.local_name == "KeystrokeSequence" =>
            {
                association.sequence = decode_string(reader, name)?;
            }
            ElementEvent::StartElement { name, .. } => {
                consume_element(reader, name)?;
            }
            ElementEvent::EndElement { name } if name.local_name == "Association" => {
                return Ok(association);
            }
            ElementEvent::EndElement { name } => {
                return Err(Error::XmlMalformed(format!("Unexpected </{}>", name)));
            }
        }
    }
}

fn decode_times<R: Read>(reader: &mut EventReader<R>) -> Result<Times, Error> {
    let mut times = Times::default();
    loop {
        let name = match find_next_element(reader)? {
            ElementEvent::StartElement { name, .. } => name,
            ElementEvent::EndElement { name } if name.local_name == "Times" => return Ok(times),
            ElementEvent::EndElement { name } => {
                return Err(Error::XmlMalformed(format!("Unexpected </{}>", name)));
            }
        };
        let tag = name.local_name.clone();
        match tag.as_str() {
            "CreationTime" => times.creation_time = decode_datetime(reader, name)?,
            "LastModificationTime" => {
                times.last_modification_time = decode_datetime(reader, name)?
            }
            "LastAccessTime" => times.last_access_time = decode_datetime(reader, name)?,
            "ExpiryTime" => times.expiry_time = decode_datetime(reader, name)?,
            "LocationChanged" => times.location_changed = decode_datetime(reader, name)?,
            "Expires" => times.expires = decode_bool(reader, name)?,
            "UsageCount" => times.usage_count = decode_i64(reader, name)? as i32,
            _ => {
                consume_element(reader, name)?;
            }
        }
    }
}

fn decode_deleted_objects<R: Read>(
    reader: &mut EventReader<R>,
    context: &mut XmlReadContext,
    deleted: &mut Vec<DeletedObject>,
) -> Result<(), Error> {
    loop {
        match find_next_element(reader)? {
            ElementEvent::StartElement { name, .. } if name.local_name == "DeletedObject" => {
                match decode_deleted_object(reader)? {
                    Some(object) => deleted.push(object),
                    None => {
                        if context.strict {
                            return Err(Error::XmlMalformed(
                                "Invalid deleted object".to_string(),
                            ));
                        }
                        warn!("Dropping malformed deleted object");
                    }
                }
            }
            ElementEvent::StartElement { name, .. } => {
                consume_element(reader, name)?;
            }
            ElementEvent::EndElement { name } if name.local_name == "DeletedObjects" => {
                return Ok(());
            }
            ElementEvent::EndElement { name } => {
                return Err(Error::XmlMalformed(format!("Unexpected </{}>", name)));
            }
        }
    }
}

fn decode_deleted_object<R: Read>(
    reader: &mut EventReader<R>,
) -> Result<Option<DeletedObject>, Error> {
    let mut uuid = None;
    let mut deletion_time = None;
    loop {
        match find_next_element(reader)? {
            ElementEvent::StartElement { name, .. } if name.local_name == "UUID" => {
                uuid = decode_optional_uuid(reader, name)?;
            }
            ElementEvent::StartElement { name, .. } if name.local_name == "DeletionTime" => {
                deletion_time = Some(decode_datetime(reader, name)?);
            }
            ElementEvent::StartElement { name, .. } => {
                consume_element(reader, name)?;
            }
            ElementEvent::EndElement { name } if name.local_name == "DeletedObject" => {
                return Ok(match (uuid, deletion_time) {
                    (Some(uuid), Some(deletion_time)) => Some(DeletedObject {
                        uuid,
                        deletion_time,
                    }),
                    _ => None,
                });
            }
            ElementEvent::EndElement { name } => {
                return Err(Error::XmlMalformed(format!("Unexpected </{}>", name)));
            }
        }
    }
}

/// Unresolved references silently become null, even in strict mode
fn resolve_group_references(db: &mut Database) {
    if let Some(uuid) = db.meta.recycle_bin {
        if db.root.find_group(uuid).is_none() {
            debug!("Recycle bin reference does not resolve; clearing");
            db.meta.recycle_bin = None;
        }
    }
    if let Some(uuid) = db.meta.entry_templates_group {
        if db.root.find_group(uuid).is_none() {
            debug!("Entry templates reference does not resolve; clearing");
            db.meta.entry_templates_group = None;
        }
    }
}

pub(crate) enum ElementEvent {
    StartElement {
        name: OwnedName,
        attributes: Vec<OwnedAttribute>,
    },
    EndElement {
        name: OwnedName,
    },
}

fn next_event<R: Read>(reader: &mut EventReader<R>) -> Result<XmlEvent, Error> {
    reader.next().map_err(from_xml_error)
}

fn from_xml_error(err: xml::reader::Error) -> Error {
    use xml::reader::ErrorKind;
    match err.kind() {
        ErrorKind::Io(io_err) => {
            let corrupt = io_err
                .get_ref()
                .map_or(false, |inner| inner.is::<CorruptStream>());
            if corrupt
                || matches!(
                    io_err.kind(),
                    io::ErrorKind::InvalidData
                        | io::ErrorKind::InvalidInput
                        | io::ErrorKind::UnexpectedEof
                )
            {
                Error::StreamCorrupted(io_err.to_string())
            } else {
                Error::Io(io::Error::new(io_err.kind(), io_err.to_string()))
            }
        }
        _ => Error::XmlMalformed(err.to_string()),
    }
}

fn find_next_element<R: Read>(reader: &mut EventReader<R>) -> Result<ElementEvent, Error> {
    loop {
        match next_event(reader)? {
            XmlEvent::StartDocument { .. } | XmlEvent::EndDocument => {
                return Err(Error::XmlMalformed("Malformed XML document".to_string()));
            }
            XmlEvent::StartElement {
                name, attributes, ..
            } => {
                return Ok(ElementEvent::StartElement { name, attributes });
            }
            XmlEvent::EndElement { name, .. } => {
                return Ok(ElementEvent::EndElement { name });
            }
            _ => {}
        }
    }
}

/// Skip an element and its whole subtree, returning any top-level text
fn consume_element<R: Read>(
    reader: &mut EventReader<R>,
    name: OwnedName,
) -> Result<Option<String>, Error> {
    let mut elements = vec![name];
    let mut string = None;

    while !elements.is_empty() {
        match next_event(reader)? {
            XmlEvent::StartDocument { .. } | XmlEvent::EndDocument => {
                return Err(Error::XmlMalformed("Malformed XML document".to_string()));
            }
            XmlEvent::StartElement { name, .. } => {
                elements.push(name);
            }
            XmlEvent::Characters(text) => {
                if elements.len() == 1 {
                    string = Some(text);
                }
            }
            XmlEvent::EndElement { name, .. } => {
                let start_tag = elements.pop().expect("balanced by loop condition");
                if start_tag != name {
                    return Err(Error::XmlMalformed(format!(
                        "Start tag <{}> mismatches end tag </{}>",
                        start_tag, name
                    )));
                }
            }
            _ => {}
        }
    }
    Ok(string)
}

fn decode_optional_string<R: Read>(
    reader: &mut EventReader<R>,
    name: OwnedName,
) -> Result<Option<String>, Error> {
    let mut elements = vec![name];
    let mut string = String::new();

    while !elements.is_empty() {
        match next_event(reader)? {
            XmlEvent::StartDocument { .. } | XmlEvent::EndDocument => {
                return Err(Error::XmlMalformed("Malformed XML document".to_string()));
            }
            XmlEvent::StartElement { name, .. } => {
                elements.push(name);
            }
            XmlEvent::Characters(text) | XmlEvent::CData(text) => {
                if elements.len() == 1 {
                    string.push_str(&text);
                }
            }
            XmlEvent::Whitespace(text) => {
                if elements.len() == 1 {
                    string.push_str(&text);
                }
            }
            XmlEvent::EndElement { name, .. } => {
                let start_tag = elements.pop().expect("balanced by loop condition");
                if start_tag != name {
                    return Err(Error::XmlMalformed(format!(
                        "Start tag <{}> mismatches end tag </{}>",
                        start_tag, name
                    )));
                }
            }
            _ => {}
        }
    }
    if string.is_empty() {
        Ok(None)
    } else {
        Ok(Some(strip_invalid_xml_chars(string)))
    }
}

fn decode_string<R: Read>(reader: &mut EventReader<R>, name: OwnedName) -> Result<String, Error> {
    decode_optional_string(reader, name).map(Option::unwrap_or_default)
}

fn decode_optional_bool<R: Read>(
    reader: &mut EventReader<R>,
    name: OwnedName,
) -> Result<Option<bool>, Error> {
    decode_optional_string(reader, name)
        .map(|text| text.map(|value| value.eq_ignore_ascii_case("true")))
}

fn decode_bool<R: Read>(reader: &mut EventReader<R>, name: OwnedName) -> Result<bool, Error> {
    decode_optional_bool(reader, name).map(|value| value.unwrap_or(false))
}

fn decode_tristate<R: Read>(
    reader: &mut EventReader<R>,
    name: OwnedName,
) -> Result<TriState, Error> {
    Ok(match decode_optional_string(reader, name)? {
        Some(text) if text.eq_ignore_ascii_case("true") => TriState::Enable,
        Some(text) if text.eq_ignore_ascii_case("false") => TriState::Disable,
        _ => TriState::Inherit,
    })
}

fn decode_i64<R: Read>(reader: &mut EventReader<R>, name: OwnedName) -> Result<i64, Error> {
    match decode_optional_string(reader, name)? {
        Some(text) => text
            .trim()
            .parse()
            .map_err(|_| Error::XmlMalformed(format!("Invalid number \"{}\"", text))),
        None => Ok(0),
    }
}

fn decode_optional_datetime<R: Read>(
    reader: &mut EventReader<R>,
    name: OwnedName,
) -> Result<Option<DateTime<Utc>>, Error> {
    match decode_optional_string(reader, name)? {
        Some(text) => DateTime::parse_from_rfc3339(text.trim())
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(|_| Error::XmlMalformed(format!("Invalid date time value \"{}\"", text))),
        None => Ok(None),
    }
}

fn decode_datetime<R: Read>(
    reader: &mut EventReader<R>,
    name: OwnedName,
) -> Result<DateTime<Utc>, Error> {
    decode_optional_datetime(reader, name)
        .map(|value| value.unwrap_or(DateTime::<Utc>::UNIX_EPOCH))
}

fn decode_optional_uuid<R: Read>(
    reader: &mut EventReader<R>,
    name: OwnedName,
) -> Result<Option<Uuid>, Error> {
    match decode_optional_string(reader, name)? {
        Some(text) => {
            let raw = base64_decode(text.trim())
                .map_err(|_| Error::XmlMalformed("Invalid uuid value".to_string()))?;
            let uuid = Uuid::from_slice(&raw)
                .map_err(|_| Error::XmlMalformed("Invalid uuid value".to_string()))?;
            if uuid.is_nil() {
                Ok(None)
            } else {
                Ok(Some(uuid))
            }
        }
        None => Ok(None),
    }
}

fn decode_uuid<R: Read>(reader: &mut EventReader<R>, name: OwnedName) -> Result<Uuid, Error> {
    decode_optional_uuid(reader, name).map(|value| value.unwrap_or_default())
}

fn decode_base64<R: Read>(reader: &mut EventReader<R>, name: OwnedName) -> Result<Vec<u8>, Error> {
    match decode_optional_string(reader, name)? {
        Some(text) => base64_decode(text.trim())
            .map_err(|_| Error::XmlMalformed("Invalid base64 value".to_string())),
        None => Ok(Vec::new()),
    }
}

fn decode_color<R: Read>(
    reader: &mut EventReader<R>,
    name: OwnedName,
) -> Result<Option<Color>, Error> {
    Ok(decode_optional_string(reader, name)?
        .as_deref()
        .and_then(Color::parse))
}

fn attribute_value<'a>(attributes: &'a [OwnedAttribute], name: &str) -> Option<&'a str> {
    attributes
        .iter()
        .find(|attr| attr.name.local_name == name)
        .map(|attr| attr.value.as_str())
}

fn attribute_bool(attributes: &[OwnedAttribute], name: &str) -> bool {
    attribute_value(attributes, name).map_or(false, |value| value.eq_ignore_ascii_case("true"))
}

fn gunzip(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

/// Keep only code points permitted in XML 1.0 character data.
///
/// Rust strings cannot carry unpaired surrogates, so the surrogate range
/// is excluded structurally; valid pairs arrive here as supplementary
/// code points and pass through.
fn strip_invalid_xml_chars(text: String) -> String {
    if text.chars().all(is_valid_xml_char) {
        return text;
    }
    text.chars().filter(|c| is_valid_xml_char(*c)).collect()
}

fn is_valid_xml_char(c: char) -> bool {
    matches!(c, '\t' | '\n' | '\r')
        || ('\u{20}'..='\u{D7FF}').contains(&c)
        || ('\u{E000}'..='\u{FFFD}').contains(&c)
        || c >= '\u{10000}'
}
