use std::collections::HashMap;

use chrono::{DateTime, Utc};
use uuid::Uuid;

pub const DEFAULT_HISTORY_MAX_ITEMS: i32 = 10;
pub const DEFAULT_HISTORY_MAX_SIZE: i64 = 6 * 1024 * 1024;

/// An unlocked password database: metadata plus the group tree.
///
/// The database owns all groups, entries, attachments and icons and is
/// returned from [`crate::read_database`] as a single unit.
#[derive(Clone, Debug, Default)]
pub struct Database {
    pub meta: Meta,
    pub root: Group,
    pub deleted_objects: Vec<DeletedObject>,
}

impl Database {
    pub fn root_group(&self) -> &Group {
        &self.root
    }

    /// The recycle bin group, when enabled and resolvable
    pub fn recycle_bin(&self) -> Option<&Group> {
        if !self.meta.recycle_bin_enabled {
            return None;
        }
        self.root.find_group(self.meta.recycle_bin?)
    }
}

#[derive(Clone, Debug)]
pub struct Meta {
    pub generator: String,
    pub header_hash: Option<Vec<u8>>,
    pub database_name: String,
    pub database_name_changed: Option<DateTime<Utc>>,
    pub database_description: String,
    pub database_description_changed: Option<DateTime<Utc>>,
    pub default_user_name: String,
    pub default_user_name_changed: Option<DateTime<Utc>>,
    pub color: Option<Color>,
    pub master_key_changed: Option<DateTime<Utc>>,
    pub memory_protection: MemoryProtection,
    pub recycle_bin_enabled: bool,
    pub recycle_bin: Option<Uuid>,
    pub recycle_bin_changed: Option<DateTime<Utc>>,
    pub entry_templates_group: Option<Uuid>,
    pub entry_templates_group_changed: Option<DateTime<Utc>>,
    pub history_max_items: i32,
    pub history_max_size: i64,
    pub custom_icons: HashMap<Uuid, Vec<u8>>,
    pub custom_data: HashMap<String, String>,
    pub last_selected_group: Option<Uuid>,
    pub last_top_visible_group: Option<Uuid>,
}

impl Default for Meta {
    fn default() -> Self {
        Self {
            generator: String::new(),
            header_hash: None,
            database_name: String::new(),
            database_name_changed: None,
            database_description: String::new(),
            database_description_changed: None,
            default_user_name: String::new(),
            default_user_name_changed: None,
            color: None,
            master_key_changed: None,
            memory_protection: MemoryProtection::default(),
            recycle_bin_enabled: false,
            recycle_bin: None,
            recycle_bin_changed: None,
            entry_templates_group: None,
            entry_templates_group_changed: None,
            history_max_items: DEFAULT_HISTORY_MAX_ITEMS,
            history_max_size: DEFAULT_HISTORY_MAX_SIZE,
            custom_icons: HashMap::new(),
            custom_data: HashMap::new(),
            last_selected_group: None,
            last_top_visible_group: None,
        }
    }
}

/// Which entry attributes the application keeps encrypted in memory
#[derive(Clone, Debug)]
pub struct MemoryProtection {
    pub protect_title: bool,
    pub protect_user_name: bool,
    pub protect_password: bool,
    pub protect_url: bool,
    pub protect_notes: bool,
}

impl Default for MemoryProtection {
    fn default() -> Self {
        Self {
            protect_title: false,
            protect_user_name: false,
            protect_password: true,
            protect_url: false,
            protect_notes: false,
        }
    }
}

/// Inheritable group flag: `null` in the XML means inherit from the parent
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TriState {
    #[default]
    Inherit,
    Enable,
    Disable,
}

#[derive(Clone, Debug, Default)]
pub struct Group {
    pub uuid: Uuid,
    pub name: String,
    pub notes: String,
    pub icon_id: u32,
    pub custom_icon: Option<Uuid>,
    pub is_expanded: bool,
    pub default_auto_type_sequence: String,
    pub enable_auto_type: TriState,
    pub enable_searching: TriState,
    pub times: Times,
    pub last_top_visible_entry: Option<Uuid>,
    pub groups: Vec<Group>,
    pub entries: Vec<Entry>,
}

impl Group {
    /// Depth-first traversal of this group and every descendant
    pub fn all_groups(&self) -> GroupIter<'_> {
        GroupIter { stack: vec![self] }
    }

    /// Every entry in this group and its descendants, in tree order
    pub fn all_entries(&self) -> impl Iterator<Item = &Entry> {
        self.all_groups().flat_map(|g| g.entries.iter())
    }

    pub fn find_group(&self, uuid: Uuid) -> Option<&Group> {
        self.all_groups().find(|g| g.uuid == uuid)
    }
}

pub struct GroupIter<'a> {
    stack: Vec<&'a Group>,
}

impl<'a> Iterator for GroupIter<'a> {
    type Item = &'a Group;

    fn next(&mut self) -> Option<Self::Item> {
        let group = self.stack.pop()?;
        for child in group.groups.iter().rev() {
            self.stack.push(child);
        }
        Some(group)
    }
}

/// A single entry attribute value and its protection flag
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Attribute {
    pub value: String,
    pub protected: bool,
}

#[derive(Clone, Debug, Default)]
pub struct Entry {
    pub uuid: Uuid,
    pub icon_id: u32,
    pub custom_icon: Option<Uuid>,
    pub foreground_color: Option<Color>,
    pub background_color: Option<Color>,
    pub override_url: String,
    pub tags: String,
    pub times: Times,
    pub attributes: HashMap<String, Attribute>,
    pub attachments: HashMap<String, Vec<u8>>,
    pub auto_type: AutoType,
    pub history: Vec<Entry>,
}

impl Entry {
    fn attribute(&self, key: &str) -> &str {
        self.attributes.get(key).map(|a| a.value.as_str()).unwrap_or("")
    }

    pub fn title(&self) -> &str {
        self.attribute("Title")
    }

    pub fn username(&self) -> &str {
        self.attribute("UserName")
    }

    pub fn password(&self) -> &str {
        self.attribute("Password")
    }

    pub fn url(&self) -> &str {
        self.attribute("URL")
    }

    pub fn notes(&self) -> &str {
        self.attribute("Notes")
    }

    /// Tags as stored: a space-separated list
    pub fn tag_list(&self) -> impl Iterator<Item = &str> {
        self.tags.split(' ').filter(|t| !t.is_empty())
    }
}

#[derive(Clone, Debug)]
pub struct AutoType {
    pub enabled: bool,
    pub obfuscation: i32,
    pub default_sequence: String,
    pub associations: Vec<AutoTypeAssociation>,
}

impl Default for AutoType {
    fn default() -> Self {
        Self {
            enabled: true,
            obfuscation: 0,
            default_sequence: String::new(),
            associations: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AutoTypeAssociation {
    pub window: String,
    pub sequence: String,
}

/// Creation, modification and expiry bookkeeping shared by groups and entries
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Times {
    pub creation_time: DateTime<Utc>,
    pub last_modification_time: DateTime<Utc>,
    pub last_access_time: DateTime<Utc>,
    pub expiry_time: DateTime<Utc>,
    pub location_changed: DateTime<Utc>,
    pub expires: bool,
    pub usage_count: i32,
}

impl Default for Times {
    fn default() -> Self {
        let epoch = DateTime::<Utc>::UNIX_EPOCH;
        Self {
            creation_time: epoch,
            last_modification_time: epoch,
            last_access_time: epoch,
            expiry_time: epoch,
            location_changed: epoch,
            expires: false,
            usage_count: 0,
        }
    }
}

/// Tombstone kept so synchronising clients can see removals
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeletedObject {
    pub uuid: Uuid,
    pub deletion_time: DateTime<Utc>,
}

/// An opaque `#RRGGBB` colour
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Color {
    /// Parse a `#RRGGBB` string; anything else is the invalid colour
    pub fn parse(text: &str) -> Option<Color> {
        let hex = text.strip_prefix('#')?;
        if hex.len() != 6 || !hex.is_ascii() {
            return None;
        }
        let r = u8::from_str_radix(&hex[0..2], 16).ok()?;
        let g = u8::from_str_radix(&hex[2..4], 16).ok()?;
        let b = u8::from_str_radix(&hex[4..6], 16).ok()?;
        Some(Color { r, g, b })
    }
}

impl std::fmt::Display for Color {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{:02X}{:02X}{:02X}", self.r, self.g, self.b)
    }
}
