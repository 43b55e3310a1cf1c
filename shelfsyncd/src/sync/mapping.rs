use serde_json::{Value, json};
use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{Date, OffsetDateTime};

use shelfsync_core::{Correspondent, Document, SOURCE_ID_PROPERTY, Tag};

use super::tracker::EntityType;

#[derive(Debug, Error)]
pub enum MapError {
    #[error("document {id} has an empty title")]
    EmptyTitle { id: i64 },
    #[error("{entity} {id} has an empty name")]
    EmptyName { entity: EntityType, id: i64 },
    #[error("document {id} field `{field}` holds an invalid timestamp: {value}")]
    InvalidTimestamp {
        id: i64,
        field: &'static str,
        value: String,
    },
}

/// Target-native page ids for a document's references, resolved from
/// tracked state before the document itself is written.
#[derive(Debug, Clone, Default)]
pub struct ResolvedRefs {
    pub correspondent: Option<String>,
    pub tags: Vec<String>,
}

/// Builds the target page properties for a document. Relation arrays are
/// always present so that an update clears references the source record
/// no longer carries.
pub fn document_properties(doc: &Document, refs: &ResolvedRefs) -> Result<Value, MapError> {
    if doc.title.trim().is_empty() {
        return Err(MapError::EmptyTitle { id: doc.id });
    }
    validate_timestamp(doc.id, "created", &doc.created)?;
    validate_timestamp(doc.id, "added", &doc.added)?;

    let correspondent: Vec<Value> = refs
        .correspondent
        .iter()
        .map(|id| json!({ "id": id }))
        .collect();
    let tags: Vec<Value> = refs.tags.iter().map(|id| json!({ "id": id })).collect();

    Ok(json!({
        "Title": { "title": [ { "text": { "content": doc.title } } ] },
        SOURCE_ID_PROPERTY: { "number": doc.id },
        "Created": { "date": { "start": doc.created } },
        "Added": { "date": { "start": doc.added } },
        "Correspondent": { "relation": correspondent },
        "Tags": { "relation": tags },
    }))
}

pub fn tag_properties(tag: &Tag) -> Result<Value, MapError> {
    if tag.name.trim().is_empty() {
        return Err(MapError::EmptyName {
            entity: EntityType::Tag,
            id: tag.id,
        });
    }
    Ok(json!({
        "Name": { "title": [ { "text": { "content": tag.name } } ] },
        SOURCE_ID_PROPERTY: { "number": tag.id },
        "Color": { "rich_text": [ { "text": { "content": tag.color.as_deref().unwrap_or("") } } ] },
    }))
}

pub fn correspondent_properties(correspondent: &Correspondent) -> Result<Value, MapError> {
    if correspondent.name.trim().is_empty() {
        return Err(MapError::EmptyName {
            entity: EntityType::Correspondent,
            id: correspondent.id,
        });
    }
    Ok(json!({
        "Name": { "title": [ { "text": { "content": correspondent.name } } ] },
        SOURCE_ID_PROPERTY: { "number": correspondent.id },
    }))
}

/// Tags and correspondents carry no modification timestamp at the source,
/// so their change marker is a fingerprint of the mapped fields.
pub fn tag_marker(tag: &Tag) -> String {
    format!("{}|{}", tag.name, tag.color.as_deref().unwrap_or_default())
}

pub fn correspondent_marker(correspondent: &Correspondent) -> String {
    correspondent.name.clone()
}

/// A reference record shares the create/update flow: tags and
/// correspondents differ only in how they map to page properties.
pub trait ReferenceRecord {
    const ENTITY: EntityType;

    fn source_id(&self) -> i64;
    fn marker(&self) -> String;
    fn properties(&self) -> Result<Value, MapError>;
}

impl ReferenceRecord for Tag {
    const ENTITY: EntityType = EntityType::Tag;

    fn source_id(&self) -> i64 {
        self.id
    }

    fn marker(&self) -> String {
        tag_marker(self)
    }

    fn properties(&self) -> Result<Value, MapError> {
        tag_properties(self)
    }
}

impl ReferenceRecord for Correspondent {
    const ENTITY: EntityType = EntityType::Correspondent;

    fn source_id(&self) -> i64 {
        self.id
    }

    fn marker(&self) -> String {
        correspondent_marker(self)
    }

    fn properties(&self) -> Result<Value, MapError> {
        correspondent_properties(self)
    }
}

fn validate_timestamp(id: i64, field: &'static str, value: &str) -> Result<(), MapError> {
    if OffsetDateTime::parse(value, &Rfc3339).is_ok() {
        return Ok(());
    }
    // Older source versions report bare dates for `created`.
    let date_only = format_description!("[year]-[month]-[day]");
    if Date::parse(value, &date_only).is_ok() {
        return Ok(());
    }
    Err(MapError::InvalidTimestamp {
        id,
        field,
        value: value.to_string(),
    })
}
