//! Knowledge contracts: documents, chunks, sources, entities, and the
//! relationships between them.
//!
//! A [`KnowledgeDocument`] is one ingested file or page. It is split into
//! ordered [`KnowledgeChunk`]s, which are the unit of embedding, dedup and
//! lifecycle. A chunk's `content_hash` is the SHA-256 of its content (see
//! [`crate::dedup::content_hash`]) and is unique across the store.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::BrainError;
use crate::models::string_enum;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum KnowledgeType {
    Note,
    #[default]
    Document,
    Decision,
    Conversation,
    Task,
    Signal,
    Playbook,
    CaseStudy,
    Transcript,
}

string_enum!(KnowledgeType {
    Note => "note",
    Document => "document",
    Decision => "decision",
    Conversation => "conversation",
    Task => "task",
    Signal => "signal",
    Playbook => "playbook",
    CaseStudy => "case_study",
    Transcript => "transcript",
});

/// Lifecycle state of a chunk. Only `Active` chunks are retrievable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStatus {
    #[default]
    Active,
    Superseded,
    Archived,
    Deleted,
}

string_enum!(ChunkStatus {
    Active => "active",
    Superseded => "superseded",
    Archived => "archived",
    Deleted => "deleted",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SourceOrigin {
    Notion,
    Obsidian,
    Email,
    #[default]
    Manual,
    Youtube,
    Web,
    Other,
    Zoom,
    Json,
    Text,
    Leadworks,
}

string_enum!(SourceOrigin {
    Notion => "notion",
    Obsidian => "obsidian",
    Email => "email",
    Manual => "manual",
    Youtube => "youtube",
    Web => "web",
    Other => "other",
    Zoom => "zoom",
    Json => "json",
    Text => "text",
    Leadworks => "leadworks",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipType {
    TopicLink,
    Provenance,
    Temporal,
    EntityMention,
    Supports,
    Contradicts,
}

string_enum!(RelationshipType {
    TopicLink => "topic_link",
    Provenance => "provenance",
    Temporal => "temporal",
    EntityMention => "entity_mention",
    Supports => "supports",
    Contradicts => "contradicts",
});

/// Node labels and edge types used when chunks are mirrored into the graph.
pub mod graph_labels {
    pub const DOCUMENT_NODE: &str = "Document";
    pub const CHUNK_NODE: &str = "Chunk";
    pub const ENTITY_NODE: &str = "Entity";
    pub const HAS_CHUNK: &str = "HAS_CHUNK";
    pub const MENTIONS: &str = "MENTIONS";
    pub const RELATES_TO: &str = "RELATES_TO";
}

/// Where a document came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeSource {
    pub id: Uuid,
    pub name: String,
    pub origin: SourceOrigin,
    pub config: Map<String, Value>,
    pub created_at: DateTime<Utc>,
}

impl KnowledgeSource {
    pub fn new(name: impl Into<String>, origin: SourceOrigin) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            origin,
            config: Map::new(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeDocument {
    pub id: Uuid,
    pub title: String,
    pub knowledge_type: KnowledgeType,
    pub source_origin: SourceOrigin,
    pub source_id: Option<Uuid>,
    pub source_url: Option<String>,
    pub author: Option<String>,
    pub raw_content: Option<String>,
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl KnowledgeDocument {
    pub fn new(title: impl Into<String>, knowledge_type: KnowledgeType) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            knowledge_type,
            source_origin: SourceOrigin::default(),
            source_id: None,
            source_url: None,
            author: None,
            raw_content: None,
            metadata: Map::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_origin(mut self, origin: SourceOrigin) -> Self {
        self.source_origin = origin;
        self
    }

    pub fn with_source_url(mut self, url: impl Into<String>) -> Self {
        self.source_url = Some(url.into());
        self
    }

    pub fn with_raw_content(mut self, content: impl Into<String>) -> Self {
        self.raw_content = Some(content.into());
        self
    }
}

/// One retrievable piece of a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeChunk {
    pub id: Uuid,
    pub document_id: Option<Uuid>,
    pub content: String,
    pub content_hash: Option<String>,
    pub knowledge_type: KnowledgeType,
    pub chunk_index: usize,
    pub source_origin: SourceOrigin,
    pub status: ChunkStatus,
    pub version: i64,
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl KnowledgeChunk {
    pub fn new(content: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            document_id: None,
            content: content.into(),
            content_hash: None,
            knowledge_type: KnowledgeType::default(),
            chunk_index: 0,
            source_origin: SourceOrigin::default(),
            status: ChunkStatus::Active,
            version: 1,
            metadata: Map::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Attach the chunk to `document` at position `index`, inheriting its
    /// type and origin.
    pub fn for_document(mut self, document: &KnowledgeDocument, index: usize) -> Self {
        self.document_id = Some(document.id);
        self.chunk_index = index;
        self.knowledge_type = document.knowledge_type;
        self.source_origin = document.source_origin;
        self
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// A named entity extracted from chunks (person, project, tool).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeEntity {
    pub id: Uuid,
    pub name: String,
    pub entity_type: String,
    pub description: Option<String>,
    pub metadata: Map<String, Value>,
}

impl KnowledgeEntity {
    pub fn new(name: impl Into<String>, entity_type: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            entity_type: entity_type.into(),
            description: None,
            metadata: Map::new(),
        }
    }
}

/// Directed, weighted edge between two knowledge items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeRelationship {
    pub id: Uuid,
    pub source_id: Uuid,
    pub target_id: Uuid,
    pub relationship_type: RelationshipType,
    weight: f64,
    pub metadata: Map<String, Value>,
}

impl KnowledgeRelationship {
    /// Fails with `INVALID_REQUEST` unless `weight` is within `[0.0, 1.0]`.
    pub fn new(
        source_id: Uuid,
        target_id: Uuid,
        relationship_type: RelationshipType,
        weight: f64,
    ) -> Result<Self, BrainError> {
        if !(0.0..=1.0).contains(&weight) {
            return Err(
                BrainError::invalid_request(format!("relationship weight {weight} outside [0, 1]"))
                    .with_context("field", "weight"),
            );
        }
        Ok(Self {
            id: Uuid::new_v4(),
            source_id,
            target_id,
            relationship_type,
            weight,
            metadata: Map::new(),
        })
    }

    pub fn weight(&self) -> f64 {
        self.weight
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enum_text_forms() {
        assert_eq!(KnowledgeType::CaseStudy.as_str(), "case_study");
        assert_eq!("superseded".parse::<ChunkStatus>().unwrap(), ChunkStatus::Superseded);
        assert_eq!(
            serde_json::to_value(RelationshipType::EntityMention).unwrap(),
            "entity_mention"
        );
        let err = "purged".parse::<ChunkStatus>().unwrap_err();
        assert_eq!(err.code(), "INVALID_REQUEST");
    }

    #[test]
    fn test_chunk_inherits_document_fields() {
        let doc = KnowledgeDocument::new("Tokio notes", KnowledgeType::Note)
            .with_origin(SourceOrigin::Obsidian);
        let chunk = KnowledgeChunk::new("## Runtime").for_document(&doc, 2);
        assert_eq!(chunk.document_id, Some(doc.id));
        assert_eq!(chunk.chunk_index, 2);
        assert_eq!(chunk.knowledge_type, KnowledgeType::Note);
        assert_eq!(chunk.source_origin, SourceOrigin::Obsidian);
        assert_eq!(chunk.status, ChunkStatus::Active);
        assert_eq!(chunk.version, 1);
    }

    #[test]
    fn test_relationship_weight_bounds() {
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        assert!(KnowledgeRelationship::new(a, b, RelationshipType::Supports, 1.0).is_ok());
        assert!(KnowledgeRelationship::new(a, b, RelationshipType::Supports, 1.5).is_err());
        assert!(KnowledgeRelationship::new(a, b, RelationshipType::Supports, f64::NAN).is_err());
    }
}
