use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kinds of artifacts the link graph may connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Event,
    JournalEntry,
    /// External business documents (orders, invoices, receipts) referenced
    /// by their producer-scoped identifiers.
    Document,
}

/// Reference to a linked artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub kind: ArtifactKind,
    pub id: String,
}

impl ArtifactRef {
    pub fn event(id: impl Into<String>) -> Self {
        Self {
            kind: ArtifactKind::Event,
            id: id.into(),
        }
    }

    pub fn journal_entry(id: Uuid) -> Self {
        Self {
            kind: ArtifactKind::JournalEntry,
            id: id.to_string(),
        }
    }

    pub fn document(id: impl Into<String>) -> Self {
        Self {
            kind: ArtifactKind::Document,
            id: id.into(),
        }
    }
}

impl std::fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.kind {
            ArtifactKind::Event => "event",
            ArtifactKind::JournalEntry => "journal_entry",
            ArtifactKind::Document => "document",
        };
        write!(f, "{kind}:{}", self.id)
    }
}

/// Typed edge classification. Each type carries its own legality spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LinkType {
    FulfilledBy,
    PaidBy,
    ReversedBy,
    CorrectedBy,
    ConsumedBy,
    SourcedFrom,
    AllocatedTo,
    DerivedFrom,
    MatchedWith,
    AdjustedBy,
}

/// Legality constraints for one link type: which artifact kinds may sit on
/// each end and how many edges of this type each end may carry.
#[derive(Debug, Clone)]
pub struct LinkTypeSpec {
    pub parent_kinds: &'static [ArtifactKind],
    pub child_kinds: &'static [ArtifactKind],
    /// Maximum edges of this type out of one parent; `None` is unbounded.
    pub max_out_degree: Option<u32>,
    /// Maximum edges of this type into one child; `None` is unbounded.
    pub max_in_degree: Option<u32>,
}

const DOCS_AND_ENTRIES: &[ArtifactKind] = &[ArtifactKind::Document, ArtifactKind::JournalEntry];
const ENTRIES_ONLY: &[ArtifactKind] = &[ArtifactKind::JournalEntry];
const ANY_ARTIFACT: &[ArtifactKind] = &[
    ArtifactKind::Event,
    ArtifactKind::JournalEntry,
    ArtifactKind::Document,
];

impl LinkType {
    pub fn spec(&self) -> LinkTypeSpec {
        match self {
            // A posted entry is reversed at most once, by exactly one entry.
            Self::ReversedBy => LinkTypeSpec {
                parent_kinds: ENTRIES_ONLY,
                child_kinds: ENTRIES_ONLY,
                max_out_degree: Some(1),
                max_in_degree: Some(1),
            },
            Self::CorrectedBy => LinkTypeSpec {
                parent_kinds: ENTRIES_ONLY,
                child_kinds: ENTRIES_ONLY,
                max_out_degree: None,
                max_in_degree: Some(1),
            },
            Self::FulfilledBy | Self::ConsumedBy | Self::MatchedWith => LinkTypeSpec {
                parent_kinds: DOCS_AND_ENTRIES,
                child_kinds: DOCS_AND_ENTRIES,
                max_out_degree: None,
                max_in_degree: None,
            },
            Self::PaidBy => LinkTypeSpec {
                parent_kinds: DOCS_AND_ENTRIES,
                child_kinds: DOCS_AND_ENTRIES,
                max_out_degree: None,
                max_in_degree: None,
            },
            Self::SourcedFrom | Self::DerivedFrom => LinkTypeSpec {
                parent_kinds: ANY_ARTIFACT,
                child_kinds: ANY_ARTIFACT,
                max_out_degree: None,
                max_in_degree: None,
            },
            Self::AllocatedTo => LinkTypeSpec {
                parent_kinds: DOCS_AND_ENTRIES,
                child_kinds: ANY_ARTIFACT,
                max_out_degree: None,
                max_in_degree: None,
            },
            Self::AdjustedBy => LinkTypeSpec {
                parent_kinds: ENTRIES_ONLY,
                child_kinds: ENTRIES_ONLY,
                max_out_degree: None,
                max_in_degree: None,
            },
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FulfilledBy => "FULFILLED_BY",
            Self::PaidBy => "PAID_BY",
            Self::ReversedBy => "REVERSED_BY",
            Self::CorrectedBy => "CORRECTED_BY",
            Self::ConsumedBy => "CONSUMED_BY",
            Self::SourcedFrom => "SOURCED_FROM",
            Self::AllocatedTo => "ALLOCATED_TO",
            Self::DerivedFrom => "DERIVED_FROM",
            Self::MatchedWith => "MATCHED_WITH",
            Self::AdjustedBy => "ADJUSTED_BY",
        }
    }
}

impl std::fmt::Display for LinkType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable typed edge between two artifacts. Append-only; the graph of any
/// single link type is acyclic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EconomicLink {
    pub link_id: Uuid,
    pub link_type: LinkType,
    pub parent: ArtifactRef,
    pub child: ArtifactRef,
    pub creating_event_id: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reversal_edges_are_one_to_one() {
        let spec = LinkType::ReversedBy.spec();
        assert_eq!(spec.max_out_degree, Some(1));
        assert_eq!(spec.max_in_degree, Some(1));
        assert_eq!(spec.parent_kinds, ENTRIES_ONLY);
    }

    #[test]
    fn artifact_refs_render_with_kind_prefix() {
        let entry = ArtifactRef::journal_entry(Uuid::nil());
        assert!(entry.to_string().starts_with("journal_entry:"));
        assert_eq!(ArtifactRef::document("po-77").to_string(), "document:po-77");
    }
}
