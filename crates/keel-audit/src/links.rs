//! Economic link graph.
//!
//! Typed, immutable edges between artifacts. Each link type forms its own
//! acyclic graph with declared artifact-kind legality and degree caps.
//! Cycle checks for a given type are serialized by a per-type lock, so two
//! concurrent inserts cannot each pass a check the other invalidates.

use crate::chain::AuditChain;
use keel_storage::LinkStore;
use keel_types::hash::hash_canonical;
use keel_types::{
    ArtifactRef, Clock, EconomicLink, ErrorCode, KernelError, KernelResult, LinkType,
};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

const ALL_LINK_TYPES: [LinkType; 10] = [
    LinkType::FulfilledBy,
    LinkType::PaidBy,
    LinkType::ReversedBy,
    LinkType::CorrectedBy,
    LinkType::ConsumedBy,
    LinkType::SourcedFrom,
    LinkType::AllocatedTo,
    LinkType::DerivedFrom,
    LinkType::MatchedWith,
    LinkType::AdjustedBy,
];

/// Link graph service.
pub struct LinkGraph {
    store: Arc<dyn LinkStore>,
    audit: Arc<AuditChain>,
    clock: Arc<dyn Clock>,
    type_locks: BTreeMap<&'static str, Mutex<()>>,
}

impl LinkGraph {
    pub fn new(store: Arc<dyn LinkStore>, audit: Arc<AuditChain>, clock: Arc<dyn Clock>) -> Self {
        let type_locks = ALL_LINK_TYPES
            .iter()
            .map(|t| (t.as_str(), Mutex::new(())))
            .collect();
        Self {
            store,
            audit,
            clock,
            type_locks,
        }
    }

    /// Create a link after legality, degree, and cycle checks, and append
    /// the corresponding audit event.
    pub async fn create_link(
        &self,
        link_type: LinkType,
        parent: ArtifactRef,
        child: ArtifactRef,
        creating_event_id: &str,
        actor_id: &str,
    ) -> KernelResult<EconomicLink> {
        let _guard = self
            .type_locks
            .get(link_type.as_str())
            .expect("every link type has a lock")
            .lock()
            .await;

        let link = self
            .validate(link_type, parent, child, creating_event_id)
            .await?;

        self.store
            .insert_link(link.clone())
            .await
            .map_err(KernelError::from)?;

        let payload_hash = hash_canonical(&json!({
            "link_type": link.link_type,
            "parent": link.parent,
            "child": link.child,
            "creating_event_id": link.creating_event_id,
        }));
        self.audit
            .append(
                "economic_link",
                &link.link_id.to_string(),
                "link_created",
                actor_id,
                &payload_hash,
            )
            .await?;

        Ok(link)
    }

    /// Validate a prospective link without inserting it. Used by the
    /// journal writer, which carries validated links into its atomic
    /// posting commit. Callers must hold no expectation of exclusivity;
    /// the storage layer re-checks bounded degrees at insert.
    pub async fn validate(
        &self,
        link_type: LinkType,
        parent: ArtifactRef,
        child: ArtifactRef,
        creating_event_id: &str,
    ) -> KernelResult<EconomicLink> {
        let spec = link_type.spec();

        if !spec.parent_kinds.contains(&parent.kind) {
            return Err(KernelError::new(
                ErrorCode::LinkLegalityViolation,
                format!("{link_type} cannot originate from {parent}"),
            ));
        }
        if !spec.child_kinds.contains(&child.kind) {
            return Err(KernelError::new(
                ErrorCode::LinkLegalityViolation,
                format!("{link_type} cannot target {child}"),
            ));
        }
        if parent == child {
            return Err(KernelError::new(
                ErrorCode::LinkCycle,
                format!("{link_type} cannot link {parent} to itself"),
            ));
        }

        let existing = self
            .store
            .links_of_type(link_type)
            .await
            .map_err(KernelError::from)?;

        if let Some(max_out) = spec.max_out_degree {
            let out_degree = existing.iter().filter(|l| l.parent == parent).count() as u32;
            if out_degree >= max_out {
                return Err(KernelError::new(
                    ErrorCode::MaxDegreeExceeded,
                    format!("{parent} already carries {out_degree} {link_type} edge(s)"),
                ));
            }
        }
        if let Some(max_in) = spec.max_in_degree {
            let in_degree = existing.iter().filter(|l| l.child == child).count() as u32;
            if in_degree >= max_in {
                return Err(KernelError::new(
                    ErrorCode::MaxDegreeExceeded,
                    format!("{child} already receives {in_degree} {link_type} edge(s)"),
                ));
            }
        }

        // Walk forward from the proposed child; reaching the proposed
        // parent means the new edge would close a cycle.
        if reachable(&existing, &child, &parent) {
            return Err(KernelError::new(
                ErrorCode::LinkCycle,
                format!("linking {parent} -> {child} would create a {link_type} cycle"),
            ));
        }

        Ok(EconomicLink {
            link_id: Uuid::new_v4(),
            link_type,
            parent,
            child,
            creating_event_id: creating_event_id.to_string(),
            created_at: self.clock.now(),
        })
    }

    /// All artifacts reachable by walking edges of `link_type` upward from
    /// `artifact` (child to parent).
    pub async fn ancestors(
        &self,
        artifact: &ArtifactRef,
        link_type: LinkType,
    ) -> KernelResult<Vec<ArtifactRef>> {
        let links = self
            .store
            .links_of_type(link_type)
            .await
            .map_err(KernelError::from)?;
        Ok(walk(&links, artifact, Direction::Up))
    }

    /// All artifacts reachable by walking edges of `link_type` downward
    /// from `artifact` (parent to child).
    pub async fn descendants(
        &self,
        artifact: &ArtifactRef,
        link_type: LinkType,
    ) -> KernelResult<Vec<ArtifactRef>> {
        let links = self
            .store
            .links_of_type(link_type)
            .await
            .map_err(KernelError::from)?;
        Ok(walk(&links, artifact, Direction::Down))
    }

    /// Every link touching the artifact or anything transitively connected
    /// to it, across all link types: the artifact's full lifecycle.
    pub async fn lifecycle_trace(&self, artifact: &ArtifactRef) -> KernelResult<Vec<EconomicLink>> {
        let mut seen_links: BTreeMap<Uuid, EconomicLink> = BTreeMap::new();
        let mut visited: BTreeSet<String> = BTreeSet::new();
        let mut frontier = VecDeque::from([artifact.clone()]);

        while let Some(current) = frontier.pop_front() {
            if !visited.insert(current.to_string()) {
                continue;
            }
            let touching = self
                .store
                .links_for_artifact(&current)
                .await
                .map_err(KernelError::from)?;
            for link in touching {
                let other = if link.parent == current {
                    link.child.clone()
                } else {
                    link.parent.clone()
                };
                seen_links.insert(link.link_id, link);
                frontier.push_back(other);
            }
        }

        let mut links: Vec<EconomicLink> = seen_links.into_values().collect();
        links.sort_by_key(|l| l.created_at);
        Ok(links)
    }

    /// Direct children of an artifact under one link type, for
    /// consumption-style walks (how much of a parent document its children
    /// have consumed is summed by the caller, which knows the amounts).
    pub async fn direct_children(
        &self,
        artifact: &ArtifactRef,
        link_type: LinkType,
    ) -> KernelResult<Vec<ArtifactRef>> {
        let links = self
            .store
            .links_of_type(link_type)
            .await
            .map_err(KernelError::from)?;
        Ok(links
            .into_iter()
            .filter(|l| &l.parent == artifact)
            .map(|l| l.child)
            .collect())
    }
}

enum Direction {
    Up,
    Down,
}

fn reachable(links: &[EconomicLink], from: &ArtifactRef, target: &ArtifactRef) -> bool {
    let mut visited: BTreeSet<String> = BTreeSet::new();
    let mut frontier = VecDeque::from([from.clone()]);
    while let Some(current) = frontier.pop_front() {
        if &current == target {
            return true;
        }
        if !visited.insert(current.to_string()) {
            continue;
        }
        for link in links.iter().filter(|l| l.parent == current) {
            frontier.push_back(link.child.clone());
        }
    }
    false
}

fn walk(links: &[EconomicLink], start: &ArtifactRef, direction: Direction) -> Vec<ArtifactRef> {
    let mut visited: BTreeSet<String> = BTreeSet::new();
    let mut result = Vec::new();
    let mut frontier = VecDeque::from([start.clone()]);
    visited.insert(start.to_string());

    while let Some(current) = frontier.pop_front() {
        for link in links {
            let next = match direction {
                Direction::Up if link.child == current => &link.parent,
                Direction::Down if link.parent == current => &link.child,
                _ => continue,
            };
            if visited.insert(next.to_string()) {
                result.push(next.clone());
                frontier.push_back(next.clone());
            }
        }
    }
    result
}
