//! Target role: subscriber directory and target-profile evaluation
//!
//! Subscribers are stored in the `target` namespace, one document per
//! registration, and looked up by concept hash during the conductor's
//! `fetch` stage. `select` evaluates a profile over the address lists the
//! conductor sends and returns the selected addresses as an opaque blob.

use std::sync::Arc;

use shared_types::{Blob, SelectTargetsRequest, SelectTargetsResponse, Subscriber, TargetProfile};
use ulid::Ulid;

use crate::profile::{evaluate, AddressLists, ProfileError};
use crate::store::{Collection, DocumentStore, Namespace, Selector, StoreError, SUBSCRIBERS_TABLE};

#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum TargetError {
    #[error(transparent)]
    Profile(#[from] ProfileError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("invalid subscriber: {0}")]
    InvalidSubscriber(String),
}

#[derive(Clone)]
pub struct TargetService {
    subscribers: Collection<Subscriber>,
}

impl TargetService {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            subscribers: Collection::new(store, Namespace::Target, SUBSCRIBERS_TABLE),
        }
    }

    /// Register an address list under a concept hash. Returns the document id.
    pub async fn register(&self, subscriber: Subscriber) -> Result<String, TargetError> {
        if subscriber.concept.trim().is_empty() {
            return Err(TargetError::InvalidSubscriber(
                "concept must not be empty".to_string(),
            ));
        }
        let id = Ulid::new().to_string();
        tracing::info!(
            subscriber_id = %id,
            concept = %subscriber.concept,
            addresses = subscriber.addresses.len(),
            "Subscriber registered"
        );
        self.subscribers.create(&id, subscriber).await?;
        Ok(id)
    }

    pub async fn subscribers_for(&self, concept: &str) -> Result<Vec<Subscriber>, TargetError> {
        Ok(self
            .subscribers
            .find(&Selector::new().eq("concept", concept)?)
            .await?
            .into_iter()
            .map(|v| v.doc)
            .collect())
    }

    pub fn select(&self, request: &SelectTargetsRequest) -> Result<SelectTargetsResponse, TargetError> {
        let lists: AddressLists = request.lists.to_json().map_err(ProfileError::from)?;
        let profile: TargetProfile = request.profile.to_json().map_err(ProfileError::from)?;
        let targets = evaluate(&profile, &lists)?;
        tracing::info!(
            query_id = %request.query_id,
            targets = targets.len(),
            "Targets selected"
        );
        Ok(SelectTargetsResponse {
            targets: Blob::from_json(&targets).map_err(ProfileError::from)?,
        })
    }
}
