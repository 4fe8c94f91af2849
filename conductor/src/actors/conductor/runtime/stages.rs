use shared_types::{
    Blob, Checkpoint, ConceptLookupRequest, ConceptLookupResponse, LocalQueryRequest,
    ResolvedConcept, SelectTargetsRequest, SelectTargetsResponse,
};

use crate::actors::conductor::protocol::ConductorError;
use crate::actors::conductor::service::Conductor;
use crate::actors::conductor::state::{QueryContext, StageTimer};
use crate::profile::AddressLists;
use crate::remote::{call_json, Role};
use crate::store::{Selector, StoreError};

impl Conductor {
    /// Stage `ci`: resolve every concept to its canonical hash.
    pub(crate) async fn decrypt_concepts(&self, ctx: &mut QueryContext) -> Result<(), ConductorError> {
        let timer = StageTimer::start("decrypt_concepts");
        let outcome = self.resolve_concepts(ctx).await;
        self.observe(ctx, timer, outcome).await
    }

    async fn resolve_concepts(&self, ctx: &mut QueryContext) -> Result<(), ConductorError> {
        let concepts: Vec<String> = ctx.query.doc.encrypted_concepts.to_json()?;
        let reply: ConceptLookupResponse = call_json(
            self.remote.as_ref(),
            Role::Concept,
            "lookup",
            &ConceptLookupRequest {
                concepts: concepts.clone(),
            },
        )
        .await?;

        if reply.hashes.len() != concepts.len() {
            return Err(ConductorError::Upstream(format!(
                "concept service returned {} hashes for {} concepts",
                reply.hashes.len(),
                concepts.len()
            )));
        }
        let resolved: Vec<ResolvedConcept> = concepts
            .into_iter()
            .zip(reply.hashes)
            .map(|(name, hash)| ResolvedConcept { name, hash })
            .collect();

        ctx.query.doc.encrypted_concepts = Blob::from_json(&resolved)?;
        ctx.query.doc.checkpoints.mark(Checkpoint::ConceptsResolved);
        self.persist(ctx).await
    }

    /// Stage `fetch`: one subscriber address list per resolved concept.
    pub(crate) async fn fetch_address_lists(
        &self,
        ctx: &mut QueryContext,
    ) -> Result<(), ConductorError> {
        let timer = StageTimer::start("fetch_address_lists");
        let outcome = self.load_address_lists(ctx).await;
        self.observe(ctx, timer, outcome).await
    }

    async fn load_address_lists(&self, ctx: &mut QueryContext) -> Result<(), ConductorError> {
        let resolved: Vec<ResolvedConcept> = ctx.query.doc.encrypted_concepts.to_json()?;

        let mut lists = AddressLists::new();
        for concept in &resolved {
            let matches = self
                .subscribers
                .find(&Selector::new().eq("concept", &concept.hash)?)
                .await?;
            let subscriber = match matches.as_slice() {
                [] => {
                    return Err(ConductorError::NotFound(format!(
                        "subscriber for concept {}",
                        concept.name
                    )))
                }
                [one] => &one.doc,
                _ => {
                    return Err(ConductorError::Ambiguous(format!(
                        "{} subscribers for concept {}",
                        matches.len(),
                        concept.name
                    )))
                }
            };
            lists.insert(concept.name.clone(), subscriber.addresses.clone());
        }

        ctx.query.doc.encrypted_lists_of_addresses = Blob::from_json(&lists)?;
        ctx.query.doc.checkpoints.mark(Checkpoint::AddressListsFetched);
        self.persist(ctx).await
    }

    /// Stage `tf`: have the target service evaluate the profile.
    pub(crate) async fn select_targets(&self, ctx: &mut QueryContext) -> Result<(), ConductorError> {
        let timer = StageTimer::start("select_targets");
        let outcome = self.request_targets(ctx).await;
        self.observe(ctx, timer, outcome).await
    }

    async fn request_targets(&self, ctx: &mut QueryContext) -> Result<(), ConductorError> {
        let request = SelectTargetsRequest {
            query_id: ctx.id().clone(),
            lists: ctx.query.doc.encrypted_lists_of_addresses.clone(),
            profile: ctx.query.doc.encrypted_target_profile.clone(),
        };
        let reply: SelectTargetsResponse =
            call_json(self.remote.as_ref(), Role::Target, "select", &request).await?;

        ctx.query.doc.encrypted_targets = reply.targets;
        ctx.query.doc.checkpoints.mark(Checkpoint::TargetsSelected);
        self.persist(ctx).await
    }

    /// Stage `t`: fire the local query at the data service. The record is not
    /// touched afterwards; `t` is set by the completion callback.
    pub(crate) async fn dispatch_local_query(
        &self,
        ctx: &mut QueryContext,
    ) -> Result<(), ConductorError> {
        let timer = StageTimer::start("dispatch_local_query");
        let outcome = self.send_local_query(ctx).await;
        self.observe(ctx, timer, outcome).await
    }

    async fn send_local_query(&self, ctx: &mut QueryContext) -> Result<(), ConductorError> {
        let record = match self.tasks.create_query_target(ctx.id()).await {
            Ok(record) => record,
            Err(StoreError::AlreadyExists(_)) => {
                tracing::info!(query_id = %ctx.id(), "Local query already dispatched");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let request = LocalQueryRequest {
            query_id: ctx.id().clone(),
            targets: ctx.query.doc.encrypted_targets.clone(),
            local_query: ctx.query.doc.encrypted_local_query.clone(),
        };
        let sent: Result<serde_json::Value, _> =
            call_json(self.remote.as_ref(), Role::Data, "query", &request).await;

        if let Err(e) = sent {
            if let Err(discard) = self.tasks.discard(record).await {
                tracing::warn!(
                    query_id = %ctx.id(),
                    error = %discard,
                    "Failed to discard query-target record"
                );
            }
            return Err(e.into());
        }
        Ok(())
    }
}
