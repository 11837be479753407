//! Convergence passes.
//!
//! # Data Flow
//! ```text
//! RoutingResource snapshot
//!     → Extractor::extract          → DirectiveBundle
//!     → DesiredStateBuilder::build  → Vec<ServerDescriptor>
//!     → view registry (one ResourceView per resource)
//!     → [apply lock] Renderer::render_all → ReloadSupervisor apply
//!     → Action (done | requeue after delay)
//! ```
//!
//! # Design Decisions
//! - Passes for different resources run concurrently up to the apply lock
//! - The view registry only changes while the apply lock is held, so the
//!   composed document always matches what was applied
//! - A failed apply restores the resource's previous view
//! - Removal bumps a per-resource epoch; a pass that started before the
//!   removal cannot put the view back

pub mod driver;

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tracing::Instrument;
use uuid::Uuid;

use crate::annotations::{AnnotationError, Extractor};
use crate::builder::{BuildError, DesiredStateBuilder, TlsStaging};
use crate::config::ControllerConfig;
use crate::observability::metrics;
use crate::proxy::{ApplyOutcome, ReloadError, ReloadSupervisor};
use crate::render::{RenderError, RenderedConfiguration, Renderer, ResourceView};
use crate::resource::{CertificateProvider, ResourceKey, RoutingResource, ServiceResolver};

/// What the caller should do with the resource after a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Done,
    RequeueAfter(Duration),
}

#[derive(Debug, Error)]
pub enum PassError {
    #[error(transparent)]
    Annotation(#[from] AnnotationError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error(transparent)]
    Reload(#[from] ReloadError),
}

impl PassError {
    /// Only a proxy that stays down after rollback is fatal.
    pub fn is_fatal(&self) -> bool {
        matches!(self, PassError::Reload(err) if err.is_fatal())
    }

    fn outcome(&self) -> &'static str {
        match self {
            PassError::Annotation(_) => "annotation_error",
            PassError::Build(_) => "build_error",
            PassError::Render(_) => "render_error",
            PassError::Reload(err) if err.is_fatal() => "fatal",
            PassError::Reload(_) => "reload_error",
        }
    }
}

pub struct Reconciler {
    extractor: Extractor,
    builder: DesiredStateBuilder,
    renderer: Renderer,
    supervisor: Arc<ReloadSupervisor>,
    resolver: Arc<dyn ServiceResolver>,
    certs: Arc<dyn CertificateProvider>,
    views: DashMap<ResourceKey, ResourceView>,
    epochs: DashMap<ResourceKey, u64>,
    not_ready_requeue: Duration,
    failure_requeue: Duration,
}

impl Reconciler {
    pub fn new(
        config: &ControllerConfig,
        renderer: Renderer,
        supervisor: Arc<ReloadSupervisor>,
        resolver: Arc<dyn ServiceResolver>,
        certs: Arc<dyn CertificateProvider>,
    ) -> Self {
        let extractor = Extractor::new(
            &config.annotations.prefix,
            &config.reconcile.service_domain,
            resolver.clone(),
        );
        Self {
            extractor,
            builder: DesiredStateBuilder::new(config),
            renderer,
            supervisor,
            resolver,
            certs,
            views: DashMap::new(),
            epochs: DashMap::new(),
            not_ready_requeue: Duration::from_secs(config.reconcile.not_ready_requeue_secs),
            failure_requeue: Duration::from_secs(config.reconcile.failure_requeue_secs),
        }
    }

    pub fn supervisor(&self) -> &Arc<ReloadSupervisor> {
        &self.supervisor
    }

    /// Views currently composed into the installed document, ordered by key.
    pub fn views(&self) -> Vec<ResourceView> {
        let mut views: Vec<ResourceView> = self.views.iter().map(|e| e.value().clone()).collect();
        views.sort_by(|a, b| a.key.cmp(&b.key));
        views
    }

    /// Run one convergence pass for a resource snapshot.
    pub async fn reconcile(&self, resource: &RoutingResource) -> Result<Action, PassError> {
        let span = tracing::info_span!("pass", pass_id = %Uuid::new_v4(), resource = %resource.key());
        async {
            let result = self.converge(resource).await;
            if let Err(err) = &result {
                if err.is_fatal() {
                    tracing::error!(error = %err, "Convergence pass failed fatally");
                } else {
                    tracing::warn!(error = %err, "Convergence pass failed");
                }
                metrics::record_pass(err.outcome());
            }
            result
        }
        .instrument(span)
        .await
    }

    /// Extract and build without touching the installed configuration or
    /// the TLS directory.
    pub async fn plan(&self, resource: &RoutingResource) -> Result<ResourceView, PassError> {
        self.plan_with(resource, TlsStaging::DryRun).await
    }

    async fn plan_with(
        &self,
        resource: &RoutingResource,
        staging: TlsStaging,
    ) -> Result<ResourceView, PassError> {
        let bundle = self.extractor.extract(resource).await?;
        let servers = self
            .builder
            .build_with(
                resource,
                &bundle,
                self.resolver.as_ref(),
                self.certs.as_ref(),
                staging,
            )
            .await?;
        Ok(ResourceView {
            key: resource.key(),
            servers,
            bundle,
        })
    }

    /// Plan every resource and compose one document. Nothing is applied.
    pub async fn preview(
        &self,
        resources: &[RoutingResource],
    ) -> Result<(Vec<ResourceView>, RenderedConfiguration), PassError> {
        let mut views = Vec::with_capacity(resources.len());
        for resource in resources.iter().filter(|r| !r.is_empty()) {
            views.push(self.plan(resource).await?);
        }
        let rendered = self.renderer.render_all(&views)?;
        views.sort_by(|a, b| a.key.cmp(&b.key));
        Ok((views, rendered))
    }

    /// Drop a deleted resource's view and re-apply the remainder.
    ///
    /// Passes for `key` that are still in flight are discarded when they
    /// reach the apply lock.
    pub async fn forget(&self, key: &ResourceKey) -> Result<ApplyOutcome, PassError> {
        let mut guard = self.supervisor.lock().await;
        *self.epochs.entry(key.clone()).or_insert(0) += 1;
        let Some((_, previous)) = self.views.remove(key) else {
            return Ok(ApplyOutcome::Unchanged);
        };

        let result: Result<ApplyOutcome, PassError> = async {
            let candidate = self.renderer.render_all(&self.views())?;
            Ok(guard.apply(&candidate).await?)
        }
        .await;

        if result.is_err() {
            self.views.insert(key.clone(), previous);
        } else {
            tracing::info!(resource = %key, "Resource removed from configuration");
        }
        result
    }

    /// Requeue delay for a failed pass.
    pub fn error_policy(&self, err: &PassError) -> Action {
        tracing::debug!(error = %err, delay = ?self.failure_requeue, "Scheduling retry");
        Action::RequeueAfter(self.failure_requeue)
    }

    async fn converge(&self, resource: &RoutingResource) -> Result<Action, PassError> {
        if resource.is_empty() {
            tracing::debug!("Resource has no rules and no default backend yet");
            metrics::record_pass("not_ready");
            return Ok(Action::RequeueAfter(self.not_ready_requeue));
        }

        let epoch = self.epoch(&resource.key());
        let view = self.plan_with(resource, TlsStaging::Install).await?;
        let outcome = self.install(view, epoch).await?;
        match outcome {
            ApplyOutcome::Unchanged => {
                tracing::debug!("Configuration unchanged");
                metrics::record_pass("unchanged");
            }
            ApplyOutcome::Committed(fingerprint) => {
                tracing::info!(fingerprint = %fingerprint.short(), "Resource converged");
                metrics::record_pass("committed");
            }
        }
        Ok(Action::Done)
    }

    fn epoch(&self, key: &ResourceKey) -> u64 {
        self.epochs.get(key).map(|epoch| *epoch).unwrap_or(0)
    }

    async fn install(&self, view: ResourceView, epoch: u64) -> Result<ApplyOutcome, PassError> {
        let mut guard = self.supervisor.lock().await;
        let key = view.key.clone();
        if self.epoch(&key) != epoch {
            tracing::info!(resource = %key, "Resource removed during the pass; view discarded");
            return Ok(ApplyOutcome::Unchanged);
        }
        let previous = self.views.insert(key.clone(), view);

        let result: Result<ApplyOutcome, PassError> = async {
            let candidate = self.renderer.render_all(&self.views())?;
            Ok(guard.apply(&candidate).await?)
        }
        .await;

        if result.is_err() {
            match previous {
                Some(previous) => {
                    self.views.insert(key, previous);
                }
                None => {
                    self.views.remove(&key);
                }
            }
        }
        result
    }
}
