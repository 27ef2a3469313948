use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use super::selection::{FlushReport, SelectionQuery};
use crate::component::{snapshot_field, Component, ComponentContext, Registrar, StateSnapshot};
use crate::coordinator::{self, DataSnapshot, Environment, EnvironmentRequest, SnapshotCache};
use crate::event::{topics, EventType, HandlerError, RequestOptions};

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ViewMode {
    #[default]
    Keys,
    Aliases,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModeState {
    pub environment: Environment,
    pub view: ViewMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewRequest {
    pub view: ViewMode,
}

/// Owns the view mode and drives context switches.
///
/// A switch runs in a fixed order: flush the outgoing environment's
/// selection and wait for the commit, then ask the coordinator to move the
/// active environment. Caches re-derive from the coordinator's
/// `EnvironmentChanged` broadcast.
pub struct ModeService {
    context: ComponentContext,
    cache: SnapshotCache,
    view: Mutex<ViewMode>,
    switching: tokio::sync::Mutex<()>,
}

impl ModeService {
    pub const NAME: &'static str = "mode_service";
    pub const STATE_KEY: &'static str = "view_mode";

    pub fn new(context: ComponentContext) -> Arc<Self> {
        Arc::new(Self {
            context,
            cache: SnapshotCache::new(),
            view: Mutex::new(ViewMode::default()),
            switching: tokio::sync::Mutex::new(()),
        })
    }

    pub fn environment(&self) -> Environment {
        self.cache.environment().unwrap_or_default()
    }

    pub fn view(&self) -> ViewMode {
        *self.view.lock()
    }

    pub fn state(&self) -> ModeState {
        ModeState {
            environment: self.environment(),
            view: self.view(),
        }
    }

    #[instrument(skip(self))]
    pub async fn switch_environment(&self, target: Environment) -> Result<ModeState, HandlerError> {
        let _switch = self.switching.lock().await;
        let current = self.environment();
        if current == target {
            return Ok(self.state());
        }

        let flush = self
            .context
            .call::<_, FlushReport>(
                topics::SELECTION_FLUSH,
                &SelectionQuery {
                    environment: Some(current),
                },
                RequestOptions::default().fail_fast(),
            )
            .await;
        match flush {
            Ok(report) => debug!(flushed = report.flushed, "Outgoing selection flushed"),
            Err(err) if err.is_unroutable() => debug!("No selection owner; nothing to flush"),
            Err(err) => {
                warn!(%current, %target, "Aborting environment switch: {}", err);
                return Err(err.into());
            }
        }

        let snapshot: DataSnapshot = self
            .context
            .call(
                topics::DATA_SET_ENVIRONMENT,
                &EnvironmentRequest {
                    environment: target,
                },
                RequestOptions::default(),
            )
            .await?;
        self.apply_snapshot(snapshot);
        info!(from = %current, to = %target, "Environment switched");
        Ok(self.state())
    }

    pub fn set_view(&self, view: ViewMode) -> ModeState {
        let changed = {
            let mut current = self.view.lock();
            std::mem::replace(&mut *current, view) != view
        };
        let state = self.state();
        if changed {
            if let Err(err) = self.context.broadcast(EventType::ViewModeChanged, &state) {
                warn!("Failed to broadcast view mode: {}", err);
            }
        }
        state
    }

    fn apply_snapshot(&self, snapshot: DataSnapshot) {
        let _ = self.cache.apply(snapshot);
    }
}

#[async_trait]
impl Component for ModeService {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn register(self: Arc<Self>, registrar: &mut Registrar) {
        let this = self.clone();
        registrar.respond(topics::MODE_SWITCH_ENVIRONMENT, move |payload| {
            let this = this.clone();
            async move {
                let request: EnvironmentRequest = serde_json::from_value(payload)?;
                let state = this.switch_environment(request.environment).await?;
                Ok::<_, HandlerError>(serde_json::to_value(state)?)
            }
        });

        let this = self.clone();
        registrar.respond_fn(topics::MODE_SET_VIEW, move |payload| {
            let request: ViewRequest = serde_json::from_value(payload)?;
            Ok(serde_json::to_value(this.set_view(request.view))?)
        });

        let this = self;
        coordinator::on_snapshot(registrar, move |snapshot| this.apply_snapshot(snapshot));
    }

    fn current_state(&self) -> StateSnapshot {
        let mut state = StateSnapshot::new();
        state.insert(Self::STATE_KEY.to_string(), json!(self.view()));
        state
    }

    fn handle_initial_state(&self, sender: &str, state: &StateSnapshot) {
        if let Some(snapshot) = coordinator::snapshot_from_state(state) {
            self.apply_snapshot(snapshot);
        }
        // another mode owner already running: adopt its view
        if let Some(view) = snapshot_field::<ViewMode>(state, Self::STATE_KEY) {
            debug!(sender, %view, "Adopting view mode");
            *self.view.lock() = view;
        }
    }
}
