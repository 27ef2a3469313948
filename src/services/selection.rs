use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, instrument, warn};

use crate::component::{Component, ComponentContext, Registrar, StateSnapshot};
use crate::coordinator::{
    self, DataSnapshot, Environment, MutationReceipt, SelectionCommit, SnapshotCache,
};
use crate::event::{topics, EventType, HandlerError, RequestOptions};

/// The key selected in one environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub environment: Environment,
    pub key: Option<String>,
    /// False while the selection lives only in this service.
    pub committed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectRequest {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<Environment>,
}

/// Payload of `selection.get` and `selection.flush`. Without an environment
/// the active one is used (`get`) or every pending one (`flush`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SelectionQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<Environment>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushReport {
    pub flushed: usize,
    pub revision: Option<u64>,
}

/// Owns the per-environment key selection.
///
/// A selection stays local until flushed to the coordinator. Leaving an
/// environment discards whatever was not flushed for it, so a context switch
/// must flush first.
pub struct SelectionService {
    context: ComponentContext,
    cache: SnapshotCache,
    pending: Mutex<BTreeMap<Environment, String>>,
}

impl SelectionService {
    pub const NAME: &'static str = "selection_service";
    pub const STATE_KEY: &'static str = "selection";

    pub fn new(context: ComponentContext) -> Arc<Self> {
        Arc::new(Self {
            context,
            cache: SnapshotCache::new(),
            pending: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn environment(&self) -> Environment {
        self.cache.environment().unwrap_or_default()
    }

    pub fn select(&self, key: &str, environment: Option<Environment>) -> Selection {
        let environment = environment.unwrap_or_else(|| self.environment());
        self.pending.lock().insert(environment, key.to_string());
        announce_selection(&self.context, environment, Some(key));
        self.selection(environment)
    }

    /// Pending selection first, then the committed one, then the first bound
    /// key.
    pub fn selection(&self, environment: Environment) -> Selection {
        if let Some(key) = self.pending.lock().get(&environment) {
            return Selection {
                environment,
                key: Some(key.clone()),
                committed: false,
            };
        }
        let snapshot = self.cache.get();
        match snapshot.as_ref().and_then(|s| s.committed_selection(environment)) {
            Some(key) => Selection {
                environment,
                key: Some(key),
                committed: true,
            },
            None => Selection {
                environment,
                key: snapshot.and_then(|s| s.default_selection(environment)),
                committed: false,
            },
        }
    }

    pub fn active_selection(&self) -> Selection {
        self.selection(self.environment())
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Commits pending selections through the coordinator.
    #[instrument(skip(self))]
    pub async fn flush(&self, environment: Option<Environment>) -> Result<FlushReport, HandlerError> {
        let targets: Vec<(Environment, String)> = {
            let pending = self.pending.lock();
            pending
                .iter()
                .filter(|(env, _)| environment.map_or(true, |target| target == **env))
                .map(|(env, key)| (*env, key.clone()))
                .collect()
        };

        let mut report = FlushReport {
            flushed: 0,
            revision: None,
        };
        for (environment, key) in targets {
            let receipt: MutationReceipt = self
                .context
                .call(
                    topics::DATA_COMMIT_SELECTION,
                    &SelectionCommit {
                        environment,
                        key: Some(key.clone()),
                    },
                    RequestOptions::default(),
                )
                .await?;
            {
                let mut pending = self.pending.lock();
                if pending.get(&environment) == Some(&key) {
                    pending.remove(&environment);
                }
            }
            debug!(%environment, %key, revision = receipt.revision, "Selection flushed");
            report.flushed += 1;
            report.revision = Some(receipt.revision);
        }
        Ok(report)
    }

    fn apply_snapshot(&self, snapshot: DataSnapshot) {
        let before = self.active_selection();
        let environment = snapshot.environment;
        let previous = match self.cache.apply(snapshot) {
            Ok(previous) => previous,
            Err(_) => return,
        };

        if let Some(previous) = previous.filter(|p| p.environment != environment) {
            if let Some(lost) = self.pending.lock().remove(&previous.environment) {
                warn!(
                    environment = %previous.environment,
                    key = %lost,
                    "Discarding unflushed selection of the environment left behind"
                );
            }
        }

        let after = self.active_selection();
        if before != after {
            announce_selection(&self.context, after.environment, after.key.as_deref());
        }
    }
}

fn announce_selection(context: &ComponentContext, environment: Environment, key: Option<&str>) {
    let payload = json!({ "environment": environment, "key": key });
    if let Err(err) = context.broadcast(EventType::SelectionChanged, &payload) {
        warn!("Failed to broadcast selection: {}", err);
    }
}

#[async_trait]
impl Component for SelectionService {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn register(self: Arc<Self>, registrar: &mut Registrar) {
        let this = self.clone();
        registrar.respond_fn(topics::SELECTION_SELECT, move |payload| {
            let request: SelectRequest = serde_json::from_value(payload)?;
            Ok(serde_json::to_value(this.select(&request.key, request.environment))?)
        });

        let this = self.clone();
        registrar.respond_fn(topics::SELECTION_GET, move |payload| {
            let query: SelectionQuery = serde_json::from_value(payload).unwrap_or_default();
            let environment = query.environment.unwrap_or_else(|| this.environment());
            Ok(serde_json::to_value(this.selection(environment))?)
        });

        let this = self.clone();
        registrar.respond(topics::SELECTION_FLUSH, move |payload| {
            let this = this.clone();
            async move {
                let query: SelectionQuery = serde_json::from_value(payload).unwrap_or_default();
                let report = this.flush(query.environment).await?;
                Ok::<_, HandlerError>(serde_json::to_value(report)?)
            }
        });

        let this = self;
        coordinator::on_snapshot(registrar, move |snapshot| this.apply_snapshot(snapshot));
    }

    fn current_state(&self) -> StateSnapshot {
        let selections: BTreeMap<Environment, Option<String>> = Environment::ALL
            .iter()
            .map(|environment| (*environment, self.selection(*environment).key))
            .collect();
        let mut state = StateSnapshot::new();
        state.insert(Self::STATE_KEY.to_string(), json!(selections));
        state
    }

    fn handle_initial_state(&self, _sender: &str, state: &StateSnapshot) {
        if let Some(snapshot) = coordinator::snapshot_from_state(state) {
            self.apply_snapshot(snapshot);
        }
    }
}
