//! # Data Coordinator
//!
//! The single writer of the canonical data. Every other component holds a
//! read-only projection that it refreshes from the coordinator's broadcasts.
//!
//! ## Commit Rules
//!
//! - Mutations arrive over request/response (`data.*` topics) and are applied
//!   to a copy of the canonical data. A failed operation leaves nothing
//!   half-applied.
//! - Every commit bumps the global revision and is written to [`Storage`]
//!   before it becomes visible. A failed write rejects the request and keeps
//!   the previous state.
//! - After a commit the full [`DataSnapshot`] is broadcast as
//!   `ProfileUpdated`, `ProfileSwitched` or `EnvironmentChanged`. Caches
//!   update only from these broadcasts and ignore snapshots older than the
//!   one they hold.
//! - Rejections travel back as [`HandlerError`]s with a `mutation.*` or
//!   `storage` kind; nothing is raised inside the bus dispatch.
//! - Stored data is read the first time anything touches the coordinator,
//!   so a request answered between registration and `init` already works
//!   against the persisted entity.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};

use crate::component::{Component, ComponentContext, ComponentError, ComponentResult, Registrar, StateSnapshot};
use crate::config::CoordinatorConfig;
use crate::event::{topics, EventType, HandlerError, Payload};

pub mod entity;
pub mod mutation;
pub mod storage;

pub use entity::EntityPath;
pub use mutation::{
    MutationEnvelope, MutationError, MutationReceipt, MutationResult, Operation, RawOperation, UpdateRequest,
    Verb,
};
pub use storage::{MemoryStorage, Storage, StorageError, StorageResult};

/// Key under which the coordinator reports its snapshot during late join.
pub const STATE_KEY: &str = "data";

/// Context scope a selection or binding set belongs to.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Environment {
    #[default]
    Space,
    Ground,
    Alias,
}

impl Environment {
    pub const ALL: [Environment; 3] = [Environment::Space, Environment::Ground, Environment::Alias];

    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Space => "space",
            Environment::Ground => "ground",
            Environment::Alias => "alias",
        }
    }
}

/// A fresh profile document: empty bindings for every environment, nothing
/// selected.
pub fn seed_profile() -> Value {
    let bindings: serde_json::Map<String, Value> = Environment::ALL
        .iter()
        .map(|environment| (environment.as_str().to_string(), json!({})))
        .collect();
    json!({ "bindings": bindings, "selections": {} })
}

/// The canonical data, as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalData {
    pub revision: u64,
    pub current_profile: String,
    pub environment: Environment,
    pub profiles: BTreeMap<String, Value>,
}

impl CanonicalData {
    pub fn seed(config: &CoordinatorConfig) -> Self {
        Self {
            revision: 0,
            current_profile: config.default_profile.clone(),
            environment: config.default_environment,
            profiles: BTreeMap::from([(config.default_profile.clone(), seed_profile())]),
        }
    }

    pub fn snapshot(&self) -> DataSnapshot {
        DataSnapshot {
            revision: self.revision,
            current_profile: self.current_profile.clone(),
            environment: self.environment,
            profile: self
                .profiles
                .get(&self.current_profile)
                .cloned()
                .unwrap_or_else(seed_profile),
            profiles: self.profiles.keys().cloned().collect(),
        }
    }

    fn profile_mut(&mut self, profile_id: &str) -> MutationResult<&mut Value> {
        self.profiles
            .get_mut(profile_id)
            .ok_or_else(|| MutationError::UnknownProfile {
                profile: profile_id.to_string(),
            })
    }
}

/// What the coordinator broadcasts: the current profile plus enough context
/// for any cache to re-derive its projection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSnapshot {
    pub revision: u64,
    pub current_profile: String,
    pub environment: Environment,
    pub profile: Value,
    pub profiles: Vec<String>,
}

impl DataSnapshot {
    pub fn bindings(&self, environment: Environment) -> BTreeMap<String, Value> {
        self.profile
            .get("bindings")
            .and_then(|bindings| bindings.get(environment.as_str()))
            .and_then(Value::as_object)
            .map(|keys| keys.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default()
    }

    pub fn committed_selection(&self, environment: Environment) -> Option<String> {
        self.profile
            .get("selections")
            .and_then(|selections| selections.get(environment.as_str()))
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    /// The first bound key in lexicographic order.
    pub fn default_selection(&self, environment: Environment) -> Option<String> {
        self.bindings(environment).into_keys().next()
    }

    pub fn effective_selection(&self, environment: Environment) -> Option<String> {
        self.committed_selection(environment)
            .or_else(|| self.default_selection(environment))
    }
}

/// The broadcast kinds that carry a [`DataSnapshot`].
pub fn data_events() -> [EventType; 3] {
    [
        EventType::ProfileUpdated,
        EventType::ProfileSwitched,
        EventType::EnvironmentChanged,
    ]
}

/// Payload of `data.commit_selection`. `None` clears the selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionCommit {
    pub environment: Environment,
    pub key: Option<String>,
}

/// Payload of `data.set_environment`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentRequest {
    pub environment: Environment,
}

/// Payload of the `data.*_profile` topics. `copy_from` is only read by
/// `data.create_profile`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileRequest {
    pub profile_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub copy_from: Option<String>,
}

pub struct Coordinator {
    context: ComponentContext,
    storage: Arc<dyn Storage>,
    config: CoordinatorConfig,
    /// `None` until storage has been read.
    data: Mutex<Option<CanonicalData>>,
    /// Whether storage holds the current data.
    stored: AtomicBool,
}

impl Coordinator {
    pub const NAME: &'static str = "data_coordinator";

    pub fn new(context: ComponentContext, storage: Arc<dyn Storage>, config: CoordinatorConfig) -> Arc<Self> {
        Arc::new(Self {
            context,
            storage,
            config,
            data: Mutex::new(None),
            stored: AtomicBool::new(false),
        })
    }

    /// The current snapshot. Falls back to the seed while storage cannot be
    /// read; [`try_snapshot`](Self::try_snapshot) reports the failure instead.
    pub fn snapshot(&self) -> DataSnapshot {
        self.try_snapshot().unwrap_or_else(|err| {
            warn!("Serving seed snapshot: {}", err);
            CanonicalData::seed(&self.config).snapshot()
        })
    }

    pub fn try_snapshot(&self) -> StorageResult<DataSnapshot> {
        Ok(self.canonical()?.snapshot())
    }

    pub fn revision(&self) -> u64 {
        self.snapshot().revision
    }

    #[instrument(skip(self, envelope), fields(operations = envelope.operations.len()))]
    pub fn update_profile(&self, envelope: MutationEnvelope) -> Result<MutationReceipt, HandlerError> {
        let applied = envelope.operations.len();
        let snapshot = self.commit(|data| {
            if let Some(expected) = envelope.expected_revision {
                if expected != data.revision {
                    return Err(MutationError::RevisionConflict {
                        expected,
                        actual: data.revision,
                    });
                }
            }
            let profile_id = envelope
                .profile_id
                .clone()
                .unwrap_or_else(|| data.current_profile.clone());
            let profile = data.profile_mut(&profile_id)?;
            *profile = entity::apply_all(profile, &envelope.operations)?;
            Ok(Some(EventType::ProfileUpdated))
        })?;
        Ok(MutationReceipt {
            revision: snapshot.revision,
            applied,
        })
    }

    /// Clearing a selection that was never committed is a no-op and keeps
    /// the revision.
    pub fn commit_selection(&self, commit: SelectionCommit) -> Result<MutationReceipt, HandlerError> {
        let mut applied = 0;
        let snapshot = self.commit(|data| {
            let current = data.current_profile.clone();
            let profile = data.profile_mut(&current)?;
            let path = EntityPath::from_segments(["selections", commit.environment.as_str()])?;
            let operation = match (&commit.key, entity::get(profile, &path).is_some()) {
                (Some(key), true) => Operation::modify(path, json!(key)),
                (Some(key), false) => Operation::add(path, json!(key)),
                (None, true) => Operation::delete(path),
                (None, false) => return Ok(None),
            };
            *profile = entity::apply_all(profile, &[operation])?;
            applied = 1;
            Ok(Some(EventType::ProfileUpdated))
        })?;
        debug!(environment = %commit.environment, key = ?commit.key, applied, "Selection committed");
        Ok(MutationReceipt {
            revision: snapshot.revision,
            applied,
        })
    }

    pub fn set_environment(&self, environment: Environment) -> Result<DataSnapshot, HandlerError> {
        let snapshot = self.commit(|data| {
            if data.environment == environment {
                return Ok(None);
            }
            data.environment = environment;
            info!(%environment, "Environment changed");
            Ok(Some(EventType::EnvironmentChanged))
        })?;
        Ok(snapshot)
    }

    pub fn create_profile(&self, request: ProfileRequest) -> Result<DataSnapshot, HandlerError> {
        let snapshot = self.commit(|data| {
            let profile_id = request.profile_id.trim();
            if profile_id.is_empty() {
                return Err(MutationError::InvalidProfileId {
                    profile: request.profile_id.clone(),
                });
            }
            if data.profiles.contains_key(profile_id) {
                return Err(MutationError::ProfileExists {
                    profile: profile_id.to_string(),
                });
            }
            let document = match &request.copy_from {
                Some(source) => data.profile_mut(source)?.clone(),
                None => seed_profile(),
            };
            data.profiles.insert(profile_id.to_string(), document);
            Ok(Some(EventType::ProfileUpdated))
        })?;
        Ok(snapshot)
    }

    pub fn switch_profile(&self, profile_id: &str) -> Result<DataSnapshot, HandlerError> {
        let snapshot = self.commit(|data| {
            if data.current_profile == profile_id {
                return Ok(None);
            }
            data.profile_mut(profile_id)?;
            data.current_profile = profile_id.to_string();
            info!(profile = profile_id, "Profile switched");
            Ok(Some(EventType::ProfileSwitched))
        })?;
        Ok(snapshot)
    }

    /// Deleting the current profile switches to the first remaining one.
    pub fn delete_profile(&self, profile_id: &str) -> Result<DataSnapshot, HandlerError> {
        let snapshot = self.commit(|data| {
            data.profile_mut(profile_id)?;
            if data.profiles.len() == 1 {
                return Err(MutationError::LastProfile {
                    profile: profile_id.to_string(),
                });
            }
            data.profiles.remove(profile_id);
            if data.current_profile != profile_id {
                return Ok(Some(EventType::ProfileUpdated));
            }
            if let Some(next) = data.profiles.keys().next() {
                data.current_profile = next.clone();
            }
            Ok(Some(EventType::ProfileSwitched))
        })?;
        Ok(snapshot)
    }

    /// Applies `change` to a copy of the data, persists it, then makes it
    /// current and broadcasts the new snapshot as the event `change` names.
    /// A change that names no event leaves revision and storage alone.
    fn commit(
        &self,
        change: impl FnOnce(&mut CanonicalData) -> MutationResult<Option<EventType>>,
    ) -> Result<DataSnapshot, HandlerError> {
        let (event_type, snapshot) = {
            let mut data = self.canonical()?;
            let mut next = data.clone();
            let Some(event_type) = change(&mut next)? else {
                return Ok(data.snapshot());
            };
            next.revision = data.revision + 1;
            self.storage
                .set(&self.config.storage_key, serde_json::to_value(&next)?)?;
            self.stored.store(true, Ordering::SeqCst);
            *data = next;
            (event_type, data.snapshot())
        };
        debug!(revision = snapshot.revision, %event_type, "Committed");
        self.publish(event_type, &snapshot);
        Ok(snapshot)
    }

    /// The canonical data, read from storage on first use. Empty storage
    /// yields the seed.
    fn canonical(&self) -> StorageResult<MappedMutexGuard<'_, CanonicalData>> {
        let mut guard = self.data.lock();
        if guard.is_none() {
            *guard = Some(self.read_storage()?);
        }
        Ok(MutexGuard::map(guard, |data| {
            data.get_or_insert_with(|| CanonicalData::seed(&self.config))
        }))
    }

    fn read_storage(&self) -> StorageResult<CanonicalData> {
        let key = &self.config.storage_key;
        match self.storage.get(key)? {
            Some(value) => {
                let data = serde_json::from_value(value).map_err(|err| StorageError::Corrupt {
                    key: key.clone(),
                    message: err.to_string(),
                })?;
                self.stored.store(true, Ordering::SeqCst);
                Ok(data)
            }
            None => Ok(CanonicalData::seed(&self.config)),
        }
    }

    fn publish(&self, event_type: EventType, snapshot: &DataSnapshot) {
        if let Err(err) = self.context.broadcast(event_type, snapshot) {
            warn!("Failed to broadcast snapshot: {}", err);
        }
    }

    /// Reads storage if nothing has yet, and persists the seed when storage
    /// was empty. Returns whether the data came from storage.
    fn load(&self) -> ComponentResult<bool> {
        let data = self.canonical().map_err(|err| self.init_failed(err))?;
        if self.stored.load(Ordering::SeqCst) {
            return Ok(true);
        }
        let value = serde_json::to_value(&*data).map_err(|err| self.init_failed(err))?;
        self.storage
            .set(&self.config.storage_key, value)
            .map_err(|err| self.init_failed(err))?;
        self.stored.store(true, Ordering::SeqCst);
        Ok(false)
    }

    fn init_failed(&self, err: impl std::fmt::Display) -> ComponentError {
        ComponentError::InitFailed {
            name: Self::NAME.to_string(),
            message: err.to_string(),
        }
    }
}

fn respond_with<T: Serialize>(result: Result<T, HandlerError>) -> Result<Payload, HandlerError> {
    Ok(serde_json::to_value(result?)?)
}

#[async_trait]
impl Component for Coordinator {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn register(self: Arc<Self>, registrar: &mut Registrar) {
        let this = self.clone();
        registrar.respond_fn(topics::DATA_GET_STATE, move |_| respond_with(Ok(this.try_snapshot()?)));

        let this = self.clone();
        registrar.respond_fn(topics::DATA_UPDATE_PROFILE, move |payload| {
            let request: UpdateRequest = serde_json::from_value(payload)?;
            respond_with(this.update_profile(request.try_into()?))
        });

        let this = self.clone();
        registrar.respond_fn(topics::DATA_COMMIT_SELECTION, move |payload| {
            respond_with(this.commit_selection(serde_json::from_value(payload)?))
        });

        let this = self.clone();
        registrar.respond_fn(topics::DATA_SET_ENVIRONMENT, move |payload| {
            let request: EnvironmentRequest = serde_json::from_value(payload)?;
            respond_with(this.set_environment(request.environment))
        });

        let this = self.clone();
        registrar.respond_fn(topics::DATA_CREATE_PROFILE, move |payload| {
            respond_with(this.create_profile(serde_json::from_value(payload)?))
        });

        let this = self.clone();
        registrar.respond_fn(topics::DATA_SWITCH_PROFILE, move |payload| {
            let request: ProfileRequest = serde_json::from_value(payload)?;
            respond_with(this.switch_profile(&request.profile_id))
        });

        let this = self;
        registrar.respond_fn(topics::DATA_DELETE_PROFILE, move |payload| {
            let request: ProfileRequest = serde_json::from_value(payload)?;
            respond_with(this.delete_profile(&request.profile_id))
        });
    }

    async fn on_init(&self) -> ComponentResult<()> {
        let loaded = self.load()?;
        let snapshot = self.snapshot();
        info!(
            loaded,
            revision = snapshot.revision,
            profile = %snapshot.current_profile,
            "Canonical data ready"
        );
        self.publish(EventType::ProfileSwitched, &snapshot);
        Ok(())
    }

    fn current_state(&self) -> StateSnapshot {
        let mut state = StateSnapshot::new();
        match serde_json::to_value(self.snapshot()) {
            Ok(snapshot) => {
                state.insert(STATE_KEY.to_string(), snapshot);
            }
            Err(err) => warn!("Failed to serialize snapshot: {}", err),
        }
        state
    }
}

/// Revision-guarded holder for the latest [`DataSnapshot`], shared by the
/// caching services.
#[derive(Default)]
pub struct SnapshotCache {
    latest: Mutex<Option<DataSnapshot>>,
}

impl SnapshotCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `snapshot` unless an equal-or-newer revision is already held
    /// (equal revisions replace). Returns the previously held snapshot when
    /// stored.
    pub fn apply(&self, snapshot: DataSnapshot) -> Result<Option<DataSnapshot>, u64> {
        let mut latest = self.latest.lock();
        if let Some(current) = latest.as_ref() {
            if snapshot.revision < current.revision {
                debug!(
                    stale = snapshot.revision,
                    held = current.revision,
                    "Ignoring stale snapshot"
                );
                return Err(current.revision);
            }
        }
        Ok(latest.replace(snapshot))
    }

    pub fn get(&self) -> Option<DataSnapshot> {
        self.latest.lock().clone()
    }

    pub fn revision(&self) -> Option<u64> {
        self.latest.lock().as_ref().map(|snapshot| snapshot.revision)
    }

    pub fn environment(&self) -> Option<Environment> {
        self.latest.lock().as_ref().map(|snapshot| snapshot.environment)
    }
}

/// Subscribes `apply` to every snapshot broadcast and hands it the
/// coordinator's late-join state.
pub fn on_snapshot<F>(registrar: &mut Registrar, apply: F)
where
    F: Fn(DataSnapshot) + Send + Sync + 'static,
{
    let apply = Arc::new(apply);
    for event_type in data_events() {
        let apply = apply.clone();
        registrar.on(event_type, move |event| {
            apply(event.payload_as()?);
            Ok(())
        });
    }
}

/// Extracts the coordinator's snapshot from a late-join reply.
pub fn snapshot_from_state(state: &StateSnapshot) -> Option<DataSnapshot> {
    crate::component::snapshot_field(state, STATE_KEY)
}
