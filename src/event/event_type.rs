use serde::{Deserialize, Serialize};

/// Every event that can travel over the [`EventBus`](super::event_bus::EventBus).
///
/// Request/response traffic is keyed by topic so that a responder for one
/// topic never sees another topic's requests. Domain broadcasts are plain
/// variants; `Custom` is kept for UI bridges and ad hoc extensions.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, strum::Display,
)]
pub enum EventType {
    // Request/Response
    Request {
        topic: String,
    },
    Response {
        topic: String,
    },
    // Component lifecycle
    ComponentRegistered,
    ComponentActivated,
    ComponentDestroyed,
    // Coordinator broadcasts
    ProfileUpdated,
    ProfileSwitched,
    EnvironmentChanged,
    // Leaf service broadcasts
    SelectionChanged,
    ViewModeChanged,
    BindingsChanged,
    Custom(String),
}

impl EventType {
    pub fn request(topic: &str) -> Self {
        Self::Request {
            topic: topic.to_string(),
        }
    }

    pub fn response(topic: &str) -> Self {
        Self::Response {
            topic: topic.to_string(),
        }
    }

    pub fn custom(name: &str) -> Self {
        Self::Custom(name.to_string())
    }

    pub fn topic(&self) -> Option<&str> {
        match self {
            Self::Request { topic } | Self::Response { topic } => Some(topic),
            _ => None,
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self, Self::Request { .. })
    }

    pub fn is_response(&self) -> bool {
        matches!(self, Self::Response { .. })
    }

    /// High-frequency events that are only worth logging at trace level.
    pub fn is_chatty(&self) -> bool {
        matches!(self, Self::SelectionChanged | Self::Response { .. })
    }
}

/// Well-known request/response topics.
pub mod topics {
    use uuid::Uuid;

    pub const DATA_GET_STATE: &str = "data.get_state";
    pub const DATA_UPDATE_PROFILE: &str = "data.update_profile";
    pub const DATA_COMMIT_SELECTION: &str = "data.commit_selection";
    pub const DATA_SET_ENVIRONMENT: &str = "data.set_environment";
    pub const DATA_CREATE_PROFILE: &str = "data.create_profile";
    pub const DATA_SWITCH_PROFILE: &str = "data.switch_profile";
    pub const DATA_DELETE_PROFILE: &str = "data.delete_profile";

    pub const SELECTION_SELECT: &str = "selection.select";
    pub const SELECTION_GET: &str = "selection.get";
    pub const SELECTION_FLUSH: &str = "selection.flush";

    pub const MODE_SWITCH_ENVIRONMENT: &str = "mode.switch_environment";
    pub const MODE_SET_VIEW: &str = "mode.set_view";

    const COMPONENT_STATE_PREFIX: &str = "component.state/";

    /// Topic a component instance answers late-join state queries on.
    pub fn component_state(instance_id: &Uuid) -> String {
        format!("{}{}", COMPONENT_STATE_PREFIX, instance_id)
    }
}
