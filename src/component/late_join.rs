//! Late-join handshake.
//!
//! A joining component asks every other live component, over
//! request/response, for the state it owns. Each instance answers on its own
//! state topic (see [`crate::event::topics::component_state`]). Peers that do not answer
//! within the late-join budget are skipped; a component with no peers starts
//! from its defaults.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{ComponentContext, StateSnapshot};
use crate::event::RequestOptions;

/// One peer's answer to a late-join query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateReply {
    pub name: String,
    pub state: StateSnapshot,
}

/// Collects the state of every live peer of `joiner`, in registration order.
pub(crate) async fn gather(context: &ComponentContext, joiner: &Uuid) -> Vec<StateReply> {
    let peers = context.registry().peers_of(joiner);
    if peers.is_empty() {
        debug!(%joiner, "No peers to join; starting from defaults");
        return Vec::new();
    }

    let options = RequestOptions::default()
        .with_timeout(context.late_join_timeout())
        .fail_fast();
    let queries = peers.iter().map(|peer| {
        let options = options.clone();
        async move {
            let reply = context
                .call::<Value, StateReply>(&peer.state_topic, &Value::Null, options)
                .await;
            (peer, reply)
        }
    });

    join_all(queries)
        .await
        .into_iter()
        .filter_map(|(peer, reply)| match reply {
            Ok(reply) => Some(reply),
            Err(err) => {
                warn!(peer = %peer.name, instance_id = %peer.instance_id, "Skipping peer during late join: {}", err);
                None
            }
        })
        .collect()
}

/// Answers a late-join query for `name` with `state`.
pub(crate) fn reply(name: &str, state: StateSnapshot) -> Result<Value, serde_json::Error> {
    serde_json::to_value(StateReply {
        name: name.to_string(),
        state,
    })
}
