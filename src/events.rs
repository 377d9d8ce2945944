/// Causal references for locally built room events
///
/// Fills in the `auth_events`, `prev_events` and `depth` of an event before
/// it is signed, using the room's current state as reported by a
/// [`RoomStateQuery`] implementation.

use crate::error::{ServerKeyError, ServerKeyResult};
use async_trait::async_trait;
use serde::ser::SerializeTuple;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::json;
use tracing::debug;

/// Most auth events an event may reference
pub const MAX_AUTH_EVENTS: usize = 10;

/// Most prev events an event may reference
pub const MAX_PREV_EVENTS: usize = 20;

pub const CREATE_EVENT_TYPE: &str = "m.room.create";
pub const POWER_LEVELS_EVENT_TYPE: &str = "m.room.power_levels";
pub const JOIN_RULES_EVENT_TYPE: &str = "m.room.join_rules";
pub const MEMBER_EVENT_TYPE: &str = "m.room.member";

/// Reference to an earlier event by ID and content hash
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventReference {
    pub event_id: String,
    pub event_sha256: String,
}

impl EventReference {
    pub fn new(event_id: impl Into<String>, event_sha256: impl Into<String>) -> Self {
        Self {
            event_id: event_id.into(),
            event_sha256: event_sha256.into(),
        }
    }
}

// Old room versions reference events as `[event_id, {"sha256": hash}]`
impl Serialize for EventReference {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tuple = serializer.serialize_tuple(2)?;
        tuple.serialize_element(&self.event_id)?;
        tuple.serialize_element(&json!({ "sha256": self.event_sha256 }))?;
        tuple.end()
    }
}

/// A piece of room state identified by event type and state key
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StateKeyTuple {
    pub event_type: String,
    pub state_key: String,
}

impl StateKeyTuple {
    pub fn new(event_type: impl Into<String>, state_key: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            state_key: state_key.into(),
        }
    }
}

/// A current state event of a room
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateEvent {
    pub event_type: String,
    pub state_key: String,
    pub event_id: String,
    pub event_sha256: String,
}

impl StateEvent {
    pub fn tuple(&self) -> StateKeyTuple {
        StateKeyTuple::new(self.event_type.clone(), self.state_key.clone())
    }

    pub fn reference(&self) -> EventReference {
        EventReference::new(self.event_id.clone(), self.event_sha256.clone())
    }
}

/// Query for a room's forward extremities and selected state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatestEventsAndStateRequest {
    pub room_id: String,
    pub state_to_fetch: Vec<StateKeyTuple>,
}

/// Answer to a [`LatestEventsAndStateRequest`]
#[derive(Debug, Clone, Default)]
pub struct LatestEventsAndState {
    pub room_exists: bool,
    pub room_version: String,
    /// Depth the next event in the room should have
    pub depth: i64,
    pub state_events: Vec<StateEvent>,
    /// Current forward extremities
    pub latest_events: Vec<EventReference>,
}

/// Source of room state, usually the room server
#[async_trait]
pub trait RoomStateQuery: Send + Sync {
    async fn query_latest_events_and_state(
        &self,
        request: &LatestEventsAndStateRequest,
    ) -> ServerKeyResult<LatestEventsAndState>;
}

/// How an event references earlier events, fixed by room version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventFormat {
    /// `(event_id, hashes)` tuples
    V1,
    /// Bare event IDs
    V2,
}

impl EventFormat {
    pub fn for_room_version(room_version: &str) -> ServerKeyResult<Self> {
        match room_version {
            "1" | "2" => Ok(EventFormat::V1),
            "3" | "4" | "5" | "6" | "7" | "8" | "9" | "10" | "11" => Ok(EventFormat::V2),
            other => Err(ServerKeyError::Validation(format!(
                "Unsupported room version {:?}",
                other
            ))),
        }
    }
}

/// Encoded references to earlier events
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum EventReferences {
    V1(Vec<EventReference>),
    V2(Vec<String>),
}

impl Default for EventReferences {
    fn default() -> Self {
        EventReferences::V2(Vec::new())
    }
}

impl EventReferences {
    fn encode(format: EventFormat, references: Vec<EventReference>) -> Self {
        match format {
            EventFormat::V1 => EventReferences::V1(references),
            EventFormat::V2 => {
                EventReferences::V2(references.into_iter().map(|r| r.event_id).collect())
            }
        }
    }

    pub fn len(&self) -> usize {
        match self {
            EventReferences::V1(refs) => refs.len(),
            EventReferences::V2(ids) => ids.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn event_ids(&self) -> Vec<&str> {
        match self {
            EventReferences::V1(refs) => refs.iter().map(|r| r.event_id.as_str()).collect(),
            EventReferences::V2(ids) => ids.iter().map(String::as_str).collect(),
        }
    }
}

/// An unsigned event under construction
#[derive(Debug, Clone, Serialize)]
pub struct EventBuilder {
    pub sender: String,
    pub room_id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_key: Option<String>,
    pub content: serde_json::Value,
    pub depth: i64,
    pub auth_events: EventReferences,
    pub prev_events: EventReferences,
}

impl EventBuilder {
    pub fn new(
        sender: impl Into<String>,
        room_id: impl Into<String>,
        event_type: impl Into<String>,
        state_key: Option<String>,
        content: serde_json::Value,
    ) -> Self {
        Self {
            sender: sender.into(),
            room_id: room_id.into(),
            event_type: event_type.into(),
            state_key,
            content,
            depth: 0,
            auth_events: EventReferences::default(),
            prev_events: EventReferences::default(),
        }
    }
}

/// State an event needs to reference for authorization, most important first
pub fn state_needed(builder: &EventBuilder) -> ServerKeyResult<Vec<StateKeyTuple>> {
    // The create event starts the room and has nothing to reference
    if builder.event_type == CREATE_EVENT_TYPE {
        return Ok(Vec::new());
    }

    let mut needed = vec![
        StateKeyTuple::new(CREATE_EVENT_TYPE, ""),
        StateKeyTuple::new(POWER_LEVELS_EVENT_TYPE, ""),
        StateKeyTuple::new(MEMBER_EVENT_TYPE, builder.sender.clone()),
    ];

    if builder.event_type == MEMBER_EVENT_TYPE {
        let target = builder.state_key.as_deref().ok_or_else(|| {
            ServerKeyError::Validation("Membership event without a state key".to_string())
        })?;

        let target_tuple = StateKeyTuple::new(MEMBER_EVENT_TYPE, target);
        if !needed.contains(&target_tuple) {
            needed.push(target_tuple);
        }

        let membership = builder
            .content
            .get("membership")
            .and_then(|m| m.as_str())
            .unwrap_or_default();
        if membership == "join" || membership == "invite" {
            needed.push(StateKeyTuple::new(JOIN_RULES_EVENT_TYPE, ""));
        }
    }

    Ok(needed)
}

/// Cap auth and prev references by keeping a stable prefix of each
pub fn truncate_auth_and_prev_events(
    mut auth: Vec<EventReference>,
    mut prev: Vec<EventReference>,
) -> (Vec<EventReference>, Vec<EventReference>) {
    auth.truncate(MAX_AUTH_EVENTS);
    prev.truncate(MAX_PREV_EVENTS);
    (auth, prev)
}

/// Fill in the auth events, prev events and depth of `builder`.
///
/// Returns [`ServerKeyError::RoomNotFound`] when the room has no state, so
/// a caller can tell that case apart from other failures. The full query
/// response is returned for callers that need more of the room's state.
pub async fn add_prev_events_to_event(
    builder: &mut EventBuilder,
    room_state: &dyn RoomStateQuery,
) -> ServerKeyResult<LatestEventsAndState> {
    let needed = state_needed(builder)?;
    if needed.is_empty() {
        return Err(ServerKeyError::Validation(
            "Expecting state tuples for event builder, got none".to_string(),
        ));
    }

    let request = LatestEventsAndStateRequest {
        room_id: builder.room_id.clone(),
        state_to_fetch: needed.clone(),
    };
    let response = room_state.query_latest_events_and_state(&request).await?;

    if !response.room_exists {
        return Err(ServerKeyError::RoomNotFound(builder.room_id.clone()));
    }

    let format = EventFormat::for_room_version(&response.room_version)?;

    let auth_refs: Vec<EventReference> = needed
        .iter()
        .filter_map(|tuple| {
            response
                .state_events
                .iter()
                .find(|event| event.tuple() == *tuple)
                .map(StateEvent::reference)
        })
        .collect();

    let (auth, prev) =
        truncate_auth_and_prev_events(auth_refs, response.latest_events.clone());

    debug!(
        "Event in {} references {} auth and {} prev events",
        builder.room_id,
        auth.len(),
        prev.len()
    );

    builder.depth = response.depth;
    builder.auth_events = EventReferences::encode(format, auth);
    builder.prev_events = EventReferences::encode(format, prev);

    Ok(response)
}
