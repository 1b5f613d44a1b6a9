//! Rooms, presence and topics.
//!
//! Rooms are ephemeral: nothing here is persisted. Local joins are
//! refcounted, so several components joining the same room share one
//! membership and one `join-room` frame.

use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use tessel_sync_types::{JoinRoom, PeerId, RoomKey, RoomRef, SetPresence};

/// Result of [`RoomHub::join`].
#[derive(Debug, Clone, PartialEq)]
pub enum JoinOutcome {
    /// First local join: send this frame.
    FirstJoin(JoinRoom),
    /// Already joined; the membership is shared.
    Shared,
}

/// Filters for a presence view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceOpts {
    /// Project only these keys of each peer's data.
    pub keys: Option<Vec<String>>,
    /// Only these peers.
    pub peers: Option<Vec<PeerId>>,
    /// Include this client's own slice.
    pub user: bool,
}

impl Default for PresenceOpts {
    fn default() -> Self {
        Self {
            keys: None,
            peers: None,
            user: true,
        }
    }
}

/// Presence of a room as seen by one listener.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PresenceView {
    /// This client's own presence (when requested).
    pub user: Option<Value>,
    /// Other peers.
    pub peers: BTreeMap<PeerId, Value>,
    /// True until the server confirmed the join.
    pub is_loading: bool,
    /// Last room error.
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
struct Room {
    refs: usize,
    joined: bool,
    data: Map<String, Value>,
    peers: BTreeMap<PeerId, Value>,
    error: Option<String>,
}

/// All rooms this client has joined.
#[derive(Debug, Clone)]
pub struct RoomHub {
    self_peer: PeerId,
    rooms: HashMap<RoomKey, Room>,
}

impl RoomHub {
    /// Create a hub for a client session.
    pub fn new(self_peer: PeerId) -> Self {
        Self {
            self_peer,
            rooms: HashMap::new(),
        }
    }

    /// This client's peer id.
    pub fn self_peer(&self) -> PeerId {
        self.self_peer
    }

    /// Join a room. `initial` is shallow-merged into this client's presence.
    pub fn join(&mut self, key: &RoomKey, initial: Option<Value>) -> JoinOutcome {
        if let Some(room) = self.rooms.get_mut(key) {
            room.refs += 1;
            if let Some(initial) = initial {
                shallow_merge(&mut room.data, initial);
            }
            return JoinOutcome::Shared;
        }

        let mut data = Map::new();
        if let Some(initial) = initial {
            shallow_merge(&mut data, initial);
        }
        let frame = JoinRoom {
            room: key.clone(),
            peer_id: self.self_peer,
            data: Value::Object(data.clone()),
        };
        self.rooms.insert(
            key.clone(),
            Room {
                refs: 1,
                joined: false,
                data,
                peers: BTreeMap::new(),
                error: None,
            },
        );
        JoinOutcome::FirstJoin(frame)
    }

    /// Drop one local join. Returns the `leave-room` frame when the last
    /// join went away.
    pub fn leave(&mut self, key: &RoomKey) -> Option<RoomRef> {
        let room = self.rooms.get_mut(key)?;
        room.refs = room.refs.saturating_sub(1);
        if room.refs > 0 {
            return None;
        }
        self.rooms.remove(key);
        Some(RoomRef { room: key.clone() })
    }

    /// Whether the room is joined locally.
    pub fn is_joined(&self, key: &RoomKey) -> bool {
        self.rooms.contains_key(key)
    }

    /// Merge into this client's presence. Returns the frame to broadcast,
    /// or `None` when the room is not joined.
    pub fn publish_presence(&mut self, key: &RoomKey, partial: Value) -> Option<SetPresence> {
        let room = self.rooms.get_mut(key)?;
        shallow_merge(&mut room.data, partial);
        Some(SetPresence {
            room: key.clone(),
            data: Value::Object(room.data.clone()),
        })
    }

    /// Server confirmed the join.
    pub fn on_join_ok(&mut self, key: &RoomKey) -> bool {
        match self.rooms.get_mut(key) {
            Some(room) if !room.joined => {
                room.joined = true;
                room.error = None;
                true
            }
            _ => false,
        }
    }

    /// Server sent the authoritative peer map. Returns false when the room is
    /// not joined locally.
    pub fn on_refresh_presence(&mut self, key: &RoomKey, map: BTreeMap<PeerId, Value>) -> bool {
        let self_peer = self.self_peer;
        let Some(room) = self.rooms.get_mut(key) else {
            return false;
        };
        room.joined = true;
        room.peers = map.into_iter().filter(|(p, _)| *p != self_peer).collect();
        true
    }

    /// Record a room-level error.
    pub fn on_error(&mut self, key: &RoomKey, message: impl Into<String>) -> bool {
        match self.rooms.get_mut(key) {
            Some(room) => {
                room.error = Some(message.into());
                true
            }
            None => false,
        }
    }

    /// Filtered presence view.
    pub fn presence(&self, key: &RoomKey, opts: &PresenceOpts) -> Option<PresenceView> {
        let room = self.rooms.get(key)?;
        let project = |data: &Value| match (&opts.keys, data) {
            (Some(keys), Value::Object(map)) => Value::Object(
                map.iter()
                    .filter(|(k, _)| keys.contains(k))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            ),
            _ => data.clone(),
        };

        let peers = room
            .peers
            .iter()
            .filter(|(p, _)| opts.peers.as_ref().map(|ps| ps.contains(p)).unwrap_or(true))
            .map(|(p, data)| (*p, project(data)))
            .collect();
        let user = opts
            .user
            .then(|| project(&Value::Object(room.data.clone())));

        Some(PresenceView {
            user,
            peers,
            is_loading: !room.joined,
            error: room.error.clone(),
        })
    }

    /// Join frames for every active room, carrying last-known presence.
    pub fn active_rooms(&self) -> Vec<JoinRoom> {
        let mut frames: Vec<JoinRoom> = self
            .rooms
            .iter()
            .map(|(key, room)| JoinRoom {
                room: key.clone(),
                peer_id: self.self_peer,
                data: Value::Object(room.data.clone()),
            })
            .collect();
        frames.sort_by(|a, b| a.room.cmp(&b.room));
        frames
    }

    /// The connection dropped: memberships must be confirmed again and the
    /// peer map is stale.
    pub fn reset_connection(&mut self) -> Vec<RoomKey> {
        let mut keys = Vec::new();
        for (key, room) in self.rooms.iter_mut() {
            room.joined = false;
            room.peers.clear();
            keys.push(key.clone());
        }
        keys
    }

    /// Whether a broadcast from `sender` should reach local handlers.
    pub fn accepts_broadcast(&self, key: &RoomKey, sender: &PeerId) -> bool {
        *sender != self.self_peer && self.rooms.contains_key(key)
    }
}

fn shallow_merge(target: &mut Map<String, Value>, partial: Value) {
    if let Value::Object(partial) = partial {
        for (k, v) in partial {
            target.insert(k, v);
        }
    }
}
