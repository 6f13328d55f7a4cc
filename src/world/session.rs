use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Instant;

use crate::net::records::{Fault, Record, VersionRecord};
use crate::world::observer::ObserverEdge;

/// Clients announcing at least this protocol version are told about named
/// application objects; older clients only ever see anonymous members.
pub const NAMED_OBJECT_MIN_VERSION: i32 = 3;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BroadcastMode {
    Off,
    World,
    Universe,
}

/// One client connection and everything scoped to its lifetime: the handshake
/// state, the objects it owns, the observation edges it holds on other
/// sessions' objects and the queue of records waiting to be written back.
#[derive(Debug)]
pub struct Session {
    pub id: i32,
    pub remote: String,
    pub version: Option<VersionRecord>,
    pub logged_in: bool,
    pub user_name: String,
    pub user_id: i32,
    pub url: String,
    pub client_ident: String,
    /// Ids of objects this connection owns.
    pub objects: Vec<i32>,
    /// Observation edges keyed by observed object id.
    pub observed: HashMap<i32, ObserverEdge>,
    /// Object ids with pending attribute updates, oldest first. At most one
    /// entry per object; the flush loop pops one per tick.
    pub dirty_queue: VecDeque<i32>,
    /// Group ids this session observes, one entry per subscription.
    pub observed_groups: Vec<i32>,
    pub ignored_idents: HashSet<String>,
    pub squelched: bool,
    pub show_identities: bool,
    pub simple_avatars: bool,
    pub next_simple_avatar: u32,
    pub broadcast_mode: BroadcastMode,
    /// Comma separated privilege tokens granted by a moderator.
    pub privileges: String,
    pub outbox: VecDeque<Record>,
    pub last_received: Instant,
    /// Serial of the last saying delivered, used to drop duplicate fan-out.
    pub last_heard_serial: u64,
    /// Set when the session must be closed with an error record in tow.
    pub kill: Option<Fault>,
}

impl Session {
    pub fn new(id: i32, remote: String, now: Instant) -> Self {
        Self {
            id,
            remote,
            version: None,
            logged_in: false,
            user_name: String::new(),
            user_id: 0,
            url: String::new(),
            client_ident: String::new(),
            objects: Vec::new(),
            observed: HashMap::new(),
            dirty_queue: VecDeque::new(),
            observed_groups: Vec::new(),
            ignored_idents: HashSet::new(),
            squelched: false,
            show_identities: false,
            simple_avatars: false,
            next_simple_avatar: 1,
            broadcast_mode: BroadcastMode::Off,
            privileges: String::new(),
            outbox: VecDeque::new(),
            last_received: now,
            last_heard_serial: 0,
            kill: None,
        }
    }

    /// Protocol version the client announced, or zero before the handshake.
    pub fn negotiated_version(&self) -> i32 {
        self.version.as_ref().map(|v| v.version).unwrap_or(0)
    }

    pub fn wants_named_objects(&self) -> bool {
        self.negotiated_version() >= NAMED_OBJECT_MIN_VERSION
    }

    pub fn owns_object(&self, object_id: i32) -> bool {
        self.objects.contains(&object_id)
    }

    pub fn observes_group(&self, group_id: i32) -> bool {
        self.observed_groups.contains(&group_id)
    }

    pub fn has_privilege(&self, name: &str) -> bool {
        self.privileges.split(',').any(|token| token.trim() == name)
    }

    pub fn push_record(&mut self, record: Record) {
        self.outbox.push_back(record);
    }

    /// Short form for log lines: the user name once logged in, else the
    /// remote address.
    pub fn describe(&self) -> String {
        if self.user_name.is_empty() {
            format!("#{} ({})", self.id, self.remote)
        } else {
            format!("#{} ({})", self.id, self.user_name)
        }
    }
}
