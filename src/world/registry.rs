use std::collections::HashMap;
use std::time::Instant;

use crate::net::records::{Fault, Record, VersionRecord};
use crate::settings::{ServerRole, ServerSettings};
use crate::telemetry::logging::log_session;
use crate::world::object::Object;
use crate::world::observer::DIRTY_NICKNAME;
use crate::world::session::Session;
use crate::world::world::World;

/// The whole server state: sessions, worlds and objects, plus the counters
/// that hand out ids. Connection threads share one registry behind a mutex
/// and keep their critical sections short.
pub struct Registry {
    pub settings: ServerSettings,
    pub role: ServerRole,
    pub(crate) sessions: HashMap<i32, Session>,
    pub(crate) worlds: HashMap<String, World>,
    pub(crate) objects: HashMap<i32, Object>,
    next_connection_id: i32,
    next_entity_id: i32,
    next_reservation_id: i32,
    saying_serial: u64,
}

impl Registry {
    pub fn new(settings: ServerSettings, role: ServerRole) -> Self {
        Self {
            settings,
            role,
            sessions: HashMap::new(),
            worlds: HashMap::new(),
            objects: HashMap::new(),
            next_connection_id: 1,
            next_entity_id: 1,
            next_reservation_id: -1,
            saying_serial: 0,
        }
    }

    /// Registers a new connection and hands out its session id. Connection
    /// ids are never reused within a server run.
    pub fn connect(&mut self, remote: String, now: Instant) -> Result<i32, String> {
        if self.next_connection_id == i32::MAX {
            return Err("connection ids exhausted".to_string());
        }
        let session_id = self.next_connection_id;
        self.next_connection_id += 1;
        log_session(&format!("Connection #{} opened from {}", session_id, remote));
        self.sessions
            .insert(session_id, Session::new(session_id, remote, now));
        Ok(session_id)
    }

    /// Unwinds everything a connection left behind: its objects, its group
    /// subscriptions and its attribute edges, in that order.
    pub fn disconnect(&mut self, session_id: i32) {
        let Some(session) = self.sessions.get(&session_id) else {
            return;
        };
        log_session(&format!("Connection {} closed", session.describe()));
        let owned = session.objects.clone();
        for object_id in owned {
            self.detach_object(object_id);
        }
        let groups = self
            .sessions
            .get(&session_id)
            .map(|session| session.observed_groups.clone())
            .unwrap_or_default();
        for group_id in groups {
            if let Some((world_name, index)) = self.find_group(group_id) {
                self.group_remove_observer(&world_name, index, session_id);
            }
        }
        let leftover: Vec<i32> = self
            .sessions
            .get(&session_id)
            .map(|session| session.observed.keys().copied().collect())
            .unwrap_or_default();
        for object_id in leftover {
            self.remove_observer(object_id, session_id, true);
        }
        self.sessions.remove(&session_id);
    }

    pub fn session(&self, session_id: i32) -> Option<&Session> {
        self.sessions.get(&session_id)
    }

    pub fn session_mut(&mut self, session_id: i32) -> Option<&mut Session> {
        self.sessions.get_mut(&session_id)
    }

    pub fn push_record(&mut self, session_id: i32, record: Record) {
        if let Some(session) = self.sessions.get_mut(&session_id) {
            session.push_record(record);
        }
    }

    /// Takes every record queued for the connection, oldest first.
    pub fn take_outbox(&mut self, session_id: i32) -> Vec<Record> {
        match self.sessions.get_mut(&session_id) {
            Some(session) => session.outbox.drain(..).collect(),
            None => Vec::new(),
        }
    }

    pub fn touch(&mut self, session_id: i32, now: Instant) {
        if let Some(session) = self.sessions.get_mut(&session_id) {
            session.last_received = now;
        }
    }

    /// Flags the connection for closure. The first fault sticks so later
    /// ones cannot mask the root cause.
    pub fn kill_session(&mut self, session_id: i32, fault: Fault) {
        if let Some(session) = self.sessions.get_mut(&session_id) {
            if session.kill.is_none() {
                session.kill = Some(fault);
            }
        }
    }

    pub fn is_privileged(&self, session_id: i32) -> bool {
        self.sessions
            .get(&session_id)
            .map(|session| {
                session.logged_in && self.settings.is_privileged_user_id(session.user_id)
            })
            .unwrap_or(false)
    }

    /// The privileged identities never idle out.
    pub fn is_timeout_exempt(&self, session_id: i32) -> bool {
        self.sessions
            .get(&session_id)
            .map(|session| self.settings.is_privileged_user_id(session.user_id))
            .unwrap_or(false)
    }

    /// Replaces the privilege set of every session presenting the given
    /// client identity. Returns how many sessions matched.
    pub fn grant_privileges(&mut self, client_ident: &str, privileges: &str) -> usize {
        let mut granted = 0;
        for session in self.sessions.values_mut() {
            if session.client_ident == client_ident {
                session.privileges = privileges.to_string();
                granted += 1;
            }
        }
        granted
    }

    /// Marks a connection's sayings as squelched; nickname edges go dirty so
    /// observers see the masked form. Returns false for unknown connections.
    pub fn set_squelched(&mut self, session_id: i32, squelched: bool) -> bool {
        let objects = match self.sessions.get_mut(&session_id) {
            Some(session) => {
                session.squelched = squelched;
                session.objects.clone()
            }
            None => return false,
        };
        for object_id in objects {
            self.mark_dirty(object_id, DIRTY_NICKNAME);
        }
        true
    }

    /// Allocates an id for an object or a group. Ids wrap around and skip
    /// anything still alive, so a long-running server never hands out a
    /// duplicate.
    pub fn generate_entity_id(&mut self) -> i32 {
        loop {
            let id = self.next_entity_id;
            self.next_entity_id = if self.next_entity_id == i32::MAX {
                1
            } else {
                self.next_entity_id + 1
            };
            if self.objects.contains_key(&id) {
                continue;
            }
            let group_taken = self
                .worlds
                .values()
                .any(|world| world.instance_index(id).is_some());
            if group_taken {
                continue;
            }
            return id;
        }
    }

    /// Reservation ids run down from -1 so they can never collide with an
    /// instance id.
    pub(crate) fn allocate_reservation_id(&mut self) -> i32 {
        let id = self.next_reservation_id;
        self.next_reservation_id = if self.next_reservation_id == i32::MIN {
            -1
        } else {
            self.next_reservation_id - 1
        };
        id
    }

    pub(crate) fn next_saying_serial(&mut self) -> u64 {
        self.saying_serial += 1;
        self.saying_serial
    }

    /// The version record this server answers a handshake with.
    pub fn server_version_record(&self) -> VersionRecord {
        VersionRecord {
            version: self.settings.protocol_version_int(),
            min_version: self.settings.protocol_version_int(),
            app_name: self.settings.product_name.clone(),
            app_version: self.settings.product_version_int(),
            app_target: format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH),
            os: std::env::consts::OS.to_string(),
        }
    }
}
