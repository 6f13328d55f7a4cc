use crate::net::packet::truncate_to_bytes;
use crate::net::records::{
    ObjectAvatarRecord, ObjectNicknameRecord, ObjectPositionRecord, Record, MAX_NICKNAME,
};
use crate::telemetry::logging::log_world;
use crate::world::registry::Registry;

pub const DIRTY_POSITION: u8 = 1;
pub const DIRTY_AVATAR: u8 = 2;
pub const DIRTY_NICKNAME: u8 = 4;

/// One subscription of a session to an object's attribute changes. A session
/// can reach the same object through several groups at once, so the edge is
/// reference counted rather than duplicated.
#[derive(Clone, Copy, Debug)]
pub struct ObserverEdge {
    pub instances: u32,
    /// Pending attribute bits, cleared when the flush loop services the edge.
    pub dirty: u8,
}

impl Registry {
    /// Subscribes a session to an object's attribute updates. A fresh edge
    /// starts dirty for every attribute the object already carries so the
    /// observer catches up on the next flush.
    pub fn add_observer(&mut self, object_id: i32, session_id: i32) {
        let initial = match self.objects.get_mut(&object_id) {
            Some(object) => {
                if !object.observer_sessions.contains(&session_id) {
                    object.observer_sessions.push(session_id);
                }
                let mut bits = 0u8;
                if object.has_position() {
                    bits |= DIRTY_POSITION;
                }
                if !object.avatar_url.is_empty() {
                    bits |= DIRTY_AVATAR;
                }
                if !object.nickname.is_empty() {
                    bits |= DIRTY_NICKNAME;
                }
                bits
            }
            None => return,
        };
        let Some(session) = self.sessions.get_mut(&session_id) else {
            return;
        };
        match session.observed.get_mut(&object_id) {
            Some(edge) => edge.instances += 1,
            None => {
                session.observed.insert(
                    object_id,
                    ObserverEdge {
                        instances: 1,
                        dirty: initial,
                    },
                );
                if initial != 0 {
                    session.dirty_queue.push_back(object_id);
                }
            }
        }
    }

    /// Drops one subscription on the edge; the edge itself only goes away
    /// when the count reaches zero. `force` removes it regardless of the
    /// count, which teardown paths use.
    pub fn remove_observer(&mut self, object_id: i32, session_id: i32, force: bool) {
        let removed = match self.sessions.get_mut(&session_id) {
            Some(session) => match session.observed.get_mut(&object_id) {
                Some(edge) => {
                    if !force && edge.instances > 1 {
                        edge.instances -= 1;
                        false
                    } else {
                        session.observed.remove(&object_id);
                        session.dirty_queue.retain(|&id| id != object_id);
                        true
                    }
                }
                None => {
                    log_world(&format!(
                        "Connection #{} does not observe object #{}",
                        session_id, object_id
                    ));
                    false
                }
            },
            None => false,
        };
        if removed {
            if let Some(object) = self.objects.get_mut(&object_id) {
                object.observer_sessions.retain(|&id| id != session_id);
            }
        }
    }

    /// Flags attribute bits on every edge pointing at the object. An edge
    /// going from clean to dirty is queued exactly once.
    pub fn mark_dirty(&mut self, object_id: i32, bits: u8) {
        let observers = match self.objects.get(&object_id) {
            Some(object) => object.observer_sessions.clone(),
            None => return,
        };
        for session_id in observers {
            if let Some(session) = self.sessions.get_mut(&session_id) {
                if let Some(edge) = session.observed.get_mut(&object_id) {
                    if edge.dirty == 0 {
                        session.dirty_queue.push_back(object_id);
                    }
                    edge.dirty |= bits;
                }
            }
        }
    }

    /// Services one dirty edge per session, emitting the pending attribute
    /// records in position, avatar, nickname order. Attribute values are read
    /// at flush time, so rapid updates collapse into the latest one.
    pub fn flush_updates(&mut self) {
        let session_ids: Vec<i32> = self.sessions.keys().copied().collect();
        for session_id in session_ids {
            let object_id = match self
                .sessions
                .get_mut(&session_id)
                .and_then(|session| session.dirty_queue.pop_front())
            {
                Some(id) => id,
                None => continue,
            };
            let bits = match self
                .sessions
                .get_mut(&session_id)
                .and_then(|session| session.observed.get_mut(&object_id))
            {
                Some(edge) => {
                    let bits = edge.dirty;
                    edge.dirty = 0;
                    bits
                }
                None => continue,
            };
            let position = match self.objects.get(&object_id) {
                Some(object) => object.position,
                None => continue,
            };
            if bits & DIRTY_POSITION != 0 {
                self.push_record(
                    session_id,
                    Record::ObjectPosition(ObjectPositionRecord {
                        object_id,
                        position,
                    }),
                );
            }
            if bits & DIRTY_AVATAR != 0 {
                let url = self.filtered_avatar_url(object_id, session_id);
                self.push_record(
                    session_id,
                    Record::ObjectAvatar(ObjectAvatarRecord { object_id, url }),
                );
            }
            if bits & DIRTY_NICKNAME != 0 {
                let nickname = self.filtered_nickname(object_id, session_id);
                self.push_record(
                    session_id,
                    Record::ObjectNickname(ObjectNicknameRecord {
                        object_id,
                        nickname,
                    }),
                );
            }
        }
    }

    /// The avatar URL as one particular observer should see it. Ignored
    /// clients show nothing, worlds with an avatar whitelist substitute
    /// unapproved URLs, and observers in simple-avatar mode get a synthetic
    /// URL from the configured pool.
    pub fn filtered_avatar_url(&mut self, object_id: i32, observer_id: i32) -> String {
        let (owner_id, world_name, instance_id, mut url) = match self.objects.get(&object_id) {
            Some(object) => (
                object.session_id,
                object.world_name.clone(),
                object.instance_id,
                object.avatar_url.clone(),
            ),
            None => return String::new(),
        };
        let owner_ident = self
            .sessions
            .get(&owner_id)
            .map(|session| session.client_ident.clone())
            .unwrap_or_default();
        if let Some(observer) = self.sessions.get(&observer_id) {
            if observer.ignored_idents.contains(&owner_ident) {
                return String::new();
            }
        }

        let (approved, default_avatar) = match self.worlds.get(&world_name) {
            Some(world) => (world.approved_avatars.clone(), world.default_avatar.clone()),
            None => (Vec::new(), None),
        };
        if !approved.is_empty() && !approved.contains(&url) {
            if let Some(default) = default_avatar {
                return default;
            }
            // The substitute sticks to the object; new objects draw the next
            // one from the instance's rotating counter.
            let sticky = self
                .objects
                .get(&object_id)
                .and_then(|object| object.approved_avatar_index)
                .filter(|&index| index < approved.len());
            let index = match sticky {
                Some(index) => index,
                None => {
                    let mut index = 0usize;
                    if let Some(world) = self.worlds.get_mut(&world_name) {
                        if let Some(instance) = world.instance_mut(instance_id) {
                            index = instance.next_approved_avatar;
                            instance.next_approved_avatar += 1;
                            if index >= approved.len() {
                                instance.next_approved_avatar = 1;
                                index = 0;
                            }
                        }
                    }
                    if let Some(object) = self.objects.get_mut(&object_id) {
                        object.approved_avatar_index = Some(index);
                    }
                    index
                }
            };
            return approved.get(index).cloned().unwrap_or_default();
        }

        let prefix = self.settings.simple_avatar_url_prefix.clone();
        let pool = self.settings.num_simple_avatars;
        let wants_simple = self
            .sessions
            .get(&observer_id)
            .map(|session| session.simple_avatars)
            .unwrap_or(false);
        if wants_simple && !url.starts_with(&prefix) {
            if let Some(session) = self.sessions.get_mut(&observer_id) {
                let id = session.next_simple_avatar;
                session.next_simple_avatar += 1;
                if session.next_simple_avatar >= pool {
                    session.next_simple_avatar = 1;
                }
                url = format!("{}{:02}/default{:02}.aer", prefix, id, id);
            }
        }
        url
    }

    /// The nickname as one particular observer should see it, including the
    /// moderation masks and the optional connection-id suffix.
    pub fn filtered_nickname(&self, object_id: i32, observer_id: i32) -> String {
        let Some(object) = self.objects.get(&object_id) else {
            return String::new();
        };
        let owner = self.sessions.get(&object.session_id);
        let observer = self.sessions.get(&observer_id);
        let owner_ident = owner
            .map(|session| session.client_ident.as_str())
            .unwrap_or("");
        let squelched = owner.map(|session| session.squelched).unwrap_or(false);
        let ignored = observer
            .map(|session| session.ignored_idents.contains(owner_ident))
            .unwrap_or(false);
        let mut nickname = if squelched {
            "[squelched]".to_string()
        } else if ignored {
            "[ignored]".to_string()
        } else {
            object.nickname.clone()
        };
        let show = observer
            .map(|session| session.show_identities)
            .unwrap_or(false);
        if show {
            let suffix = format!("[{}]", object_id);
            let budget = MAX_NICKNAME.saturating_sub(suffix.len());
            nickname = format!("{}{}", truncate_to_bytes(&nickname, budget), suffix);
        }
        nickname
    }
}
