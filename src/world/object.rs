use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::net::records::{
    BroadcastRecord, ErrorRecord, Fault, Record, SayRecord, SayTargetedRecord,
    ERROR_OBJECT_AVATAR, ERROR_OBJECT_DESTRUCTION, ERROR_OBJECT_NICKNAME, ERROR_OBJECT_POSITION,
    ERROR_OBJECT_SAYING,
};
use crate::telemetry::logging::log_world;
use crate::world::observer::{DIRTY_AVATAR, DIRTY_NICKNAME, DIRTY_POSITION};
use crate::world::registry::Registry;
use crate::world::session::BroadcastMode;

/// Minimum spacing between sayings from one object; faster senders queue.
pub const MIN_SAY_INTERVAL: Duration = Duration::from_millis(100);
/// Queue bound per object. Overflow is reported but never fatal.
pub const MAX_QUEUED_SAYINGS: usize = 60;

#[derive(Clone, Debug)]
pub struct QueuedSaying {
    pub from_id: i32,
    pub to_id: i32,
    pub target: Option<String>,
    pub text: String,
}

/// A presence in some world instance: owned by a session, a member of that
/// instance's group and carrying the three published attributes.
#[derive(Debug)]
pub struct Object {
    pub id: i32,
    /// Session whose connection created the object.
    pub session_id: i32,
    /// Owner id the client declared on creation; privileged peers may create
    /// objects on behalf of other connections.
    pub owner: i32,
    pub world_name: String,
    pub instance_id: i32,
    /// Groups the object is a member of, one entry per membership.
    pub groups: Vec<i32>,
    pub name: Option<String>,
    pub app_object: bool,
    pub avatar_url: String,
    pub nickname: String,
    pub position: [f64; 6],
    /// Index into the world's approved avatar list once the whitelist has
    /// substituted this object's avatar.
    pub approved_avatar_index: Option<usize>,
    /// Sessions holding an observation edge on this object.
    pub observer_sessions: Vec<i32>,
    pub say_queue: VecDeque<QueuedSaying>,
    pub last_say: Instant,
}

impl Object {
    pub fn new(
        id: i32,
        session_id: i32,
        owner: i32,
        world_name: &str,
        instance_id: i32,
        now: Instant,
    ) -> Self {
        Self {
            id,
            session_id,
            owner,
            world_name: world_name.to_string(),
            instance_id,
            groups: Vec::new(),
            name: None,
            app_object: false,
            avatar_url: String::new(),
            nickname: String::new(),
            position: [0.0; 6],
            approved_avatar_index: None,
            observer_sessions: Vec::new(),
            say_queue: VecDeque::new(),
            last_say: now,
        }
    }

    /// An all-zero position counts as never reported.
    pub fn has_position(&self) -> bool {
        self.position.iter().any(|&value| value != 0.0)
    }
}

impl Registry {
    pub fn set_avatar(&mut self, session_id: i32, object_id: i32, url: String) -> Result<(), Fault> {
        let owns = self
            .sessions
            .get(&session_id)
            .map(|session| session.owns_object(object_id))
            .unwrap_or(false);
        if !owns {
            return Err(Fault::new(
                ERROR_OBJECT_AVATAR,
                object_id,
                "Attempted to set the avatar of an object you do not own.",
            ));
        }
        let world_name = match self.objects.get_mut(&object_id) {
            Some(object) => {
                object.avatar_url = url.clone();
                object.approved_avatar_index = None;
                object.world_name.clone()
            }
            None => return Ok(()),
        };
        self.mark_dirty(object_id, DIRTY_AVATAR);
        self.echo_broadcast(session_id, object_id, &world_name, format!("AVATAR:{}", url));
        Ok(())
    }

    pub fn set_position(
        &mut self,
        session_id: i32,
        object_id: i32,
        position: [f64; 6],
    ) -> Result<(), Fault> {
        let owns = self
            .sessions
            .get(&session_id)
            .map(|session| session.owns_object(object_id))
            .unwrap_or(false);
        if !owns {
            return Err(Fault::new(
                ERROR_OBJECT_POSITION,
                object_id,
                "Attempted to move an object you do not own.",
            ));
        }
        let world_name = match self.objects.get_mut(&object_id) {
            Some(object) => {
                object.position = position;
                object.world_name.clone()
            }
            None => return Ok(()),
        };
        self.mark_dirty(object_id, DIRTY_POSITION);
        let formatted: Vec<String> = position.iter().map(|value| format!("{:.16}", value)).collect();
        self.echo_broadcast(
            session_id,
            object_id,
            &world_name,
            format!("POS: {}", formatted.join(" ")),
        );
        Ok(())
    }

    pub fn set_nickname(
        &mut self,
        session_id: i32,
        object_id: i32,
        nickname: String,
    ) -> Result<(), Fault> {
        let owns = self
            .sessions
            .get(&session_id)
            .map(|session| session.owns_object(object_id))
            .unwrap_or(false);
        if !owns {
            return Err(Fault::new(
                ERROR_OBJECT_NICKNAME,
                object_id,
                "Attempted to rename an object you do not own.",
            ));
        }
        if let Some(object) = self.objects.get_mut(&object_id) {
            object.nickname = nickname;
        }
        self.mark_dirty(object_id, DIRTY_NICKNAME);
        Ok(())
    }

    /// Accepts a saying from a session. The first saying after a quiet period
    /// goes out immediately; anything faster than the minimum interval queues
    /// behind it, and a full queue is reported without closing the session.
    pub fn say(
        &mut self,
        session_id: i32,
        from_id: i32,
        to_id: i32,
        target: Option<String>,
        text: String,
        now: Instant,
    ) -> Result<(), Fault> {
        let owns = self
            .sessions
            .get(&session_id)
            .map(|session| session.owns_object(from_id))
            .unwrap_or(false);
        if !owns {
            return Err(Fault::new(
                ERROR_OBJECT_SAYING,
                from_id,
                "Attempted to speak through an object you do not own.",
            ));
        }
        let saying = QueuedSaying {
            from_id,
            to_id,
            target,
            text,
        };
        let (queued, due) = match self.objects.get(&from_id) {
            Some(object) => (
                object.say_queue.len(),
                now.saturating_duration_since(object.last_say) >= MIN_SAY_INTERVAL,
            ),
            None => return Ok(()),
        };
        if queued == 0 && due {
            if let Some(object) = self.objects.get_mut(&from_id) {
                object.last_say = now;
            }
            return self.say_immediately(from_id, &saying);
        }
        if queued >= MAX_QUEUED_SAYINGS {
            self.push_record(
                session_id,
                Record::Error(ErrorRecord {
                    code: ERROR_OBJECT_SAYING,
                    subject: from_id,
                    message: "Too many queued sayings. Slow down.".to_string(),
                }),
            );
            return Ok(());
        }
        if let Some(object) = self.objects.get_mut(&from_id) {
            object.say_queue.push_back(saying);
        }
        Ok(())
    }

    /// Ships queued sayings, one per object per tick, advancing each sender's
    /// last-say stamp by one interval so the spacing holds after a burst.
    pub fn pump_sayings(&mut self, _now: Instant) {
        let pending: Vec<i32> = self
            .objects
            .iter()
            .filter(|(_, object)| !object.say_queue.is_empty())
            .map(|(&id, _)| id)
            .collect();
        for object_id in pending {
            let saying = match self.objects.get_mut(&object_id) {
                Some(object) => match object.say_queue.pop_front() {
                    Some(saying) => {
                        object.last_say += MIN_SAY_INTERVAL;
                        saying
                    }
                    None => continue,
                },
                None => continue,
            };
            if let Err(fault) = self.say_immediately(object_id, &saying) {
                let owner = self.objects.get(&object_id).map(|object| object.session_id);
                if let Some(session_id) = owner {
                    self.kill_session(session_id, fault);
                }
            }
        }
    }

    /// Resolves the audience and fans the saying out. Broadcast modes widen
    /// the audience to whole worlds; otherwise the target must be a group the
    /// sender observes or an object the sender holds an edge on.
    pub(crate) fn say_immediately(
        &mut self,
        object_id: i32,
        saying: &QueuedSaying,
    ) -> Result<(), Fault> {
        let (owner_id, world_name) = match self.objects.get(&object_id) {
            Some(object) => (object.session_id, object.world_name.clone()),
            None => return Ok(()),
        };
        let (sender_ident, mode, observes_group, observes_object) =
            match self.sessions.get(&owner_id) {
                Some(session) => (
                    session.client_ident.clone(),
                    session.broadcast_mode,
                    session.observes_group(saying.to_id),
                    session.observed.contains_key(&saying.to_id),
                ),
                None => return Ok(()),
            };
        let serial = self.next_saying_serial();
        match mode {
            BroadcastMode::World => {
                let targets = self
                    .worlds
                    .get(&world_name)
                    .map(|world| world.all_observers())
                    .unwrap_or_default();
                for session_id in targets {
                    self.hear_session(session_id, saying, &sender_ident, serial);
                }
                Ok(())
            }
            BroadcastMode::Universe => {
                let mut targets: Vec<i32> = Vec::new();
                for world in self.worlds.values() {
                    targets.extend(world.all_observers());
                }
                for session_id in targets {
                    self.hear_session(session_id, saying, &sender_ident, serial);
                }
                Ok(())
            }
            BroadcastMode::Off => {
                if observes_group {
                    if let Some((world, index)) = self.find_group(saying.to_id) {
                        self.deliver_to_group(&world, index, saying, &sender_ident, serial);
                    }
                    Ok(())
                } else if observes_object {
                    let listener = self
                        .objects
                        .get(&saying.to_id)
                        .map(|object| object.session_id);
                    if let Some(session_id) = listener {
                        self.hear_session(session_id, saying, &sender_ident, serial);
                    }
                    Ok(())
                } else {
                    Err(Fault::new(
                        ERROR_OBJECT_SAYING,
                        saying.to_id,
                        "Attempted to talk to an object or object group that is not being observed.",
                    ))
                }
            }
        }
    }

    /// Delivers a saying to one session unless it already heard this serial
    /// or ignores the sender.
    pub(crate) fn hear_session(
        &mut self,
        session_id: i32,
        saying: &QueuedSaying,
        sender_ident: &str,
        serial: u64,
    ) {
        let Some(session) = self.sessions.get_mut(&session_id) else {
            return;
        };
        if session.last_heard_serial == serial {
            return;
        }
        session.last_heard_serial = serial;
        if session.ignored_idents.contains(sender_ident) {
            return;
        }
        let record = match &saying.target {
            Some(target) => Record::SayTargeted(SayTargetedRecord {
                from_id: saying.from_id,
                to_id: saying.to_id,
                target: target.clone(),
                text: saying.text.clone(),
            }),
            None => Record::Say(SayRecord {
                from_id: saying.from_id,
                to_id: saying.to_id,
                text: saying.text.clone(),
            }),
        };
        session.push_record(record);
    }

    /// Destroys the listed objects. Only the owning session may destroy an
    /// object unless the caller logged in as a privileged user.
    pub fn destroy_objects(&mut self, session_id: i32, object_ids: &[i32]) -> Result<(), Fault> {
        let privileged = self.is_privileged(session_id);
        for &object_id in object_ids {
            match self.objects.get(&object_id).map(|object| object.session_id) {
                Some(owner) if owner == session_id || privileged => self.detach_object(object_id),
                Some(_) => {
                    return Err(Fault::new(
                        ERROR_OBJECT_DESTRUCTION,
                        object_id,
                        "Attempted to destroy an object that you do not own.",
                    ));
                }
                None if privileged => {
                    log_world(&format!(
                        "Connection #{} destroyed non-existent object #{}",
                        session_id, object_id
                    ));
                }
                None => {
                    return Err(Fault::new(
                        ERROR_OBJECT_DESTRUCTION,
                        object_id,
                        "Attempted to destroy a non-existent object.",
                    ));
                }
            }
        }
        Ok(())
    }

    /// Removes an object from its world: group memberships go first so the
    /// remaining observers hear about it, then the observation edges, then
    /// the object itself. Empty instances are torn down afterwards.
    pub fn detach_object(&mut self, object_id: i32) {
        let Some(object) = self.objects.get(&object_id) else {
            return;
        };
        let owner_id = object.session_id;
        let world_name = object.world_name.clone();
        let instance_id = object.instance_id;
        let groups = object.groups.clone();
        let watchers = object.observer_sessions.clone();

        let broadcasting = self
            .sessions
            .get(&owner_id)
            .map(|session| session.broadcast_mode != BroadcastMode::Off)
            .unwrap_or(false);
        if broadcasting {
            self.echo_broadcast(owner_id, object_id, &world_name, "END".to_string());
            if let Some(session) = self.sessions.get_mut(&owner_id) {
                session.broadcast_mode = BroadcastMode::Off;
            }
        }
        for group_id in groups {
            if let Some((world, index)) = self.find_group(group_id) {
                self.group_remove_object(&world, index, object_id);
            }
        }
        for session_id in watchers {
            self.remove_observer(object_id, session_id, true);
        }
        if let Some(session) = self.sessions.get_mut(&owner_id) {
            session.objects.retain(|&id| id != object_id);
        }
        if let Some(world) = self.worlds.get_mut(&world_name) {
            if let Some(instance) = world.instance_mut(instance_id) {
                instance.app_objects.retain(|&id| id != object_id);
            }
        }
        self.objects.remove(&object_id);
        log_world(&format!(
            "Removed object #{} from \"{}\":{}",
            object_id, world_name, instance_id
        ));
        self.detach_instance_if_unused(&world_name, instance_id);
    }

    /// Mirrors an attribute change back to its owner while broadcast mode is
    /// active, so moderation tooling can record what the broadcaster did.
    fn echo_broadcast(&mut self, session_id: i32, object_id: i32, world_name: &str, info: String) {
        let (mode, ident) = match self.sessions.get(&session_id) {
            Some(session) => (session.broadcast_mode, session.client_ident.clone()),
            None => return,
        };
        if mode == BroadcastMode::Off {
            return;
        }
        self.push_record(
            session_id,
            Record::Broadcast(BroadcastRecord {
                client_ident: ident,
                world_name: world_name.to_string(),
                info,
                object_id,
            }),
        );
    }
}
