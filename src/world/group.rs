use crate::net::records::{
    AddObjectRecord, AddObjectWithNameRecord, GroupObserverAddedRecord,
    GroupObserverRemovedRecord, Record, RemoveObjectRecord,
};
use crate::telemetry::logging::log_world;
use crate::world::object::QueuedSaying;
use crate::world::registry::Registry;

/// Membership and audience of one world instance. The observer list keeps
/// one entry per subscription, so a session observing twice appears twice;
/// saying delivery deduplicates by serial instead.
#[derive(Debug)]
pub struct ObjectGroup {
    pub id: i32,
    pub objects: Vec<i32>,
    pub observers: Vec<i32>,
}

impl ObjectGroup {
    pub fn new(id: i32) -> Self {
        Self {
            id,
            objects: Vec::new(),
            observers: Vec::new(),
        }
    }

    pub fn has_observer(&self, session_id: i32) -> bool {
        self.observers.contains(&session_id)
    }
}

impl Registry {
    /// Locates the world and instance index holding a group id.
    pub fn find_group(&self, group_id: i32) -> Option<(String, usize)> {
        for (name, world) in &self.worlds {
            if let Some(index) = world
                .instances
                .iter()
                .position(|instance| instance.group.id == group_id)
            {
                return Some((name.clone(), index));
            }
        }
        None
    }

    /// Adds an object to a group and announces it to the observers whose
    /// protocol version can express it. Observers too old for a named or
    /// application object skip it entirely, the attribute subscription
    /// included.
    pub fn group_add_object(&mut self, world_name: &str, index: usize, object_id: i32) {
        let (group_id, observers) = match self.worlds.get_mut(world_name) {
            Some(world) => match world.instances.get_mut(index) {
                Some(instance) => {
                    instance.group.objects.push(object_id);
                    (instance.group.id, instance.group.observers.clone())
                }
                None => return,
            },
            None => return,
        };
        let (owner_id, app_object, name) = match self.objects.get_mut(&object_id) {
            Some(object) => {
                object.groups.push(group_id);
                (object.session_id, object.app_object, object.name.clone())
            }
            None => return,
        };
        let anonymous = !app_object && name.is_none();
        for session_id in observers {
            let wants_named = self
                .sessions
                .get(&session_id)
                .map(|session| session.wants_named_objects())
                .unwrap_or(false);
            if !anonymous && !wants_named {
                continue;
            }
            let record = if anonymous {
                Some(Record::AddObject(AddObjectRecord {
                    group_id,
                    object_id,
                }))
            } else if app_object {
                Some(Record::AddObjectWithName(AddObjectWithNameRecord {
                    group_id,
                    object_id,
                    name: name.clone().unwrap_or_default(),
                }))
            } else {
                None
            };
            if let Some(record) = record {
                self.push_record(session_id, record);
            }
            if owner_id != session_id {
                self.add_observer(object_id, session_id);
            }
        }
    }

    /// Removes an object from a group, dropping each non-owning observer's
    /// subscription and telling everyone the member is gone.
    pub fn group_remove_object(&mut self, world_name: &str, index: usize, object_id: i32) {
        let (group_id, observers, present) = match self.worlds.get_mut(world_name) {
            Some(world) => match world.instances.get_mut(index) {
                Some(instance) => {
                    match instance
                        .group
                        .objects
                        .iter()
                        .position(|&id| id == object_id)
                    {
                        Some(position) => {
                            instance.group.objects.remove(position);
                            (instance.group.id, instance.group.observers.clone(), true)
                        }
                        None => (instance.group.id, Vec::new(), false),
                    }
                }
                None => return,
            },
            None => return,
        };
        if !present {
            log_world(&format!(
                "Object #{} is not a member of group {}",
                object_id, group_id
            ));
            return;
        }
        let owner_id = self.objects.get(&object_id).map(|object| object.session_id);
        if let Some(object) = self.objects.get_mut(&object_id) {
            if let Some(position) = object.groups.iter().position(|&id| id == group_id) {
                object.groups.remove(position);
            }
        }
        for session_id in observers {
            if owner_id != Some(session_id) {
                self.remove_observer(object_id, session_id, false);
            }
            self.push_record(
                session_id,
                Record::RemoveObject(RemoveObjectRecord {
                    group_id,
                    object_id,
                }),
            );
        }
    }

    /// Subscribes a session to a group: one snapshot record with the plain
    /// member ids, the named application objects individually where the
    /// client's version allows, then attribute subscriptions on every member
    /// the session does not own.
    pub fn group_add_observer(&mut self, world_name: &str, index: usize, session_id: i32) {
        let (group_id, members) = match self.worlds.get_mut(world_name) {
            Some(world) => match world.instances.get_mut(index) {
                Some(instance) => {
                    instance.group.observers.push(session_id);
                    (instance.group.id, instance.group.objects.clone())
                }
                None => return,
            },
            None => return,
        };
        let wants_named = match self.sessions.get_mut(&session_id) {
            Some(session) => {
                session.observed_groups.push(group_id);
                session.wants_named_objects()
            }
            None => return,
        };
        let mut plain: Vec<i32> = Vec::new();
        let mut named: Vec<(i32, String)> = Vec::new();
        for &member_id in &members {
            if let Some(object) = self.objects.get(&member_id) {
                if object.app_object {
                    named.push((member_id, object.name.clone().unwrap_or_default()));
                } else {
                    plain.push(member_id);
                }
            }
        }
        self.push_record(
            session_id,
            Record::GroupObserverAdded(GroupObserverAddedRecord {
                group_id,
                objects: plain,
            }),
        );
        if wants_named {
            for (member_id, name) in named {
                self.push_record(
                    session_id,
                    Record::AddObjectWithName(AddObjectWithNameRecord {
                        group_id,
                        object_id: member_id,
                        name,
                    }),
                );
            }
        }
        for &member_id in &members {
            let (owned, app_object) = match self.objects.get(&member_id) {
                Some(object) => (object.session_id == session_id, object.app_object),
                None => continue,
            };
            if owned {
                continue;
            }
            if wants_named || !app_object {
                self.add_observer(member_id, session_id);
            }
        }
    }

    /// Drops one subscription of a session on a group, unwinding the member
    /// subscriptions that came with it and confirming with a removal record.
    pub fn group_remove_observer(&mut self, world_name: &str, index: usize, session_id: i32) {
        let (group_id, members, present) = match self.worlds.get_mut(world_name) {
            Some(world) => match world.instances.get_mut(index) {
                Some(instance) => {
                    match instance
                        .group
                        .observers
                        .iter()
                        .position(|&id| id == session_id)
                    {
                        Some(position) => {
                            instance.group.observers.remove(position);
                            (instance.group.id, instance.group.objects.clone(), true)
                        }
                        None => (instance.group.id, Vec::new(), false),
                    }
                }
                None => return,
            },
            None => return,
        };
        if !present {
            log_world(&format!(
                "Connection #{} does not observe group {}",
                session_id, group_id
            ));
            return;
        }
        if let Some(session) = self.sessions.get_mut(&session_id) {
            if let Some(position) = session
                .observed_groups
                .iter()
                .position(|&id| id == group_id)
            {
                session.observed_groups.remove(position);
            }
        }
        for member_id in members {
            let (owned, observed) = match self.sessions.get(&session_id) {
                Some(session) => (
                    self.objects
                        .get(&member_id)
                        .map(|object| object.session_id == session_id)
                        .unwrap_or(true),
                    session.observed.contains_key(&member_id),
                ),
                None => (true, false),
            };
            if !owned && observed {
                self.remove_observer(member_id, session_id, false);
            }
        }
        self.push_record(
            session_id,
            Record::GroupObserverRemoved(GroupObserverRemovedRecord { group_id }),
        );
    }

    /// Fans a saying out to every observer entry of a group. Duplicate
    /// entries and overlapping audiences are filtered by the serial check in
    /// `hear_session`.
    pub(crate) fn deliver_to_group(
        &mut self,
        world_name: &str,
        index: usize,
        saying: &QueuedSaying,
        sender_ident: &str,
        serial: u64,
    ) {
        let targets = match self.worlds.get(world_name) {
            Some(world) => match world.instances.get(index) {
                Some(instance) => instance.group.observers.clone(),
                None => return,
            },
            None => return,
        };
        for session_id in targets {
            self.hear_session(session_id, saying, sender_ident, serial);
        }
    }
}
