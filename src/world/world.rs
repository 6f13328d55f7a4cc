use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;

use crate::net::records::{
    Fault, ModeratorActionRecord, ObjectsCreateAckRecord, ObjectsCreateV2Record,
    ObjectsCreateV3Record, Record, ERROR_OBJECT_CREATION, MODERATOR_ASSOCIATION,
};
use crate::settings::{ServerRole, ServerSettings};
use crate::telemetry::logging::log_world;
use crate::world::group::ObjectGroup;
use crate::world::object::Object;
use crate::world::registry::Registry;

/// A normalized object creation request; the two wire variants differ only
/// in the page URL field.
#[derive(Clone, Debug)]
pub struct PlacementRequest {
    pub owner: i32,
    pub world_name: String,
    pub reference: String,
    pub page_url: String,
    pub instance_id: i32,
    pub num_objects: i32,
    pub coming_from: String,
    pub cookie: i32,
}

impl PlacementRequest {
    pub fn from_v2(record: &ObjectsCreateV2Record) -> Self {
        Self {
            owner: record.owner,
            world_name: record.world_name.clone(),
            reference: record.reference.clone(),
            page_url: String::new(),
            instance_id: record.instance_id,
            num_objects: record.num_objects,
            coming_from: record.coming_from.clone(),
            cookie: record.cookie,
        }
    }

    pub fn from_v3(record: &ObjectsCreateV3Record) -> Self {
        Self {
            owner: record.owner,
            world_name: record.world_name.clone(),
            reference: record.reference.clone(),
            page_url: record.page_url.clone(),
            instance_id: record.instance_id,
            num_objects: record.num_objects,
            coming_from: record.coming_from.clone(),
            cookie: record.cookie,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PlacementChoice {
    /// An explicit id, a reservation or transition affinity named the
    /// instance. These placements never feed the transition cache.
    Directed(i32),
    /// Load balancing picked an existing instance.
    Balanced(i32),
    /// No instance qualified; the caller creates a fresh one.
    New,
}

/// Capacity promised to a later creation request. The negative reservation
/// id doubles as the instance id field of that request.
#[derive(Clone, Copy, Debug)]
pub struct Reservation {
    pub instance_id: i32,
    pub num_objects: i32,
}

/// One arrival recorded from an external origin, used to steer subsequent
/// arrivals from other origins into the same instance.
#[derive(Clone, Copy, Debug)]
struct Transition {
    instance_id: i32,
    at: Instant,
}

/// One population shard of a world. Each instance carries its own group,
/// so its members and observers are isolated from the other instances.
#[derive(Debug)]
pub struct WorldInstance {
    pub group: ObjectGroup,
    /// Capacity held back by outstanding reservations.
    pub reserved: i32,
    /// Member ids flagged as application objects.
    pub app_objects: Vec<i32>,
    /// Rotating cursor into the world's approved avatar list.
    pub next_approved_avatar: usize,
    /// Session that created the instance, when that session is the
    /// configured slave account. Placement ties break towards it.
    pub slave_session: Option<i32>,
}

impl WorldInstance {
    pub fn new(group_id: i32, slave_session: Option<i32>) -> Self {
        Self {
            group: ObjectGroup::new(group_id),
            reserved: 0,
            app_objects: Vec::new(),
            next_approved_avatar: 0,
            slave_session,
        }
    }

    /// The instance id is its group id.
    pub fn id(&self) -> i32 {
        self.group.id
    }

    pub fn occupancy(&self) -> i32 {
        self.group.objects.len() as i32 + self.reserved
    }
}

pub struct World {
    pub name: String,
    pub max_objects: i32,
    /// Capacity a placement tries to leave unused per instance, so late
    /// joiners headed for an almost full instance still fit.
    pub head_room: i32,
    pub instances: Vec<WorldInstance>,
    pub reservations: HashMap<i32, Reservation>,
    pub approved_avatars: Vec<String>,
    pub default_avatar: Option<String>,
    /// Hashed passwords accepted by the /broadcast command in this world.
    pub broadcast_password_tokens: Vec<String>,
    transitions: LruCache<String, Transition>,
}

impl World {
    pub fn new(name: &str, settings: &ServerSettings) -> Self {
        let overrides = settings.world_settings(name);
        let max_objects = overrides
            .and_then(|world| world.max_objects)
            .unwrap_or(settings.max_objects_per_instance);
        let capacity = match NonZeroUsize::new(settings.transition_cache_capacity.max(1)) {
            Some(capacity) => capacity,
            None => NonZeroUsize::MIN,
        };
        Self {
            name: name.to_string(),
            max_objects,
            head_room: max_objects / 4,
            instances: Vec::new(),
            reservations: HashMap::new(),
            approved_avatars: overrides
                .map(|world| world.approved_avatars.clone())
                .unwrap_or_default(),
            default_avatar: overrides.and_then(|world| world.default_avatar.clone()),
            broadcast_password_tokens: overrides
                .map(|world| world.broadcast_password_tokens.clone())
                .unwrap_or_default(),
            transitions: LruCache::new(capacity),
        }
    }

    pub fn instance_index(&self, instance_id: i32) -> Option<usize> {
        self.instances
            .iter()
            .position(|instance| instance.id() == instance_id)
    }

    pub fn instance_mut(&mut self, instance_id: i32) -> Option<&mut WorldInstance> {
        self.instances
            .iter_mut()
            .find(|instance| instance.id() == instance_id)
    }

    pub fn has_capacity(&self, index: usize, num_objects: i32) -> bool {
        self.instances
            .get(index)
            .map(|instance| instance.occupancy() + num_objects <= self.max_objects)
            .unwrap_or(false)
    }

    pub fn leaves_head_room(&self, index: usize, num_objects: i32) -> bool {
        self.instances
            .get(index)
            .map(|instance| instance.occupancy() + num_objects + self.head_room <= self.max_objects)
            .unwrap_or(false)
    }

    /// Every observer entry across all instances of this world.
    pub fn all_observers(&self) -> Vec<i32> {
        self.instances
            .iter()
            .flat_map(|instance| instance.group.observers.iter().copied())
            .collect()
    }

    pub fn record_transition(&mut self, origin: &str, instance_id: i32, now: Instant) {
        self.transitions.put(origin.to_string(), Transition { instance_id, at: now });
    }

    pub fn purge_transitions_to(&mut self, instance_id: i32) {
        let keys: Vec<String> = self
            .transitions
            .iter()
            .filter(|(_, transition)| transition.instance_id == instance_id)
            .map(|(key, _)| key.clone())
            .collect();
        for key in keys {
            self.transitions.pop(&key);
        }
    }

    pub fn transition_len(&self) -> usize {
        self.transitions.len()
    }

    /// Finds a fresh transition recorded from some other origin whose
    /// destination can still hold the arrival, refreshing it on a hit so a
    /// stream of arrivals keeps converging.
    fn follow_transition(
        &mut self,
        origin: &str,
        num_objects: i32,
        now: Instant,
        expiry: Duration,
    ) -> Option<i32> {
        let expired: Vec<String> = self
            .transitions
            .iter()
            .filter(|(_, transition)| now.saturating_duration_since(transition.at) > expiry)
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            self.transitions.pop(&key);
        }
        let mut matched: Option<String> = None;
        for (key, transition) in self.transitions.iter().rev() {
            if key.as_str() == origin {
                continue;
            }
            let Some(index) = self.instance_index(transition.instance_id) else {
                continue;
            };
            if self.has_capacity(index, num_objects) {
                matched = Some(key.clone());
                break;
            }
        }
        let key = matched?;
        match self.transitions.get_mut(&key) {
            Some(transition) => {
                transition.at = now;
                Some(transition.instance_id)
            }
            None => None,
        }
    }

    /// Picks the instance for a creation request. Explicit positive ids must
    /// exist and fit, negative ids consume a matching reservation, tagged
    /// arrivals follow recent transitions, and everything else load-balances
    /// onto the fullest instance that still leaves head room.
    pub fn choose_instance(
        &mut self,
        request: &PlacementRequest,
        session_id: i32,
        now: Instant,
        expiry: Duration,
    ) -> Result<PlacementChoice, Fault> {
        let num = request.num_objects;
        let cookie = request.cookie;
        if request.instance_id > 0 {
            let Some(index) = self.instance_index(request.instance_id) else {
                return Err(Fault::new(
                    ERROR_OBJECT_CREATION,
                    cookie,
                    format!(
                        "World instance \"{}\":{} does not exist.",
                        self.name, request.instance_id
                    ),
                ));
            };
            if !self.has_capacity(index, num) {
                return Err(Fault::new(
                    ERROR_OBJECT_CREATION,
                    cookie,
                    format!(
                        "World instance \"{}\":{} is full.",
                        self.name, request.instance_id
                    ),
                ));
            }
            return Ok(PlacementChoice::Directed(request.instance_id));
        }
        if request.instance_id < 0 {
            let matched = self
                .reservations
                .get(&request.instance_id)
                .map(|reservation| (reservation.instance_id, reservation.num_objects));
            let Some((instance_id, reserved_count)) = matched else {
                return Err(Fault::new(
                    ERROR_OBJECT_CREATION,
                    cookie,
                    format!("Reservation {} is forged or expired.", request.instance_id),
                ));
            };
            if reserved_count != num {
                return Err(Fault::new(
                    ERROR_OBJECT_CREATION,
                    cookie,
                    format!(
                        "Reservation {} covers {} objects, not {}.",
                        request.instance_id, reserved_count, num
                    ),
                ));
            }
            self.reservations.remove(&request.instance_id);
            let Some(index) = self.instance_index(instance_id) else {
                return Err(Fault::new(
                    ERROR_OBJECT_CREATION,
                    cookie,
                    format!(
                        "World instance \"{}\":{} does not exist.",
                        self.name, instance_id
                    ),
                ));
            };
            self.instances[index].reserved -= num;
            if !self.has_capacity(index, num) {
                return Err(Fault::new(
                    ERROR_OBJECT_CREATION,
                    cookie,
                    format!("World instance \"{}\":{} is full.", self.name, instance_id),
                ));
            }
            return Ok(PlacementChoice::Directed(instance_id));
        }
        if !request.coming_from.is_empty() {
            if let Some(instance_id) = self.follow_transition(&request.coming_from, num, now, expiry)
            {
                return Ok(PlacementChoice::Directed(instance_id));
            }
        }
        let mut best: Option<usize> = None;
        let mut best_preferred = false;
        for index in 0..self.instances.len() {
            if !self.has_capacity(index, num) {
                continue;
            }
            let preferred = self.leaves_head_room(index, num);
            let better = match best {
                None => true,
                Some(current) => {
                    if preferred != best_preferred {
                        preferred
                    } else {
                        let occupancy = self.instances[index].occupancy();
                        let current_occupancy = self.instances[current].occupancy();
                        if occupancy != current_occupancy {
                            occupancy > current_occupancy
                        } else {
                            self.instances[index].slave_session == Some(session_id)
                                && self.instances[current].slave_session != Some(session_id)
                        }
                    }
                }
            };
            if better {
                best = Some(index);
                best_preferred = preferred;
            }
        }
        match best {
            Some(index) => Ok(PlacementChoice::Balanced(self.instances[index].id())),
            None => Ok(PlacementChoice::New),
        }
    }
}

impl Registry {
    pub(crate) fn ensure_world(&mut self, name: &str) {
        if !self.worlds.contains_key(name) {
            log_world(&format!("Creating world \"{}\"", name));
            let world = World::new(name, &self.settings);
            self.worlds.insert(name.to_string(), world);
        }
    }

    /// Creates the requested objects, placing them according to the request
    /// and confirming with a creation ack. The creator ends up observing the
    /// chosen instance's group unless it is the slave account.
    pub fn create_objects(
        &mut self,
        session_id: i32,
        request: &PlacementRequest,
        now: Instant,
    ) -> Result<Vec<i32>, Fault> {
        let cookie = request.cookie;
        let (owned_count, client_ident, is_slave) = match self.sessions.get(&session_id) {
            Some(session) => (
                session.objects.len(),
                session.client_ident.clone(),
                session.user_id == self.settings.slave_user_id,
            ),
            None => return Err(Fault::general("Unknown connection.")),
        };
        let privileged = self.is_privileged(session_id);
        if request.world_name.is_empty() {
            return Err(Fault::new(ERROR_OBJECT_CREATION, cookie, "No world name given."));
        }
        if request.num_objects > self.settings.max_objects_created_simultaneously {
            return Err(Fault::new(
                ERROR_OBJECT_CREATION,
                cookie,
                "Attempted to create too many objects at once.",
            ));
        }
        if request.owner != session_id && !privileged {
            return Err(Fault::new(
                ERROR_OBJECT_CREATION,
                cookie,
                "Attempted to create objects for another connection.",
            ));
        }
        if !privileged
            && owned_count + request.num_objects.max(0) as usize
                > self.settings.max_objects_per_client
        {
            return Err(Fault::new(
                ERROR_OBJECT_CREATION,
                cookie,
                "Attempted to create too many objects.",
            ));
        }
        self.ensure_world(&request.world_name);
        let world_max = self
            .worlds
            .get(&request.world_name)
            .map(|world| world.max_objects)
            .unwrap_or(0);
        if request.num_objects < 1 || request.num_objects > world_max {
            return Err(Fault::new(
                ERROR_OBJECT_CREATION,
                cookie,
                format!("Unable to create {} objects.", request.num_objects),
            ));
        }
        let expiry = self.settings.transition_expiry();
        let choice = match self.worlds.get_mut(&request.world_name) {
            Some(world) => world.choose_instance(request, session_id, now, expiry)?,
            None => return Err(Fault::new(ERROR_OBJECT_CREATION, cookie, "No world name given.")),
        };
        let (instance_id, balanced) = match choice {
            PlacementChoice::Directed(id) => (id, false),
            PlacementChoice::Balanced(id) => (id, true),
            PlacementChoice::New => {
                let id = self.generate_entity_id();
                if let Some(world) = self.worlds.get_mut(&request.world_name) {
                    let slave_session = if is_slave { Some(session_id) } else { None };
                    world.instances.push(WorldInstance::new(id, slave_session));
                    log_world(&format!("Created instance \"{}\":{}", request.world_name, id));
                }
                (id, true)
            }
        };
        // Only balanced placements seed the cache; directed arrivals were
        // already steered.
        if balanced && !request.coming_from.is_empty() {
            if let Some(world) = self.worlds.get_mut(&request.world_name) {
                world.record_transition(&request.coming_from, instance_id, now);
            }
        }
        let index = match self
            .worlds
            .get(&request.world_name)
            .and_then(|world| world.instance_index(instance_id))
        {
            Some(index) => index,
            None => {
                return Err(Fault::new(
                    ERROR_OBJECT_CREATION,
                    cookie,
                    "World instance vanished during placement.",
                ));
            }
        };
        let mut created = Vec::with_capacity(request.num_objects as usize);
        for _ in 0..request.num_objects {
            let object_id = self.generate_entity_id();
            self.objects.insert(
                object_id,
                Object::new(
                    object_id,
                    session_id,
                    request.owner,
                    &request.world_name,
                    instance_id,
                    now,
                ),
            );
            if let Some(session) = self.sessions.get_mut(&session_id) {
                session.objects.push(object_id);
            }
            self.group_add_object(&request.world_name, index, object_id);
            created.push(object_id);
        }
        log_world(&format!(
            "Connection #{} created {} object(s) in \"{}\":{}",
            session_id,
            created.len(),
            request.world_name,
            instance_id
        ));
        self.push_record(
            session_id,
            Record::ObjectsCreateAck(ObjectsCreateAckRecord {
                owner: request.owner,
                world_name: request.world_name.clone(),
                instance_id,
                objects: created.clone(),
                cookie,
            }),
        );
        if self.role == ServerRole::Primary && !client_ident.is_empty() {
            for &object_id in &created {
                self.push_record(
                    session_id,
                    Record::ModeratorAction(ModeratorActionRecord {
                        purpose: MODERATOR_ASSOCIATION,
                        client_ident: client_ident.clone(),
                        world_name: request.world_name.clone(),
                        privileges: String::new(),
                        expiration: 0,
                        object_id,
                        flags: 0,
                    }),
                );
            }
        }
        if !is_slave {
            let already = match self.worlds.get(&request.world_name) {
                Some(world) => match world.instance_index(instance_id) {
                    Some(index) => world.instances[index].group.has_observer(session_id),
                    None => true,
                },
                None => true,
            };
            if !already {
                self.group_add_observer(&request.world_name, index, session_id);
            }
        }
        Ok(created)
    }

    /// Creates a single, possibly named or application-flagged object
    /// directly in an existing instance. Used by privileged tooling rather
    /// than the regular creation records.
    pub fn create_named_object(
        &mut self,
        session_id: i32,
        world_name: &str,
        instance_id: i32,
        name: Option<String>,
        app_object: bool,
        now: Instant,
    ) -> Result<i32, Fault> {
        let Some(index) = self
            .worlds
            .get(world_name)
            .and_then(|world| world.instance_index(instance_id))
        else {
            return Err(Fault::new(
                ERROR_OBJECT_CREATION,
                instance_id,
                format!("World instance \"{}\":{} does not exist.", world_name, instance_id),
            ));
        };
        let object_id = self.generate_entity_id();
        let mut object = Object::new(object_id, session_id, session_id, world_name, instance_id, now);
        object.name = name;
        object.app_object = app_object;
        self.objects.insert(object_id, object);
        if let Some(session) = self.sessions.get_mut(&session_id) {
            session.objects.push(object_id);
        }
        if app_object {
            if let Some(world) = self.worlds.get_mut(world_name) {
                if let Some(instance) = world.instance_mut(instance_id) {
                    instance.app_objects.push(object_id);
                }
            }
        }
        self.group_add_object(world_name, index, object_id);
        log_world(&format!(
            "Connection #{} placed object #{} in \"{}\":{}",
            session_id, object_id, world_name, instance_id
        ));
        Ok(object_id)
    }

    /// Holds capacity in an instance for a later creation request. The
    /// returned negative id is handed back as that request's instance id.
    pub fn reserve_instance(
        &mut self,
        world_name: &str,
        instance_id: i32,
        num_objects: i32,
    ) -> Result<i32, String> {
        if num_objects < 1 {
            return Err("Reservations must cover at least one object.".to_string());
        }
        {
            let Some(world) = self.worlds.get(world_name) else {
                return Err(format!("No world named \"{}\".", world_name));
            };
            let Some(index) = world.instance_index(instance_id) else {
                return Err(format!("No instance {} in world \"{}\".", instance_id, world_name));
            };
            if !world.has_capacity(index, num_objects) {
                return Err(format!(
                    "World instance \"{}\":{} cannot hold {} more objects.",
                    world_name, instance_id, num_objects
                ));
            }
        }
        let reservation_id = self.allocate_reservation_id();
        if let Some(world) = self.worlds.get_mut(world_name) {
            if let Some(instance) = world.instance_mut(instance_id) {
                instance.reserved += num_objects;
            }
            world.reservations.insert(
                reservation_id,
                Reservation {
                    instance_id,
                    num_objects,
                },
            );
        }
        log_world(&format!(
            "Reserved {} slot(s) in \"{}\":{} as reservation {}",
            num_objects, world_name, instance_id, reservation_id
        ));
        Ok(reservation_id)
    }

    /// Tears down an instance once nothing keeps it alive: no members, no
    /// outstanding reservations, no application objects.
    pub fn detach_instance_if_unused(&mut self, world_name: &str, instance_id: i32) {
        let removable = match self.worlds.get(world_name) {
            Some(world) => match world.instance_index(instance_id) {
                Some(index) => {
                    let instance = &world.instances[index];
                    instance.group.objects.is_empty()
                        && instance.reserved == 0
                        && instance.app_objects.is_empty()
                }
                None => false,
            },
            None => false,
        };
        if !removable {
            return;
        }
        if let Some(world) = self.worlds.get_mut(world_name) {
            if let Some(index) = world.instance_index(instance_id) {
                world.instances.remove(index);
                world.purge_transitions_to(instance_id);
                log_world(&format!("Tearing down instance \"{}\":{}", world_name, instance_id));
            }
        }
        self.detach_world_if_unused(world_name);
    }

    pub fn detach_world_if_unused(&mut self, world_name: &str) {
        let removable = self
            .worlds
            .get(world_name)
            .map(|world| {
                world.instances.is_empty()
                    && world.reservations.is_empty()
                    && world.transition_len() == 0
            })
            .unwrap_or(false);
        if removable {
            self.worlds.remove(world_name);
            log_world(&format!("Tearing down world \"{}\"", world_name));
        }
    }
}
