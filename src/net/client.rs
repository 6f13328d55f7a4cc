use std::time::Instant;

use crate::admin::commands::{challenge, parse_moderator_command, ModeratorCommand};
use crate::net::records::{
    pretty_version, Fault, LoginAckRecord, LoginRecord, ModeratorActionRecord, Record, SayRecord,
    VersionRecord, ERROR_LOGIN, ERROR_OBJECT_SAYING, MODERATOR_ASSOCIATION, MODERATOR_PRIVILEGE,
};
use crate::telemetry::logging::{log_net, log_session, log_world};
use crate::world::observer::{DIRTY_AVATAR, DIRTY_NICKNAME};
use crate::world::registry::Registry;
use crate::world::session::{BroadcastMode, Session};
use crate::world::world::PlacementRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Handled,
    /// A privileged shutdown command; the server loop winds everything down.
    Shutdown,
}

/// Dispatches one inbound record for a connection. A returned fault is
/// reported to the peer and ends the connection; everything recoverable is
/// answered through the session's outbox instead.
pub fn handle_record(
    registry: &mut Registry,
    session_id: i32,
    record: Record,
    now: Instant,
) -> Result<RecordOutcome, Fault> {
    let (has_version, logged_in) = match registry.session(session_id) {
        Some(session) => (session.version.is_some(), session.logged_in),
        None => return Err(Fault::general("Unknown connection.")),
    };
    if record.requires_version() && !has_version {
        return Err(Fault::general(format!(
            "Received a {} record before version negotiation.",
            record.type_name()
        )));
    }
    if record.requires_login() && !logged_in {
        return Err(Fault::general(format!(
            "Received a {} record before login.",
            record.type_name()
        )));
    }
    registry.touch(session_id, now);

    match record {
        Record::Version(body) => handle_version(registry, session_id, body),
        Record::Login(body) => handle_login(registry, session_id, body),
        Record::ObjectsCreateV2(body) => {
            let request = PlacementRequest::from_v2(&body);
            registry.create_objects(session_id, &request, now)?;
            Ok(RecordOutcome::Handled)
        }
        Record::ObjectsCreateV3(body) => {
            let request = PlacementRequest::from_v3(&body);
            registry.create_objects(session_id, &request, now)?;
            Ok(RecordOutcome::Handled)
        }
        Record::ObjectsDestroy(body) => {
            registry.destroy_objects(session_id, &body.objects)?;
            Ok(RecordOutcome::Handled)
        }
        Record::ObjectAvatar(body) => {
            registry.set_avatar(session_id, body.object_id, body.url)?;
            Ok(RecordOutcome::Handled)
        }
        Record::ObjectPosition(body) => {
            registry.set_position(session_id, body.object_id, body.position)?;
            Ok(RecordOutcome::Handled)
        }
        Record::ObjectNickname(body) => {
            registry.set_nickname(session_id, body.object_id, body.nickname)?;
            Ok(RecordOutcome::Handled)
        }
        Record::Say(body) => {
            handle_say(registry, session_id, body.from_id, body.to_id, None, body.text, now)
        }
        Record::SayTargeted(body) => handle_say(
            registry,
            session_id,
            body.from_id,
            body.to_id,
            Some(body.target),
            body.text,
            now,
        ),
        Record::GroupDropObserver(body) => {
            match registry.find_group(body.group_id) {
                Some((world_name, index)) => {
                    registry.group_remove_observer(&world_name, index, session_id);
                }
                None => log_net(&format!(
                    "Connection #{} dropped unknown group {}",
                    session_id, body.group_id
                )),
            }
            Ok(RecordOutcome::Handled)
        }
        Record::ModeratorAction(body) => handle_moderator_action(registry, session_id, body),
        other => {
            log_net(&format!("Ignoring inbound {} record", other.type_name()));
            Ok(RecordOutcome::Handled)
        }
    }
}

/// Negotiates protocol versions. The server speaks exactly one version, so
/// the peer's supported range has to cover it from both sides.
fn handle_version(
    registry: &mut Registry,
    session_id: i32,
    body: VersionRecord,
) -> Result<RecordOutcome, Fault> {
    let server_version = registry.settings.protocol_version_int();
    if body.min_version > server_version {
        return Err(Fault::general(format!(
            "{} {} requires {} {} or newer.",
            body.app_name,
            pretty_version(body.app_version),
            registry.settings.product_name,
            pretty_version(body.min_version)
        )));
    }
    if body.version < server_version {
        return Err(Fault::general(format!(
            "{} {} only supports {} up to {}.",
            body.app_name,
            pretty_version(body.app_version),
            registry.settings.product_name,
            pretty_version(body.version)
        )));
    }
    if registry.settings.is_banned_app(&body.app_name, body.app_version) {
        return Err(Fault::general(format!(
            "{} {} is not supported by this server. Please upgrade.",
            body.app_name,
            pretty_version(body.app_version)
        )));
    }
    let reply = registry.server_version_record();
    registry.push_record(session_id, Record::Version(reply));
    log_session(&format!(
        "Connection #{} negotiated {} {} on {}",
        session_id,
        body.app_name,
        pretty_version(body.app_version),
        body.os
    ));
    if let Some(session) = registry.session_mut(session_id) {
        session.version = Some(body);
    }
    Ok(RecordOutcome::Handled)
}

fn handle_login(
    registry: &mut Registry,
    session_id: i32,
    body: LoginRecord,
) -> Result<RecordOutcome, Fault> {
    if (body.user_name.is_empty() && body.user_id == 0)
        || body.password.is_empty()
        || body.client_ident.is_empty()
    {
        return Err(Fault::new(ERROR_LOGIN, 0, "Underspecified login request."));
    }
    if registry.settings.is_banned_ident(&body.client_ident) {
        return Err(Fault::new(
            ERROR_LOGIN,
            0,
            "This client is banned from the server.",
        ));
    }
    let user = registry
        .settings
        .find_user(&body.user_name, body.user_id, &body.password)
        .cloned();
    let Some(user) = user else {
        return Err(Fault::new(ERROR_LOGIN, 0, "Unknown user or wrong password."));
    };
    registry.push_record(
        session_id,
        Record::LoginAck(LoginAckRecord {
            user_name: user.user_name.clone(),
            user_id: user.user_id,
            connection_id: session_id,
        }),
    );
    log_session(&format!(
        "Connection #{} logged in as {} (#{})",
        session_id, user.user_name, user.user_id
    ));
    if let Some(session) = registry.session_mut(session_id) {
        session.logged_in = true;
        session.user_name = user.user_name;
        session.user_id = user.user_id;
        session.url = body.url;
        session.client_ident = body.client_ident;
    }
    Ok(RecordOutcome::Handled)
}

/// Chat with a leading slash is a moderator command. Commands are only
/// accepted through an owned object, answer through a Say from object zero
/// and never close the connection on their own.
fn handle_say(
    registry: &mut Registry,
    session_id: i32,
    from_id: i32,
    to_id: i32,
    target: Option<String>,
    text: String,
    now: Instant,
) -> Result<RecordOutcome, Fault> {
    let owns = registry
        .session(session_id)
        .map(|session| session.owns_object(from_id))
        .unwrap_or(false);
    if !owns {
        return Err(Fault::new(
            ERROR_OBJECT_SAYING,
            from_id,
            "Attempted to speak through an object you do not own.",
        ));
    }
    match parse_moderator_command(&text) {
        Ok(Some(command)) => return run_command(registry, session_id, from_id, command),
        Ok(None) => {}
        Err(message) => {
            reply(registry, session_id, from_id, message);
            return Ok(RecordOutcome::Handled);
        }
    }
    registry.say(session_id, from_id, to_id, target, text, now)?;
    Ok(RecordOutcome::Handled)
}

fn run_command(
    registry: &mut Registry,
    session_id: i32,
    from_id: i32,
    command: ModeratorCommand,
) -> Result<RecordOutcome, Fault> {
    match command {
        ModeratorCommand::Broadcast { password, universe } => {
            let world_name = registry
                .objects
                .get(&from_id)
                .map(|object| object.world_name.clone());
            let Some(world_name) = world_name else {
                reply(registry, session_id, from_id, "That object is not in any world.");
                return Ok(RecordOutcome::Handled);
            };
            let authorized = registry.is_privileged(session_id) || {
                let token = challenge(&password, &world_name);
                registry
                    .worlds
                    .get(&world_name)
                    .map(|world| {
                        world
                            .broadcast_password_tokens
                            .iter()
                            .any(|accepted| accepted == &token)
                    })
                    .unwrap_or(false)
            };
            if !authorized {
                reply(registry, session_id, from_id, "Wrong broadcast password.");
                return Ok(RecordOutcome::Handled);
            }
            let mode = if universe {
                BroadcastMode::Universe
            } else {
                BroadcastMode::World
            };
            if let Some(session) = registry.session_mut(session_id) {
                session.broadcast_mode = mode;
            }
            log_session(&format!(
                "Connection #{} broadcasting to {}",
                session_id,
                if universe { "the universe" } else { world_name.as_str() }
            ));
            reply(
                registry,
                session_id,
                from_id,
                if universe {
                    "Broadcasting to the universe."
                } else {
                    "Broadcasting to this world."
                },
            );
        }
        ModeratorCommand::Quiet => {
            if let Some(session) = registry.session_mut(session_id) {
                session.broadcast_mode = BroadcastMode::Off;
            }
            reply(registry, session_id, from_id, "No longer broadcasting.");
        }
        ModeratorCommand::Ignore { client_ident } => {
            let affected: Vec<i32> = registry
                .sessions
                .values()
                .filter(|other| other.client_ident == client_ident)
                .flat_map(|other| other.objects.iter().copied())
                .collect();
            if let Some(session) = registry.session_mut(session_id) {
                session.ignored_idents.insert(client_ident.clone());
                for object_id in affected {
                    dirty_own_edge(session, object_id, DIRTY_AVATAR | DIRTY_NICKNAME);
                }
            }
            reply(registry, session_id, from_id, format!("Ignoring {}.", client_ident));
        }
        ModeratorCommand::Unignore { client_ident } => {
            let affected: Vec<i32> = registry
                .sessions
                .values()
                .filter(|other| other.client_ident == client_ident)
                .flat_map(|other| other.objects.iter().copied())
                .collect();
            let removed = match registry.session_mut(session_id) {
                Some(session) => {
                    let removed = session.ignored_idents.remove(&client_ident);
                    if removed {
                        for object_id in affected {
                            dirty_own_edge(session, object_id, DIRTY_AVATAR | DIRTY_NICKNAME);
                        }
                    }
                    removed
                }
                None => false,
            };
            let text = if removed {
                format!("No longer ignoring {}.", client_ident)
            } else {
                format!("You were not ignoring {}.", client_ident)
            };
            reply(registry, session_id, from_id, text);
        }
        ModeratorCommand::Squelch { connection_id } => {
            if !may_squelch(registry, session_id) {
                reply(registry, session_id, from_id, "You may not squelch connections.");
                return Ok(RecordOutcome::Handled);
            }
            let text = if registry.set_squelched(connection_id, true) {
                log_session(&format!(
                    "Connection #{} squelched connection #{}",
                    session_id, connection_id
                ));
                format!("Squelched connection #{}.", connection_id)
            } else {
                format!("No connection #{}.", connection_id)
            };
            reply(registry, session_id, from_id, text);
        }
        ModeratorCommand::Unsquelch { connection_id } => {
            if !may_squelch(registry, session_id) {
                reply(registry, session_id, from_id, "You may not squelch connections.");
                return Ok(RecordOutcome::Handled);
            }
            let text = if registry.set_squelched(connection_id, false) {
                format!("Unsquelched connection #{}.", connection_id)
            } else {
                format!("No connection #{}.", connection_id)
            };
            reply(registry, session_id, from_id, text);
        }
        ModeratorCommand::ShowIds { enabled } => {
            let text = match registry.session_mut(session_id) {
                Some(session) => {
                    let target = enabled.unwrap_or(!session.show_identities);
                    session.show_identities = target;
                    let ids: Vec<i32> = session.observed.keys().copied().collect();
                    for object_id in ids {
                        dirty_own_edge(session, object_id, DIRTY_NICKNAME);
                    }
                    if target {
                        "Connection identities shown."
                    } else {
                        "Connection identities hidden."
                    }
                }
                None => return Ok(RecordOutcome::Handled),
            };
            reply(registry, session_id, from_id, text);
        }
        ModeratorCommand::SimpleAvatars { enabled } => {
            let text = match registry.session_mut(session_id) {
                Some(session) => {
                    let target = enabled.unwrap_or(!session.simple_avatars);
                    session.simple_avatars = target;
                    let ids: Vec<i32> = session.observed.keys().copied().collect();
                    for object_id in ids {
                        dirty_own_edge(session, object_id, DIRTY_AVATAR);
                    }
                    if target {
                        "Simple avatars on."
                    } else {
                        "Simple avatars off."
                    }
                }
                None => return Ok(RecordOutcome::Handled),
            };
            reply(registry, session_id, from_id, text);
        }
        ModeratorCommand::Reserve {
            world_name,
            instance_id,
            num_objects,
        } => {
            if !registry.is_privileged(session_id) {
                reply(registry, session_id, from_id, "You may not reserve instances.");
                return Ok(RecordOutcome::Handled);
            }
            let text = match registry.reserve_instance(&world_name, instance_id, num_objects) {
                Ok(reservation) => format!(
                    "Reservation {} covers {} object(s) in \"{}\":{}.",
                    reservation, num_objects, world_name, instance_id
                ),
                Err(message) => message,
            };
            reply(registry, session_id, from_id, text);
        }
        ModeratorCommand::Shutdown => {
            if !registry.is_privileged(session_id) {
                reply(registry, session_id, from_id, "You may not shut down the server.");
                return Ok(RecordOutcome::Handled);
            }
            log_session(&format!("Connection #{} requested shutdown", session_id));
            return Ok(RecordOutcome::Shutdown);
        }
        ModeratorCommand::Unknown(name) => {
            reply(registry, session_id, from_id, format!("Unknown command /{}.", name));
        }
    }
    Ok(RecordOutcome::Handled)
}

/// Moderator action records only arrive from privileged peers; a primary
/// server uses them to hand privileges and object associations to its
/// secondaries.
fn handle_moderator_action(
    registry: &mut Registry,
    session_id: i32,
    body: ModeratorActionRecord,
) -> Result<RecordOutcome, Fault> {
    if !registry.is_privileged(session_id) {
        return Err(Fault::general(
            "Moderator actions require a privileged login.",
        ));
    }
    match body.purpose {
        MODERATOR_PRIVILEGE => {
            let granted = registry.grant_privileges(&body.client_ident, &body.privileges);
            log_session(&format!(
                "Granted privileges \"{}\" to {} session(s) of {}",
                body.privileges, granted, body.client_ident
            ));
        }
        MODERATOR_ASSOCIATION => {
            log_world(&format!(
                "Object #{} associated with {} in \"{}\"",
                body.object_id, body.client_ident, body.world_name
            ));
        }
        purpose => log_net(&format!(
            "Ignoring moderator action with purpose {}",
            purpose
        )),
    }
    Ok(RecordOutcome::Handled)
}

fn may_squelch(registry: &Registry, session_id: i32) -> bool {
    registry.is_privileged(session_id)
        || registry
            .session(session_id)
            .map(|session| session.has_privilege("squelch"))
            .unwrap_or(false)
}

/// Command replies come from object zero, addressed at the speaking object,
/// and only ever land in the speaker's own outbox.
fn reply(registry: &mut Registry, session_id: i32, to_id: i32, text: impl Into<String>) {
    registry.push_record(
        session_id,
        Record::Say(SayRecord {
            from_id: 0,
            to_id,
            text: text.into(),
        }),
    );
}

fn dirty_own_edge(session: &mut Session, object_id: i32, bits: u8) {
    if let Some(edge) = session.observed.get_mut(&object_id) {
        if edge.dirty == 0 {
            session.dirty_queue.push_back(object_id);
        }
        edge.dirty |= bits;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::records::{
        ObjectsCreateV3Record, SayTargetedRecord, MODERATOR_DISSOCIATION,
    };
    use crate::settings::{BannedApp, ServerRole, ServerSettings, WorldSettings};
    use std::time::Duration;

    fn registry() -> Registry {
        Registry::new(ServerSettings::default(), ServerRole::Standalone)
    }

    fn client_version() -> VersionRecord {
        VersionRecord {
            version: 5,
            min_version: 5,
            app_name: "Probe".to_string(),
            app_version: 100,
            app_target: "test".to_string(),
            os: "test-os".to_string(),
        }
    }

    fn connect(registry: &mut Registry) -> i32 {
        registry
            .connect("10.1.1.1:40000".to_string(), Instant::now())
            .expect("connect")
    }

    fn negotiate(registry: &mut Registry, session_id: i32) {
        handle_record(
            registry,
            session_id,
            Record::Version(client_version()),
            Instant::now(),
        )
        .expect("negotiate");
        registry.take_outbox(session_id);
    }

    fn login_as(registry: &mut Registry, session_id: i32, user: &str, password: &str, ident: &str) {
        handle_record(
            registry,
            session_id,
            Record::Login(LoginRecord {
                user_name: user.to_string(),
                user_id: 0,
                password: password.to_string(),
                url: "http://example.net/room".to_string(),
                client_ident: ident.to_string(),
            }),
            Instant::now(),
        )
        .expect("login");
        registry.take_outbox(session_id);
    }

    fn guest(registry: &mut Registry, ident: &str) -> i32 {
        let session_id = connect(registry);
        negotiate(registry, session_id);
        login_as(registry, session_id, "guest", "guest", ident);
        session_id
    }

    fn create_record(owner: i32, world: &str, count: i32) -> Record {
        Record::ObjectsCreateV3(ObjectsCreateV3Record {
            owner,
            world_name: world.to_string(),
            reference: String::new(),
            page_url: String::new(),
            instance_id: 0,
            num_objects: count,
            coming_from: String::new(),
            cookie: 31,
        })
    }

    fn create_one(registry: &mut Registry, session_id: i32, world: &str) -> i32 {
        handle_record(
            registry,
            session_id,
            create_record(session_id, world, 1),
            Instant::now(),
        )
        .expect("create");
        let records = registry.take_outbox(session_id);
        records
            .iter()
            .find_map(|record| match record {
                Record::ObjectsCreateAck(body) => Some(body.objects[0]),
                _ => None,
            })
            .expect("creation ack")
    }

    fn say_record(from_id: i32, to_id: i32, text: &str) -> Record {
        Record::Say(SayRecord {
            from_id,
            to_id,
            text: text.to_string(),
        })
    }

    #[test]
    fn the_handshake_answers_with_the_server_version() {
        let mut registry = registry();
        let session_id = connect(&mut registry);
        let outcome = handle_record(
            &mut registry,
            session_id,
            Record::Version(client_version()),
            Instant::now(),
        )
        .expect("handshake");
        assert_eq!(outcome, RecordOutcome::Handled);

        let records = registry.take_outbox(session_id);
        match records.first() {
            Some(Record::Version(body)) => {
                assert_eq!(body.version, registry.settings.protocol_version_int());
                assert_eq!(body.app_name, registry.settings.product_name);
            }
            other => panic!("expected a version reply, got {:?}", other),
        }
        assert!(registry.session(session_id).expect("session").version.is_some());
    }

    #[test]
    fn peers_needing_a_newer_server_are_turned_away() {
        let mut registry = registry();
        let session_id = connect(&mut registry);
        let mut version = client_version();
        version.version = 7;
        version.min_version = 7;
        let fault = handle_record(
            &mut registry,
            session_id,
            Record::Version(version),
            Instant::now(),
        )
        .expect_err("too new");
        assert!(fault.message.contains("or newer"));
    }

    #[test]
    fn peers_stuck_on_an_older_protocol_are_turned_away() {
        let mut registry = registry();
        let session_id = connect(&mut registry);
        let mut version = client_version();
        version.version = 4;
        version.min_version = 1;
        let fault = handle_record(
            &mut registry,
            session_id,
            Record::Version(version),
            Instant::now(),
        )
        .expect_err("too old");
        assert!(fault.message.contains("up to"));
    }

    #[test]
    fn banned_app_builds_are_asked_to_upgrade() {
        let mut settings = ServerSettings::default();
        settings.banned_apps.push(BannedApp {
            app_name: "Probe".to_string(),
            app_version: 100,
        });
        let mut registry = Registry::new(settings, ServerRole::Standalone);
        let session_id = connect(&mut registry);
        let fault = handle_record(
            &mut registry,
            session_id,
            Record::Version(client_version()),
            Instant::now(),
        )
        .expect_err("banned");
        assert!(fault.message.contains("Please upgrade"));
    }

    #[test]
    fn records_before_the_handshake_are_fatal() {
        let mut registry = registry();
        let session_id = connect(&mut registry);
        let fault = handle_record(
            &mut registry,
            session_id,
            say_record(1, 1, "hello"),
            Instant::now(),
        )
        .expect_err("gate");
        assert!(fault.message.contains("before version negotiation"));
    }

    #[test]
    fn most_records_require_a_login() {
        let mut registry = registry();
        let session_id = connect(&mut registry);
        negotiate(&mut registry, session_id);
        let fault = handle_record(
            &mut registry,
            session_id,
            create_record(session_id, "plaza", 1),
            Instant::now(),
        )
        .expect_err("gate");
        assert!(fault.message.contains("before login"));
    }

    #[test]
    fn login_needs_credentials_and_an_identity() {
        let mut registry = registry();
        let session_id = connect(&mut registry);
        negotiate(&mut registry, session_id);
        let fault = handle_record(
            &mut registry,
            session_id,
            Record::Login(LoginRecord {
                user_name: "guest".to_string(),
                user_id: 0,
                password: String::new(),
                url: String::new(),
                client_ident: "ABC".to_string(),
            }),
            Instant::now(),
        )
        .expect_err("underspecified");
        assert_eq!(fault.message, "Underspecified login request.");
        assert_eq!(fault.code, ERROR_LOGIN);
    }

    #[test]
    fn a_known_user_gets_a_login_ack() {
        let mut registry = registry();
        let session_id = connect(&mut registry);
        negotiate(&mut registry, session_id);
        handle_record(
            &mut registry,
            session_id,
            Record::Login(LoginRecord {
                user_name: "guest".to_string(),
                user_id: 0,
                password: "guest".to_string(),
                url: String::new(),
                client_ident: "ABC".to_string(),
            }),
            Instant::now(),
        )
        .expect("login");

        let records = registry.take_outbox(session_id);
        match records.first() {
            Some(Record::LoginAck(body)) => {
                assert_eq!(body.user_name, "guest");
                assert_eq!(body.user_id, 100);
                assert_eq!(body.connection_id, session_id);
            }
            other => panic!("expected a login ack, got {:?}", other),
        }
        let session = registry.session(session_id).expect("session");
        assert!(session.logged_in);
        assert_eq!(session.client_ident, "ABC");
    }

    #[test]
    fn wrong_passwords_are_fatal() {
        let mut registry = registry();
        let session_id = connect(&mut registry);
        negotiate(&mut registry, session_id);
        let fault = handle_record(
            &mut registry,
            session_id,
            Record::Login(LoginRecord {
                user_name: "guest".to_string(),
                user_id: 0,
                password: "nope".to_string(),
                url: String::new(),
                client_ident: "ABC".to_string(),
            }),
            Instant::now(),
        )
        .expect_err("wrong password");
        assert_eq!(fault.message, "Unknown user or wrong password.");
    }

    #[test]
    fn banned_identities_cannot_log_in() {
        let mut settings = ServerSettings::default();
        settings.banned_client_idents.push("EVIL".to_string());
        let mut registry = Registry::new(settings, ServerRole::Standalone);
        let session_id = connect(&mut registry);
        negotiate(&mut registry, session_id);
        let fault = handle_record(
            &mut registry,
            session_id,
            Record::Login(LoginRecord {
                user_name: "guest".to_string(),
                user_id: 0,
                password: "guest".to_string(),
                url: String::new(),
                client_ident: "EVIL".to_string(),
            }),
            Instant::now(),
        )
        .expect_err("banned ident");
        assert!(fault.message.contains("banned"));
    }

    #[test]
    fn creation_acknowledges_then_snapshots_the_group() {
        let mut registry = registry();
        let session_id = guest(&mut registry, "ABC");
        handle_record(
            &mut registry,
            session_id,
            create_record(session_id, "plaza", 2),
            Instant::now(),
        )
        .expect("create");

        let records = registry.take_outbox(session_id);
        match &records[0] {
            Record::ObjectsCreateAck(body) => {
                assert_eq!(body.objects.len(), 2);
                assert_eq!(body.world_name, "plaza");
                assert_eq!(body.cookie, 31);
            }
            other => panic!("expected the creation ack first, got {:?}", other),
        }
        assert!(records.iter().any(|record| matches!(
            record,
            Record::GroupObserverAdded(body) if body.objects.len() == 2
        )));
    }

    #[test]
    fn speakers_hear_their_own_group_sayings() {
        let mut registry = registry();
        let session_id = guest(&mut registry, "ABC");
        let object_id = create_one(&mut registry, session_id, "plaza");
        let group_id = registry.objects[&object_id].instance_id;

        // Far enough from the creation stamp to clear the chat rate limit.
        let later = Instant::now() + Duration::from_millis(200);
        handle_record(
            &mut registry,
            session_id,
            say_record(object_id, group_id, "anyone here?"),
            later,
        )
        .expect("say");
        let records = registry.take_outbox(session_id);
        assert!(records.iter().any(|record| matches!(
            record,
            Record::Say(body) if body.text == "anyone here?" && body.from_id == object_id
        )));
    }

    #[test]
    fn whisper_records_carry_their_target_through() {
        let mut registry = registry();
        let speaker = guest(&mut registry, "AAA");
        let listener = guest(&mut registry, "BBB");
        let spoken = create_one(&mut registry, speaker, "plaza");
        let heard = create_one(&mut registry, listener, "plaza");
        registry.take_outbox(speaker);
        registry.take_outbox(listener);

        let later = Instant::now() + Duration::from_millis(200);
        handle_record(
            &mut registry,
            speaker,
            Record::SayTargeted(SayTargetedRecord {
                from_id: spoken,
                to_id: heard,
                target: "aside".to_string(),
                text: "psst".to_string(),
            }),
            later,
        )
        .expect("whisper");
        let records = registry.take_outbox(listener);
        assert!(records.iter().any(|record| matches!(
            record,
            Record::SayTargeted(body) if body.target == "aside" && body.text == "psst"
        )));
    }

    #[test]
    fn command_replies_come_from_object_zero() {
        let mut registry = registry();
        let session_id = guest(&mut registry, "ABC");
        let object_id = create_one(&mut registry, session_id, "plaza");

        handle_record(
            &mut registry,
            session_id,
            say_record(object_id, object_id, "/dance"),
            Instant::now(),
        )
        .expect("unknown command");
        let records = registry.take_outbox(session_id);
        match records.first() {
            Some(Record::Say(body)) => {
                assert_eq!(body.from_id, 0);
                assert_eq!(body.to_id, object_id);
                assert!(body.text.contains("Unknown command /dance"));
            }
            other => panic!("expected a command reply, got {:?}", other),
        }
    }

    #[test]
    fn malformed_commands_report_usage_without_closing() {
        let mut registry = registry();
        let session_id = guest(&mut registry, "ABC");
        let object_id = create_one(&mut registry, session_id, "plaza");

        let outcome = handle_record(
            &mut registry,
            session_id,
            say_record(object_id, object_id, "/squelch Bob"),
            Instant::now(),
        )
        .expect("recoverable");
        assert_eq!(outcome, RecordOutcome::Handled);
        let records = registry.take_outbox(session_id);
        assert!(records.iter().any(|record| matches!(
            record,
            Record::Say(body) if body.from_id == 0 && body.text.contains("expected a number")
        )));
    }

    #[test]
    fn shutdown_is_reserved_for_privileged_users() {
        let mut registry = registry();
        let session_id = guest(&mut registry, "ABC");
        let object_id = create_one(&mut registry, session_id, "plaza");
        let outcome = handle_record(
            &mut registry,
            session_id,
            say_record(object_id, object_id, "/shutdown"),
            Instant::now(),
        )
        .expect("denied");
        assert_eq!(outcome, RecordOutcome::Handled);

        let god = connect(&mut registry);
        negotiate(&mut registry, god);
        login_as(&mut registry, god, "god", "changeme-god", "GOD");
        let hammer = create_one(&mut registry, god, "plaza");
        let outcome = handle_record(
            &mut registry,
            god,
            say_record(hammer, hammer, "/shutdown"),
            Instant::now(),
        )
        .expect("granted");
        assert_eq!(outcome, RecordOutcome::Shutdown);
    }

    #[test]
    fn the_broadcast_password_unlocks_broadcasting() {
        let mut settings = ServerSettings::default();
        settings.worlds.insert(
            "plaza".to_string(),
            WorldSettings {
                max_objects: None,
                approved_avatars: Vec::new(),
                default_avatar: None,
                broadcast_password_tokens: vec![challenge("sesame", "plaza")],
            },
        );
        let mut registry = Registry::new(settings, ServerRole::Standalone);
        let session_id = guest(&mut registry, "ABC");
        let object_id = create_one(&mut registry, session_id, "plaza");

        handle_record(
            &mut registry,
            session_id,
            say_record(object_id, object_id, "/broadcast wrong"),
            Instant::now(),
        )
        .expect("denied");
        assert_eq!(
            registry.session(session_id).expect("session").broadcast_mode,
            BroadcastMode::Off
        );

        handle_record(
            &mut registry,
            session_id,
            say_record(object_id, object_id, "/broadcast sesame"),
            Instant::now(),
        )
        .expect("accepted");
        assert_eq!(
            registry.session(session_id).expect("session").broadcast_mode,
            BroadcastMode::World
        );
    }

    #[test]
    fn privilege_grants_follow_the_client_identity() {
        let mut registry = registry();
        let target = guest(&mut registry, "SHARED");
        let god = connect(&mut registry);
        negotiate(&mut registry, god);
        login_as(&mut registry, god, "god", "changeme-god", "GOD");

        handle_record(
            &mut registry,
            god,
            Record::ModeratorAction(ModeratorActionRecord {
                purpose: MODERATOR_PRIVILEGE,
                client_ident: "SHARED".to_string(),
                world_name: String::new(),
                privileges: "squelch".to_string(),
                expiration: 0,
                object_id: 0,
                flags: 0,
            }),
            Instant::now(),
        )
        .expect("grant");
        assert!(registry
            .session(target)
            .expect("target")
            .has_privilege("squelch"));

        // The grant lets the holder squelch without full privileges.
        let mouth = create_one(&mut registry, target, "plaza");
        handle_record(
            &mut registry,
            target,
            say_record(mouth, mouth, &format!("/squelch {}", target)),
            Instant::now(),
        )
        .expect("squelch");
        assert!(registry.session(target).expect("target").squelched);
    }

    #[test]
    fn moderator_actions_from_unprivileged_peers_are_fatal() {
        let mut registry = registry();
        let session_id = guest(&mut registry, "ABC");
        let fault = handle_record(
            &mut registry,
            session_id,
            Record::ModeratorAction(ModeratorActionRecord {
                purpose: MODERATOR_DISSOCIATION,
                client_ident: "ABC".to_string(),
                world_name: String::new(),
                privileges: String::new(),
                expiration: 0,
                object_id: 0,
                flags: 0,
            }),
            Instant::now(),
        )
        .expect_err("unprivileged");
        assert!(fault.message.contains("privileged"));
    }

    #[test]
    fn dropping_a_group_unsubscribes_its_members() {
        let mut registry = registry();
        let owner = guest(&mut registry, "AAA");
        let watcher = guest(&mut registry, "BBB");
        let object_id = create_one(&mut registry, owner, "plaza");
        let group_id = registry.objects[&object_id].instance_id;
        let (world_name, index) = registry.find_group(group_id).expect("group");
        registry.group_add_observer(&world_name, index, watcher);
        registry.take_outbox(watcher);

        handle_record(
            &mut registry,
            watcher,
            Record::GroupDropObserver(crate::net::records::GroupDropObserverRecord { group_id }),
            Instant::now(),
        )
        .expect("drop");
        let session = registry.session(watcher).expect("watcher");
        assert!(session.observed.is_empty());
        assert!(!session.observes_group(group_id));
        let records = registry.take_outbox(watcher);
        assert!(records.iter().any(|record| matches!(
            record,
            Record::GroupObserverRemoved(body) if body.group_id == group_id
        )));
    }

    #[test]
    fn toggling_identity_display_refreshes_nicknames() {
        let mut registry = registry();
        let owner = guest(&mut registry, "AAA");
        let watcher = guest(&mut registry, "BBB");
        let object_id = create_one(&mut registry, owner, "plaza");
        let mouth = create_one(&mut registry, watcher, "plaza");
        registry
            .set_nickname(owner, object_id, "someone".to_string())
            .expect("nickname");
        registry.flush_updates();
        registry.take_outbox(watcher);

        handle_record(
            &mut registry,
            watcher,
            say_record(mouth, mouth, "/showids on"),
            Instant::now(),
        )
        .expect("toggle");
        registry.take_outbox(watcher);
        registry.flush_updates();
        let records = registry.take_outbox(watcher);
        let expected = format!("someone[{}]", object_id);
        assert!(records.iter().any(|record| matches!(
            record,
            Record::ObjectNickname(body) if body.nickname == expected
        )));
    }

    #[test]
    fn unhandled_record_types_are_ignored() {
        let mut registry = registry();
        let session_id = guest(&mut registry, "ABC");
        let outcome = handle_record(
            &mut registry,
            session_id,
            Record::LoginAck(LoginAckRecord {
                user_name: "guest".to_string(),
                user_id: 100,
                connection_id: session_id,
            }),
            Instant::now(),
        )
        .expect("ignored");
        assert_eq!(outcome, RecordOutcome::Handled);
        assert!(registry.session(session_id).expect("session").kill.is_none());
    }
}
