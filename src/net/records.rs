use std::fmt;

use crate::net::packet::{count_width, PacketReader, PacketWriter};

pub const TYPE_ERROR: i32 = 1;
pub const TYPE_VERSION: i32 = 3;
pub const TYPE_LOGIN: i32 = 4;
pub const TYPE_LOGIN_ACK: i32 = 5;
pub const TYPE_OBJECTS_CREATE_ACK: i32 = 7;
pub const TYPE_OBJECTS_DESTROY: i32 = 8;
pub const TYPE_ADD_OBJECT: i32 = 9;
pub const TYPE_REMOVE_OBJECT: i32 = 10;
pub const TYPE_GROUP_DROP_OBSERVER: i32 = 12;
pub const TYPE_GROUP_OBSERVER_ADDED: i32 = 13;
pub const TYPE_GROUP_OBSERVER_REMOVED: i32 = 14;
pub const TYPE_OBJECT_AVATAR: i32 = 17;
pub const TYPE_OBJECT_POSITION: i32 = 18;
pub const TYPE_OBJECT_NICKNAME: i32 = 19;
pub const TYPE_SAY: i32 = 20;
pub const TYPE_SAY_TARGETED: i32 = 23;
pub const TYPE_MODERATOR_ACTION: i32 = 25;
pub const TYPE_OBJECTS_CREATE_V2: i32 = 32;
pub const TYPE_ADD_OBJECT_WITH_NAME: i32 = 33;
pub const TYPE_BROADCAST: i32 = 34;
pub const TYPE_OBJECTS_CREATE_V3: i32 = 40;

pub const ERROR_GENERAL: i32 = 0;
pub const ERROR_LOGIN: i32 = 1;
pub const ERROR_OBJECT_CREATION: i32 = 3;
pub const ERROR_OBJECT_DESTRUCTION: i32 = 4;
pub const ERROR_OBJECT_AVATAR: i32 = 5;
pub const ERROR_OBJECT_POSITION: i32 = 6;
pub const ERROR_GROUP_OBSERVER_REMOVAL: i32 = 7;
pub const ERROR_OBJECT_NICKNAME: i32 = 8;
pub const ERROR_OBJECT_SAYING: i32 = 9;

pub const MODERATOR_PRIVILEGE: i32 = 0;
pub const MODERATOR_ASSOCIATION: i32 = 1;
pub const MODERATOR_DISSOCIATION: i32 = 2;

pub const MAX_ERROR_MESSAGE: usize = 250;
pub const MAX_USER_NAME: usize = 50;
pub const MAX_PASSWORD: usize = 50;
pub const MAX_APP_NAME: usize = 50;
pub const MAX_APP_TARGET: usize = 20;
pub const MAX_OS_NAME: usize = 100;
pub const MAX_SHORT_STRING: usize = 254;
pub const MAX_NICKNAME: usize = 40;
pub const MAX_SAY_TEXT: usize = 1024;
pub const MAX_BROADCAST_INFO: usize = 2048;

pub const POSITION_REALS: usize = 6;

/// Frame layout: a four-byte little-endian length counting everything after
/// itself, the record type id, one pad byte, then the fields. The pad byte
/// is always written as 1 and never inspected on read.
const FRAME_PAD: u8 = 1;
const MIN_FRAME_LEN: i32 = 5;
pub const MAX_FRAME_BYTES: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    UnknownType(i32),
    FrameLength(i32),
    MissingField {
        record: &'static str,
        field: &'static str,
    },
    OversizedField {
        record: &'static str,
        field: &'static str,
        count: usize,
        max: usize,
    },
    BadElementCount {
        record: &'static str,
        field: &'static str,
        count: i32,
    },
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireError::UnknownType(type_id) => write!(f, "unknown record type {}", type_id),
            WireError::FrameLength(len) => write!(f, "unreasonable frame length {}", len),
            WireError::MissingField { record, field } => {
                write!(f, "{} record ends before field '{}'", record, field)
            }
            WireError::OversizedField {
                record,
                field,
                count,
                max,
            } => write!(
                f,
                "{} record field '{}' counts {} bytes (limit {})",
                record, field, count, max
            ),
            WireError::BadElementCount {
                record,
                field,
                count,
            } => write!(
                f,
                "{} record field '{}' declares {} elements",
                record, field, count
            ),
        }
    }
}

/// A request that cannot be honored. Carried back to the peer as an Error
/// record; every fault except the transient chat overflow also ends the
/// connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    pub code: i32,
    pub subject: i32,
    pub message: String,
}

impl Fault {
    pub fn new(code: i32, subject: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            subject,
            message: message.into(),
        }
    }

    pub fn general(message: impl Into<String>) -> Self {
        Self::new(ERROR_GENERAL, 0, message)
    }

    pub fn to_record(&self) -> Record {
        Record::Error(ErrorRecord {
            code: self.code,
            subject: self.subject,
            message: self.message.clone(),
        })
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fault {} on #{}: {}", self.code, self.subject, self.message)
    }
}

impl From<WireError> for Fault {
    fn from(err: WireError) -> Self {
        Fault::general(format!("Malformed record: {}.", err))
    }
}

pub fn pretty_version(value: i32) -> String {
    format!("{}.{}", value / 100, value % 100)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorRecord {
    pub code: i32,
    pub subject: i32,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionRecord {
    pub version: i32,
    pub min_version: i32,
    pub app_name: String,
    pub app_version: i32,
    pub app_target: String,
    pub os: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginRecord {
    pub user_name: String,
    pub user_id: i32,
    pub password: String,
    pub url: String,
    pub client_ident: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginAckRecord {
    pub user_name: String,
    pub user_id: i32,
    pub connection_id: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectsCreateAckRecord {
    pub owner: i32,
    pub world_name: String,
    pub instance_id: i32,
    pub objects: Vec<i32>,
    pub cookie: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectsDestroyRecord {
    pub objects: Vec<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddObjectRecord {
    pub group_id: i32,
    pub object_id: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoveObjectRecord {
    pub group_id: i32,
    pub object_id: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupDropObserverRecord {
    pub group_id: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupObserverAddedRecord {
    pub group_id: i32,
    pub objects: Vec<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupObserverRemovedRecord {
    pub group_id: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectAvatarRecord {
    pub object_id: i32,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObjectPositionRecord {
    pub object_id: i32,
    /// Three position reals followed by three orientation reals.
    pub position: [f64; POSITION_REALS],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectNicknameRecord {
    pub object_id: i32,
    pub nickname: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SayRecord {
    pub from_id: i32,
    pub to_id: i32,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SayTargetedRecord {
    pub from_id: i32,
    pub to_id: i32,
    pub target: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModeratorActionRecord {
    pub purpose: i32,
    pub client_ident: String,
    pub world_name: String,
    pub privileges: String,
    pub expiration: i32,
    pub object_id: i32,
    pub flags: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectsCreateV2Record {
    pub owner: i32,
    pub world_name: String,
    pub reference: String,
    pub instance_id: i32,
    pub num_objects: i32,
    pub coming_from: String,
    pub cookie: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddObjectWithNameRecord {
    pub group_id: i32,
    pub object_id: i32,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastRecord {
    pub client_ident: String,
    pub world_name: String,
    pub info: String,
    pub object_id: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectsCreateV3Record {
    pub owner: i32,
    pub world_name: String,
    pub reference: String,
    pub page_url: String,
    pub instance_id: i32,
    pub num_objects: i32,
    pub coming_from: String,
    pub cookie: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Error(ErrorRecord),
    Version(VersionRecord),
    Login(LoginRecord),
    LoginAck(LoginAckRecord),
    ObjectsCreateAck(ObjectsCreateAckRecord),
    ObjectsDestroy(ObjectsDestroyRecord),
    AddObject(AddObjectRecord),
    RemoveObject(RemoveObjectRecord),
    GroupDropObserver(GroupDropObserverRecord),
    GroupObserverAdded(GroupObserverAddedRecord),
    GroupObserverRemoved(GroupObserverRemovedRecord),
    ObjectAvatar(ObjectAvatarRecord),
    ObjectPosition(ObjectPositionRecord),
    ObjectNickname(ObjectNicknameRecord),
    Say(SayRecord),
    SayTargeted(SayTargetedRecord),
    ModeratorAction(ModeratorActionRecord),
    ObjectsCreateV2(ObjectsCreateV2Record),
    AddObjectWithName(AddObjectWithNameRecord),
    Broadcast(BroadcastRecord),
    ObjectsCreateV3(ObjectsCreateV3Record),
}

impl Record {
    pub fn type_id(&self) -> i32 {
        match self {
            Record::Error(_) => TYPE_ERROR,
            Record::Version(_) => TYPE_VERSION,
            Record::Login(_) => TYPE_LOGIN,
            Record::LoginAck(_) => TYPE_LOGIN_ACK,
            Record::ObjectsCreateAck(_) => TYPE_OBJECTS_CREATE_ACK,
            Record::ObjectsDestroy(_) => TYPE_OBJECTS_DESTROY,
            Record::AddObject(_) => TYPE_ADD_OBJECT,
            Record::RemoveObject(_) => TYPE_REMOVE_OBJECT,
            Record::GroupDropObserver(_) => TYPE_GROUP_DROP_OBSERVER,
            Record::GroupObserverAdded(_) => TYPE_GROUP_OBSERVER_ADDED,
            Record::GroupObserverRemoved(_) => TYPE_GROUP_OBSERVER_REMOVED,
            Record::ObjectAvatar(_) => TYPE_OBJECT_AVATAR,
            Record::ObjectPosition(_) => TYPE_OBJECT_POSITION,
            Record::ObjectNickname(_) => TYPE_OBJECT_NICKNAME,
            Record::Say(_) => TYPE_SAY,
            Record::SayTargeted(_) => TYPE_SAY_TARGETED,
            Record::ModeratorAction(_) => TYPE_MODERATOR_ACTION,
            Record::ObjectsCreateV2(_) => TYPE_OBJECTS_CREATE_V2,
            Record::AddObjectWithName(_) => TYPE_ADD_OBJECT_WITH_NAME,
            Record::Broadcast(_) => TYPE_BROADCAST,
            Record::ObjectsCreateV3(_) => TYPE_OBJECTS_CREATE_V3,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Record::Error(_) => "Error",
            Record::Version(_) => "Version",
            Record::Login(_) => "Login",
            Record::LoginAck(_) => "LoginAck",
            Record::ObjectsCreateAck(_) => "ObjectsCreateAck",
            Record::ObjectsDestroy(_) => "ObjectsDestroy",
            Record::AddObject(_) => "AddObject",
            Record::RemoveObject(_) => "RemoveObject",
            Record::GroupDropObserver(_) => "GroupDropObserver",
            Record::GroupObserverAdded(_) => "GroupObserverAdded",
            Record::GroupObserverRemoved(_) => "GroupObserverRemoved",
            Record::ObjectAvatar(_) => "ObjectAvatar",
            Record::ObjectPosition(_) => "ObjectPosition",
            Record::ObjectNickname(_) => "ObjectNickname",
            Record::Say(_) => "Say",
            Record::SayTargeted(_) => "SayTargeted",
            Record::ModeratorAction(_) => "ModeratorAction",
            Record::ObjectsCreateV2(_) => "ObjectsCreate",
            Record::AddObjectWithName(_) => "AddObjectWithName",
            Record::Broadcast(_) => "Broadcast",
            Record::ObjectsCreateV3(_) => "ObjectsCreate",
        }
    }

    /// Version must be negotiated before any record other than Version
    /// itself is accepted.
    pub fn requires_version(&self) -> bool {
        !matches!(self, Record::Version(_))
    }

    /// Everything past the handshake pair requires a completed login.
    pub fn requires_login(&self) -> bool {
        !matches!(
            self,
            Record::Version(_) | Record::Login(_) | Record::Error(_)
        )
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut body = PacketWriter::with_capacity(64);
        body.write_i32_le(self.type_id());
        body.write_u8(FRAME_PAD);
        self.write_fields(&mut body);
        let mut frame = PacketWriter::with_capacity(body.len() + 4);
        frame.write_i32_le(body.len() as i32);
        frame.write_bytes(body.as_slice());
        frame.into_vec()
    }

    /// Attempts to decode one frame from the front of `buffer`. Returns
    /// `Ok(None)` when more bytes are needed, otherwise the record and the
    /// number of bytes consumed. Bytes between the last read field and the
    /// declared frame end are tolerated; fields running past the frame end
    /// are not.
    pub fn decode(buffer: &[u8]) -> Result<Option<(Record, usize)>, WireError> {
        let mut prefix = PacketReader::new(buffer);
        let declared = match prefix.read_i32_le() {
            Some(value) => value,
            None => return Ok(None),
        };
        if declared < MIN_FRAME_LEN || declared as usize > MAX_FRAME_BYTES {
            return Err(WireError::FrameLength(declared));
        }
        let total = 4 + declared as usize;
        if buffer.len() < total {
            return Ok(None);
        }
        let mut reader = PacketReader::new(&buffer[4..total]);
        let type_id = match reader.read_i32_le() {
            Some(value) => value,
            None => return Err(WireError::FrameLength(declared)),
        };
        if reader.skip(1).is_none() {
            return Err(WireError::FrameLength(declared));
        }
        let record = Self::read_fields(type_id, &mut reader)?;
        Ok(Some((record, total)))
    }

    fn write_fields(&self, writer: &mut PacketWriter) {
        match self {
            Record::Error(r) => {
                writer.write_i32_le(r.code);
                writer.write_i32_le(r.subject);
                writer.write_string_bounded(&r.message, MAX_ERROR_MESSAGE);
            }
            Record::Version(r) => {
                writer.write_i32_le(r.version);
                writer.write_i32_le(r.min_version);
                writer.write_string_bounded(&r.app_name, MAX_APP_NAME);
                writer.write_i32_le(r.app_version);
                writer.write_string_bounded(&r.app_target, MAX_APP_TARGET);
                writer.write_string_bounded(&r.os, MAX_OS_NAME);
            }
            Record::Login(r) => {
                writer.write_string_bounded(&r.user_name, MAX_USER_NAME);
                writer.write_i32_le(r.user_id);
                writer.write_string_bounded(&r.password, MAX_PASSWORD);
                writer.write_string_bounded(&r.url, MAX_SHORT_STRING);
                writer.write_string_bounded(&r.client_ident, MAX_SHORT_STRING);
            }
            Record::LoginAck(r) => {
                writer.write_string_bounded(&r.user_name, MAX_USER_NAME);
                writer.write_i32_le(r.user_id);
                writer.write_i32_le(r.connection_id);
            }
            Record::ObjectsCreateAck(r) => {
                writer.write_i32_le(r.owner);
                writer.write_string_bounded(&r.world_name, MAX_SHORT_STRING);
                writer.write_i32_le(r.instance_id);
                write_id_array(writer, &r.objects);
                writer.write_i32_le(r.cookie);
            }
            Record::ObjectsDestroy(r) => {
                write_id_array(writer, &r.objects);
            }
            Record::AddObject(r) => {
                writer.write_i32_le(r.group_id);
                writer.write_i32_le(r.object_id);
            }
            Record::RemoveObject(r) => {
                writer.write_i32_le(r.group_id);
                writer.write_i32_le(r.object_id);
            }
            Record::GroupDropObserver(r) => {
                writer.write_i32_le(r.group_id);
            }
            Record::GroupObserverAdded(r) => {
                writer.write_i32_le(r.group_id);
                write_id_array(writer, &r.objects);
            }
            Record::GroupObserverRemoved(r) => {
                writer.write_i32_le(r.group_id);
            }
            Record::ObjectAvatar(r) => {
                writer.write_i32_le(r.object_id);
                writer.write_string_bounded(&r.url, MAX_SHORT_STRING);
            }
            Record::ObjectPosition(r) => {
                writer.write_i32_le(r.object_id);
                for real in &r.position {
                    writer.write_f64_le(*real);
                }
            }
            Record::ObjectNickname(r) => {
                writer.write_i32_le(r.object_id);
                writer.write_string_bounded(&r.nickname, MAX_NICKNAME);
            }
            Record::Say(r) => {
                writer.write_i32_le(r.from_id);
                writer.write_i32_le(r.to_id);
                writer.write_string_bounded(&r.text, MAX_SAY_TEXT);
            }
            Record::SayTargeted(r) => {
                writer.write_i32_le(r.from_id);
                writer.write_i32_le(r.to_id);
                writer.write_string_bounded(&r.target, MAX_SHORT_STRING);
                writer.write_string_bounded(&r.text, MAX_SAY_TEXT);
            }
            Record::ModeratorAction(r) => {
                writer.write_i32_le(r.purpose);
                writer.write_string_bounded(&r.client_ident, MAX_SHORT_STRING);
                writer.write_string_bounded(&r.world_name, MAX_SHORT_STRING);
                writer.write_string_bounded(&r.privileges, MAX_SHORT_STRING);
                writer.write_i32_le(r.expiration);
                writer.write_i32_le(r.object_id);
                writer.write_i32_le(r.flags);
            }
            Record::ObjectsCreateV2(r) => {
                writer.write_i32_le(r.owner);
                writer.write_string_bounded(&r.world_name, MAX_SHORT_STRING);
                writer.write_string_bounded(&r.reference, MAX_SHORT_STRING);
                writer.write_i32_le(r.instance_id);
                writer.write_i32_le(r.num_objects);
                writer.write_string_bounded(&r.coming_from, MAX_SHORT_STRING);
                writer.write_i32_le(r.cookie);
            }
            Record::AddObjectWithName(r) => {
                writer.write_i32_le(r.group_id);
                writer.write_i32_le(r.object_id);
                writer.write_string_bounded(&r.name, MAX_SHORT_STRING);
            }
            Record::Broadcast(r) => {
                writer.write_string_bounded(&r.client_ident, MAX_SHORT_STRING);
                writer.write_string_bounded(&r.world_name, MAX_SHORT_STRING);
                writer.write_string_bounded(&r.info, MAX_BROADCAST_INFO);
                writer.write_i32_le(r.object_id);
            }
            Record::ObjectsCreateV3(r) => {
                writer.write_i32_le(r.owner);
                writer.write_string_bounded(&r.world_name, MAX_SHORT_STRING);
                writer.write_string_bounded(&r.reference, MAX_SHORT_STRING);
                writer.write_string_bounded(&r.page_url, MAX_SHORT_STRING);
                writer.write_i32_le(r.instance_id);
                writer.write_i32_le(r.num_objects);
                writer.write_string_bounded(&r.coming_from, MAX_SHORT_STRING);
                writer.write_i32_le(r.cookie);
            }
        }
    }

    fn read_fields(type_id: i32, reader: &mut PacketReader) -> Result<Record, WireError> {
        match type_id {
            TYPE_ERROR => Ok(Record::Error(ErrorRecord {
                code: read_int(reader, "Error", "code")?,
                subject: read_int(reader, "Error", "subject")?,
                message: read_string(reader, MAX_ERROR_MESSAGE, "Error", "message")?,
            })),
            TYPE_VERSION => Ok(Record::Version(VersionRecord {
                version: read_int(reader, "Version", "version")?,
                min_version: read_int(reader, "Version", "minVersion")?,
                app_name: read_string(reader, MAX_APP_NAME, "Version", "appName")?,
                app_version: read_int(reader, "Version", "appVersion")?,
                app_target: read_string(reader, MAX_APP_TARGET, "Version", "appTarget")?,
                os: read_string(reader, MAX_OS_NAME, "Version", "os")?,
            })),
            TYPE_LOGIN => Ok(Record::Login(LoginRecord {
                user_name: read_string(reader, MAX_USER_NAME, "Login", "userName")?,
                user_id: read_int(reader, "Login", "userId")?,
                password: read_string(reader, MAX_PASSWORD, "Login", "password")?,
                url: read_string(reader, MAX_SHORT_STRING, "Login", "url")?,
                client_ident: read_string(reader, MAX_SHORT_STRING, "Login", "clientIdent")?,
            })),
            TYPE_LOGIN_ACK => Ok(Record::LoginAck(LoginAckRecord {
                user_name: read_string(reader, MAX_USER_NAME, "LoginAck", "userName")?,
                user_id: read_int(reader, "LoginAck", "userId")?,
                connection_id: read_int(reader, "LoginAck", "connectionId")?,
            })),
            TYPE_OBJECTS_CREATE_ACK => Ok(Record::ObjectsCreateAck(ObjectsCreateAckRecord {
                owner: read_int(reader, "ObjectsCreateAck", "owner")?,
                world_name: read_string(reader, MAX_SHORT_STRING, "ObjectsCreateAck", "worldName")?,
                instance_id: read_int(reader, "ObjectsCreateAck", "instanceId")?,
                objects: read_id_array(reader, "ObjectsCreateAck", "objects")?,
                cookie: read_int(reader, "ObjectsCreateAck", "cookie")?,
            })),
            TYPE_OBJECTS_DESTROY => Ok(Record::ObjectsDestroy(ObjectsDestroyRecord {
                objects: read_id_array(reader, "ObjectsDestroy", "objects")?,
            })),
            TYPE_ADD_OBJECT => Ok(Record::AddObject(AddObjectRecord {
                group_id: read_int(reader, "AddObject", "groupId")?,
                object_id: read_int(reader, "AddObject", "objectId")?,
            })),
            TYPE_REMOVE_OBJECT => Ok(Record::RemoveObject(RemoveObjectRecord {
                group_id: read_int(reader, "RemoveObject", "groupId")?,
                object_id: read_int(reader, "RemoveObject", "objectId")?,
            })),
            TYPE_GROUP_DROP_OBSERVER => Ok(Record::GroupDropObserver(GroupDropObserverRecord {
                group_id: read_int(reader, "GroupDropObserver", "groupId")?,
            })),
            TYPE_GROUP_OBSERVER_ADDED => Ok(Record::GroupObserverAdded(GroupObserverAddedRecord {
                group_id: read_int(reader, "GroupObserverAdded", "groupId")?,
                objects: read_id_array(reader, "GroupObserverAdded", "objects")?,
            })),
            TYPE_GROUP_OBSERVER_REMOVED => {
                Ok(Record::GroupObserverRemoved(GroupObserverRemovedRecord {
                    group_id: read_int(reader, "GroupObserverRemoved", "groupId")?,
                }))
            }
            TYPE_OBJECT_AVATAR => Ok(Record::ObjectAvatar(ObjectAvatarRecord {
                object_id: read_int(reader, "ObjectAvatar", "objectId")?,
                url: read_string(reader, MAX_SHORT_STRING, "ObjectAvatar", "url")?,
            })),
            TYPE_OBJECT_POSITION => {
                let object_id = read_int(reader, "ObjectPosition", "objectId")?;
                let mut position = [0.0; POSITION_REALS];
                for real in position.iter_mut() {
                    *real = reader.read_f64_le().ok_or(WireError::MissingField {
                        record: "ObjectPosition",
                        field: "position",
                    })?;
                }
                Ok(Record::ObjectPosition(ObjectPositionRecord {
                    object_id,
                    position,
                }))
            }
            TYPE_OBJECT_NICKNAME => Ok(Record::ObjectNickname(ObjectNicknameRecord {
                object_id: read_int(reader, "ObjectNickname", "objectId")?,
                nickname: read_string(reader, MAX_NICKNAME, "ObjectNickname", "nickname")?,
            })),
            TYPE_SAY => Ok(Record::Say(SayRecord {
                from_id: read_int(reader, "Say", "fromId")?,
                to_id: read_int(reader, "Say", "toId")?,
                text: read_string(reader, MAX_SAY_TEXT, "Say", "text")?,
            })),
            TYPE_SAY_TARGETED => Ok(Record::SayTargeted(SayTargetedRecord {
                from_id: read_int(reader, "SayTargeted", "fromId")?,
                to_id: read_int(reader, "SayTargeted", "toId")?,
                target: read_string(reader, MAX_SHORT_STRING, "SayTargeted", "target")?,
                text: read_string(reader, MAX_SAY_TEXT, "SayTargeted", "text")?,
            })),
            TYPE_MODERATOR_ACTION => Ok(Record::ModeratorAction(ModeratorActionRecord {
                purpose: read_int(reader, "ModeratorAction", "purpose")?,
                client_ident: read_string(
                    reader,
                    MAX_SHORT_STRING,
                    "ModeratorAction",
                    "clientIdent",
                )?,
                world_name: read_string(reader, MAX_SHORT_STRING, "ModeratorAction", "worldName")?,
                privileges: read_string(reader, MAX_SHORT_STRING, "ModeratorAction", "privileges")?,
                expiration: read_int(reader, "ModeratorAction", "expiration")?,
                object_id: read_int(reader, "ModeratorAction", "objectId")?,
                flags: read_int(reader, "ModeratorAction", "flags")?,
            })),
            TYPE_OBJECTS_CREATE_V2 => Ok(Record::ObjectsCreateV2(ObjectsCreateV2Record {
                owner: read_int(reader, "ObjectsCreate", "owner")?,
                world_name: read_string(reader, MAX_SHORT_STRING, "ObjectsCreate", "worldName")?,
                reference: read_string(reader, MAX_SHORT_STRING, "ObjectsCreate", "reference")?,
                instance_id: read_int(reader, "ObjectsCreate", "instanceId")?,
                num_objects: read_int(reader, "ObjectsCreate", "numObjects")?,
                coming_from: read_string(reader, MAX_SHORT_STRING, "ObjectsCreate", "comingFrom")?,
                cookie: read_int(reader, "ObjectsCreate", "cookie")?,
            })),
            TYPE_ADD_OBJECT_WITH_NAME => Ok(Record::AddObjectWithName(AddObjectWithNameRecord {
                group_id: read_int(reader, "AddObjectWithName", "groupId")?,
                object_id: read_int(reader, "AddObjectWithName", "objectId")?,
                name: read_string(reader, MAX_SHORT_STRING, "AddObjectWithName", "name")?,
            })),
            TYPE_BROADCAST => Ok(Record::Broadcast(BroadcastRecord {
                client_ident: read_string(reader, MAX_SHORT_STRING, "Broadcast", "clientIdent")?,
                world_name: read_string(reader, MAX_SHORT_STRING, "Broadcast", "worldName")?,
                info: read_string(reader, MAX_BROADCAST_INFO, "Broadcast", "info")?,
                object_id: read_int(reader, "Broadcast", "objectId")?,
            })),
            TYPE_OBJECTS_CREATE_V3 => Ok(Record::ObjectsCreateV3(ObjectsCreateV3Record {
                owner: read_int(reader, "ObjectsCreate", "owner")?,
                world_name: read_string(reader, MAX_SHORT_STRING, "ObjectsCreate", "worldName")?,
                reference: read_string(reader, MAX_SHORT_STRING, "ObjectsCreate", "reference")?,
                page_url: read_string(reader, MAX_SHORT_STRING, "ObjectsCreate", "pageUrl")?,
                instance_id: read_int(reader, "ObjectsCreate", "instanceId")?,
                num_objects: read_int(reader, "ObjectsCreate", "numObjects")?,
                coming_from: read_string(reader, MAX_SHORT_STRING, "ObjectsCreate", "comingFrom")?,
                cookie: read_int(reader, "ObjectsCreate", "cookie")?,
            })),
            other => Err(WireError::UnknownType(other)),
        }
    }
}

fn read_int(
    reader: &mut PacketReader,
    record: &'static str,
    field: &'static str,
) -> Result<i32, WireError> {
    reader
        .read_i32_le()
        .ok_or(WireError::MissingField { record, field })
}

fn read_string(
    reader: &mut PacketReader,
    max_len: usize,
    record: &'static str,
    field: &'static str,
) -> Result<String, WireError> {
    let count = reader
        .read_count(count_width(max_len))
        .ok_or(WireError::MissingField { record, field })?;
    if count > max_len {
        return Err(WireError::OversizedField {
            record,
            field,
            count,
            max: max_len,
        });
    }
    let bytes = reader
        .read_bytes(count)
        .ok_or(WireError::MissingField { record, field })?;
    Ok(String::from_utf8_lossy(bytes).to_string())
}

fn write_id_array(writer: &mut PacketWriter, ids: &[i32]) {
    writer.write_i32_le(ids.len() as i32);
    for id in ids {
        writer.write_i32_le(*id);
    }
}

fn read_id_array(
    reader: &mut PacketReader,
    record: &'static str,
    field: &'static str,
) -> Result<Vec<i32>, WireError> {
    let count = read_int(reader, record, field)?;
    if count < 0 || count as usize * 4 > reader.remaining() {
        return Err(WireError::BadElementCount {
            record,
            field,
            count,
        });
    }
    let mut ids = Vec::with_capacity(count as usize);
    for _ in 0..count {
        ids.push(read_int(reader, record, field)?);
    }
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_records() -> Vec<Record> {
        vec![
            Record::Error(ErrorRecord {
                code: ERROR_LOGIN,
                subject: 7,
                message: "Invalid login.".to_string(),
            }),
            Record::Version(VersionRecord {
                version: 5,
                min_version: 5,
                app_name: "Door Explorer".to_string(),
                app_version: 104,
                app_target: "win32".to_string(),
                os: "Windows".to_string(),
            }),
            Record::Login(LoginRecord {
                user_name: "guest".to_string(),
                user_id: 0,
                password: "guest".to_string(),
                url: "http://example.net/entry".to_string(),
                client_ident: "ident-123".to_string(),
            }),
            Record::LoginAck(LoginAckRecord {
                user_name: "guest".to_string(),
                user_id: 100,
                connection_id: 4,
            }),
            Record::ObjectsCreateAck(ObjectsCreateAckRecord {
                owner: 4,
                world_name: "plaza".to_string(),
                instance_id: 11,
                objects: vec![12, 13, 14],
                cookie: 900,
            }),
            Record::ObjectsDestroy(ObjectsDestroyRecord {
                objects: vec![12, 13],
            }),
            Record::AddObject(AddObjectRecord {
                group_id: 11,
                object_id: 12,
            }),
            Record::RemoveObject(RemoveObjectRecord {
                group_id: 11,
                object_id: 12,
            }),
            Record::GroupDropObserver(GroupDropObserverRecord { group_id: 11 }),
            Record::GroupObserverAdded(GroupObserverAddedRecord {
                group_id: 11,
                objects: vec![],
            }),
            Record::GroupObserverRemoved(GroupObserverRemovedRecord { group_id: 11 }),
            Record::ObjectAvatar(ObjectAvatarRecord {
                object_id: 12,
                url: "http://example.net/a.model".to_string(),
            }),
            Record::ObjectPosition(ObjectPositionRecord {
                object_id: 12,
                position: [1.5, -2.25, 0.0, 90.0, 0.125, -180.0],
            }),
            Record::ObjectNickname(ObjectNicknameRecord {
                object_id: 12,
                nickname: "visitor".to_string(),
            }),
            Record::Say(SayRecord {
                from_id: 12,
                to_id: 11,
                text: "hello there".to_string(),
            }),
            Record::SayTargeted(SayTargetedRecord {
                from_id: 12,
                to_id: 11,
                target: "door".to_string(),
                text: "open".to_string(),
            }),
            Record::ModeratorAction(ModeratorActionRecord {
                purpose: MODERATOR_PRIVILEGE,
                client_ident: "ident-123".to_string(),
                world_name: "plaza".to_string(),
                privileges: "squelch".to_string(),
                expiration: 0,
                object_id: 12,
                flags: 0,
            }),
            Record::ObjectsCreateV2(ObjectsCreateV2Record {
                owner: 4,
                world_name: "plaza".to_string(),
                reference: "http://example.net/plaza.world".to_string(),
                instance_id: 0,
                num_objects: 1,
                coming_from: "lobby".to_string(),
                cookie: 900,
            }),
            Record::AddObjectWithName(AddObjectWithNameRecord {
                group_id: 11,
                object_id: 15,
                name: "greeter".to_string(),
            }),
            Record::Broadcast(BroadcastRecord {
                client_ident: "ident-123".to_string(),
                world_name: "plaza".to_string(),
                info: "AVATAR:http://example.net/a.model".to_string(),
                object_id: 12,
            }),
            Record::ObjectsCreateV3(ObjectsCreateV3Record {
                owner: 4,
                world_name: "plaza".to_string(),
                reference: "http://example.net/plaza.world".to_string(),
                page_url: "http://example.net/plaza.html".to_string(),
                instance_id: -3,
                num_objects: 2,
                coming_from: String::new(),
                cookie: 901,
            }),
        ]
    }

    fn decode_one(bytes: &[u8]) -> (Record, usize) {
        Record::decode(bytes)
            .expect("decode")
            .expect("complete frame")
    }

    #[test]
    fn every_record_survives_a_roundtrip() {
        for record in sample_records() {
            let encoded = record.encode();
            let (decoded, consumed) = decode_one(&encoded);
            assert_eq!(consumed, encoded.len(), "{}", record.type_name());
            assert_eq!(decoded, record);
        }
    }

    #[test]
    fn frame_length_counts_everything_after_itself() {
        let encoded = Record::GroupDropObserver(GroupDropObserverRecord { group_id: 9 }).encode();
        // 4 length + 4 type + 1 pad + 4 group id.
        assert_eq!(encoded.len(), 13);
        assert_eq!(&encoded[..4], &9i32.to_le_bytes());
        assert_eq!(&encoded[4..8], &TYPE_GROUP_DROP_OBSERVER.to_le_bytes());
        assert_eq!(encoded[8], 1);
    }

    #[test]
    fn zero_and_max_length_strings_roundtrip() {
        let empty = Record::ObjectNickname(ObjectNicknameRecord {
            object_id: 1,
            nickname: String::new(),
        });
        let full = Record::Error(ErrorRecord {
            code: ERROR_GENERAL,
            subject: 0,
            message: "m".repeat(MAX_ERROR_MESSAGE),
        });
        let long_say = Record::Say(SayRecord {
            from_id: 1,
            to_id: 2,
            text: "s".repeat(MAX_SAY_TEXT),
        });
        for record in [empty, full, long_say] {
            let encoded = record.encode();
            let (decoded, consumed) = decode_one(&encoded);
            assert_eq!(consumed, encoded.len());
            assert_eq!(decoded, record);
        }
    }

    #[test]
    fn multiple_frames_parse_in_sequence() {
        let first = Record::AddObject(AddObjectRecord {
            group_id: 1,
            object_id: 2,
        });
        let second = Record::Say(SayRecord {
            from_id: 2,
            to_id: 1,
            text: "two at once".to_string(),
        });
        let mut buffer = first.encode();
        buffer.extend(second.encode());
        let (decoded_first, used) = decode_one(&buffer);
        assert_eq!(decoded_first, first);
        let (decoded_second, rest) = decode_one(&buffer[used..]);
        assert_eq!(decoded_second, second);
        assert_eq!(used + rest, buffer.len());
    }

    #[test]
    fn partial_frames_ask_for_more_bytes() {
        let encoded = Record::Login(LoginRecord {
            user_name: "guest".to_string(),
            user_id: 0,
            password: "guest".to_string(),
            url: String::new(),
            client_ident: "ident".to_string(),
        })
        .encode();
        for cut in 0..encoded.len() {
            assert_eq!(Record::decode(&encoded[..cut]).expect("decode"), None);
        }
    }

    #[test]
    fn trailing_bytes_inside_frame_are_tolerated() {
        let mut encoded = Record::GroupDropObserver(GroupDropObserverRecord { group_id: 3 }).encode();
        // Grow the frame by two unknown trailing bytes and patch the length.
        encoded.extend([0xaa, 0xbb]);
        let new_len = (encoded.len() - 4) as i32;
        encoded[..4].copy_from_slice(&new_len.to_le_bytes());
        let (decoded, consumed) = decode_one(&encoded);
        assert_eq!(
            decoded,
            Record::GroupDropObserver(GroupDropObserverRecord { group_id: 3 })
        );
        assert_eq!(consumed, encoded.len());
    }

    #[test]
    fn field_past_frame_end_is_fatal() {
        let mut encoded = Record::Say(SayRecord {
            from_id: 1,
            to_id: 2,
            text: "truncate me".to_string(),
        })
        .encode();
        // Shrink the declared length below what the fields need.
        let short_len = 10i32;
        encoded.truncate(4 + short_len as usize);
        encoded[..4].copy_from_slice(&short_len.to_le_bytes());
        let err = Record::decode(&encoded).expect_err("must fail");
        assert!(matches!(err, WireError::MissingField { .. }), "{:?}", err);
    }

    #[test]
    fn unknown_type_id_is_fatal() {
        let mut writer = PacketWriter::new();
        writer.write_i32_le(5);
        writer.write_i32_le(999);
        writer.write_u8(1);
        let err = Record::decode(writer.as_slice()).expect_err("must fail");
        assert_eq!(err, WireError::UnknownType(999));
    }

    #[test]
    fn unreasonable_frame_lengths_are_fatal() {
        for bad in [-1i32, 0, 4, (MAX_FRAME_BYTES + 1) as i32] {
            let mut writer = PacketWriter::new();
            writer.write_i32_le(bad);
            writer.write_bytes(&[0; 16]);
            let err = Record::decode(writer.as_slice()).expect_err("must fail");
            assert_eq!(err, WireError::FrameLength(bad));
        }
    }

    #[test]
    fn oversized_string_count_is_fatal() {
        let mut body = PacketWriter::new();
        body.write_i32_le(TYPE_OBJECT_NICKNAME);
        body.write_u8(1);
        body.write_i32_le(12);
        body.write_count(200, 1); // nickname limit is 40
        let mut frame = PacketWriter::new();
        frame.write_i32_le(body.len() as i32);
        frame.write_bytes(body.as_slice());
        let err = Record::decode(frame.as_slice()).expect_err("must fail");
        assert!(
            matches!(
                err,
                WireError::OversizedField {
                    count: 200,
                    max: MAX_NICKNAME,
                    ..
                }
            ),
            "{:?}",
            err
        );
    }

    #[test]
    fn id_array_count_must_fit_the_frame() {
        let mut body = PacketWriter::new();
        body.write_i32_le(TYPE_OBJECTS_DESTROY);
        body.write_u8(1);
        body.write_i32_le(1000);
        body.write_i32_le(1); // only one element present
        let mut frame = PacketWriter::new();
        frame.write_i32_le(body.len() as i32);
        frame.write_bytes(body.as_slice());
        let err = Record::decode(frame.as_slice()).expect_err("must fail");
        assert!(matches!(err, WireError::BadElementCount { count: 1000, .. }));
    }

    #[test]
    fn negative_id_array_count_is_fatal() {
        let mut body = PacketWriter::new();
        body.write_i32_le(TYPE_OBJECTS_DESTROY);
        body.write_u8(1);
        body.write_i32_le(-2);
        let mut frame = PacketWriter::new();
        frame.write_i32_le(body.len() as i32);
        frame.write_bytes(body.as_slice());
        let err = Record::decode(frame.as_slice()).expect_err("must fail");
        assert!(matches!(err, WireError::BadElementCount { count: -2, .. }));
    }

    #[test]
    fn handshake_gates_match_the_catalog() {
        for record in sample_records() {
            match record {
                Record::Version(_) => {
                    assert!(!record.requires_version());
                    assert!(!record.requires_login());
                }
                Record::Login(_) | Record::Error(_) => {
                    assert!(record.requires_version());
                    assert!(!record.requires_login());
                }
                _ => {
                    assert!(record.requires_version(), "{}", record.type_name());
                    assert!(record.requires_login(), "{}", record.type_name());
                }
            }
        }
    }

    #[test]
    fn fault_converts_to_error_record() {
        let fault = Fault::new(ERROR_OBJECT_SAYING, 42, "Too many queued sayings.");
        match fault.to_record() {
            Record::Error(record) => {
                assert_eq!(record.code, ERROR_OBJECT_SAYING);
                assert_eq!(record.subject, 42);
                assert_eq!(record.message, "Too many queued sayings.");
            }
            other => panic!("unexpected record {:?}", other),
        }
    }

    #[test]
    fn pretty_version_formats_major_minor() {
        assert_eq!(pretty_version(5), "0.5");
        assert_eq!(pretty_version(104), "1.4");
        assert_eq!(pretty_version(0), "0.0");
    }
}
