use base64::engine::general_purpose::STANDARD as BASE64_ENGINE;
use base64::Engine as _;
use sha1::{Digest, Sha1};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModeratorCommand {
    Broadcast { password: String, universe: bool },
    Quiet,
    Ignore { client_ident: String },
    Unignore { client_ident: String },
    Squelch { connection_id: i32 },
    Unsquelch { connection_id: i32 },
    ShowIds { enabled: Option<bool> },
    SimpleAvatars { enabled: Option<bool> },
    Reserve {
        world_name: String,
        instance_id: i32,
        num_objects: i32,
    },
    Shutdown,
    Unknown(String),
}

pub fn parse_moderator_command(message: &str) -> Result<Option<ModeratorCommand>, String> {
    let trimmed = message.trim();
    if !trimmed.starts_with('/') {
        return Ok(None);
    }

    let mut parts = trimmed[1..].split_whitespace();
    let command = parts
        .next()
        .ok_or_else(|| "moderator command missing name".to_string())?;
    let command = command.to_ascii_lowercase();
    let parsed = match command.as_str() {
        "broadcast" => {
            let password = parts
                .next()
                .ok_or_else(|| "usage: /broadcast <password> [universe]".to_string())?
                .to_string();
            let universe = match parts.next() {
                Some(scope) if scope.eq_ignore_ascii_case("universe") => true,
                Some(scope) => {
                    return Err(format!("unknown broadcast scope '{}'", scope));
                }
                None => false,
            };
            ModeratorCommand::Broadcast { password, universe }
        }
        "quiet" => ModeratorCommand::Quiet,
        "ignore" => ModeratorCommand::Ignore {
            client_ident: parse_ident(parts.next())?,
        },
        "unignore" => ModeratorCommand::Unignore {
            client_ident: parse_ident(parts.next())?,
        },
        "squelch" => ModeratorCommand::Squelch {
            connection_id: parse_i32(parts.next())?,
        },
        "unsquelch" => ModeratorCommand::Unsquelch {
            connection_id: parse_i32(parts.next())?,
        },
        "showids" => ModeratorCommand::ShowIds {
            enabled: parse_toggle(parts.next())?,
        },
        "simple" => ModeratorCommand::SimpleAvatars {
            enabled: parse_toggle(parts.next())?,
        },
        "reserve" => {
            let world_name = parts
                .next()
                .ok_or_else(|| "usage: /reserve <world> <instance> <count>".to_string())?
                .to_string();
            let instance_id = parse_i32(parts.next())?;
            let num_objects = parse_i32(parts.next())?;
            ModeratorCommand::Reserve {
                world_name,
                instance_id,
                num_objects,
            }
        }
        "shutdown" => ModeratorCommand::Shutdown,
        _ => ModeratorCommand::Unknown(command),
    };
    Ok(Some(parsed))
}

fn parse_ident(value: Option<&str>) -> Result<String, String> {
    let value = value.ok_or_else(|| "moderator command missing client identity".to_string())?;
    Ok(value.to_string())
}

fn parse_i32(value: Option<&str>) -> Result<i32, String> {
    let value = value.ok_or_else(|| "moderator command missing numeric value".to_string())?;
    value
        .parse::<i32>()
        .map_err(|_| format!("moderator command expected a number, got '{value}'"))
}

fn parse_toggle(value: Option<&str>) -> Result<Option<bool>, String> {
    match value {
        None => Ok(None),
        Some(token) if token.eq_ignore_ascii_case("on") => Ok(Some(true)),
        Some(token) if token.eq_ignore_ascii_case("off") => Ok(Some(false)),
        Some(token) => Err(format!("moderator command expected on or off, got '{token}'")),
    }
}

/// Digest a password into the form the settings file stores: base64 over a
/// SHA-1 of the world name, a colon and the password. Binding the world name
/// in keeps one world's token from unlocking another.
pub fn challenge(text: &str, salt: &str) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(salt.as_bytes());
    sha1.update(b":");
    sha1.update(text.as_bytes());
    BASE64_ENGINE.encode(sha1.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_moderator_command_ignores_plain_chat() {
        assert_eq!(parse_moderator_command("hello there").unwrap(), None);
    }

    #[test]
    fn parse_moderator_command_parses_broadcast_scopes() {
        assert_eq!(
            parse_moderator_command("/broadcast sesame").unwrap(),
            Some(ModeratorCommand::Broadcast {
                password: "sesame".to_string(),
                universe: false
            })
        );
        assert_eq!(
            parse_moderator_command("/broadcast sesame universe").unwrap(),
            Some(ModeratorCommand::Broadcast {
                password: "sesame".to_string(),
                universe: true
            })
        );
        assert!(parse_moderator_command("/broadcast sesame everywhere").is_err());
    }

    #[test]
    fn parse_moderator_command_parses_squelch_target() {
        assert_eq!(
            parse_moderator_command("/squelch 42").unwrap(),
            Some(ModeratorCommand::Squelch { connection_id: 42 })
        );
        assert!(parse_moderator_command("/squelch Bob").is_err());
        assert!(parse_moderator_command("/squelch").is_err());
    }

    #[test]
    fn parse_moderator_command_parses_toggles() {
        assert_eq!(
            parse_moderator_command("/showids").unwrap(),
            Some(ModeratorCommand::ShowIds { enabled: None })
        );
        assert_eq!(
            parse_moderator_command("/showids on").unwrap(),
            Some(ModeratorCommand::ShowIds {
                enabled: Some(true)
            })
        );
        assert_eq!(
            parse_moderator_command("/simple OFF").unwrap(),
            Some(ModeratorCommand::SimpleAvatars {
                enabled: Some(false)
            })
        );
        assert!(parse_moderator_command("/simple maybe").is_err());
    }

    #[test]
    fn parse_moderator_command_parses_reserve() {
        assert_eq!(
            parse_moderator_command("/reserve plaza 17 5").unwrap(),
            Some(ModeratorCommand::Reserve {
                world_name: "plaza".to_string(),
                instance_id: 17,
                num_objects: 5
            })
        );
        assert!(parse_moderator_command("/reserve plaza").is_err());
    }

    #[test]
    fn parse_moderator_command_handles_unknown() {
        assert_eq!(
            parse_moderator_command("/dance").unwrap(),
            Some(ModeratorCommand::Unknown("dance".to_string()))
        );
    }

    #[test]
    fn parse_moderator_command_parses_ignore() {
        assert_eq!(
            parse_moderator_command("/ignore BADC0FFEE").unwrap(),
            Some(ModeratorCommand::Ignore {
                client_ident: "BADC0FFEE".to_string()
            })
        );
        assert_eq!(
            parse_moderator_command("/unignore BADC0FFEE").unwrap(),
            Some(ModeratorCommand::Unignore {
                client_ident: "BADC0FFEE".to_string()
            })
        );
    }

    #[test]
    fn challenge_is_stable_and_salted() {
        let first = challenge("sesame", "plaza");
        assert_eq!(first, challenge("sesame", "plaza"));
        assert_ne!(first, challenge("sesame", "garden"));
        assert_ne!(first, challenge("other", "plaza"));
        // SHA-1 digests are twenty bytes, so the base64 form is always 28
        // characters.
        assert_eq!(first.len(), 28);
    }
}
