//! Typed command records the C2 dispatches to clients.
//!
//! Each command carries a single-byte type tag and a fixed field order; the
//! wire form is produced by [`Command::serialize`] and protected by the
//! crypto module before publishing. Serialisation is deterministic and
//! versioned so identical commands always produce identical bytes.

use castellan_crypto::e4;
use thiserror::Error;

/// Wire protocol version emitted as the leading byte of every command.
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Errors from command construction.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

/// Command type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CommandType {
    RemoveTopic = 0x00,
    ResetTopics = 0x01,
    SetIdKey = 0x02,
    SetTopicKey = 0x03,
    RemovePubKey = 0x04,
    ResetPubKeys = 0x05,
    SetPubKey = 0x06,
    SetC2Key = 0x07,
}

/// A command record, built through the validating constructors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Drop the key for `topic`.
    RemoveTopic { topic: String },
    /// Drop every topic key.
    ResetTopics,
    /// Replace the client's own device key.
    SetIdKey { key: Vec<u8> },
    /// Install the key for `topic`.
    SetTopicKey { topic: String, key: Vec<u8> },
    /// Remove the public key owned by `name` from the client's ring.
    RemovePubKey { name: String },
    /// Drop every stored public key.
    ResetPubKeys,
    /// Install the public key owned by `name`.
    SetPubKey { key: Vec<u8>, name: String },
    /// Replace the C2 public key used to verify commands.
    SetC2Key { key: Vec<u8> },
}

impl Command {
    pub fn remove_topic(topic: &str) -> Result<Self, CommandError> {
        validate_topic(topic)?;
        Ok(Command::RemoveTopic {
            topic: topic.to_string(),
        })
    }

    pub fn reset_topics() -> Self {
        Command::ResetTopics
    }

    pub fn set_id_key(key: &[u8]) -> Result<Self, CommandError> {
        validate_key(key)?;
        Ok(Command::SetIdKey { key: key.to_vec() })
    }

    pub fn set_topic_key(topic: &str, key: &[u8]) -> Result<Self, CommandError> {
        validate_topic(topic)?;
        validate_key(key)?;
        Ok(Command::SetTopicKey {
            topic: topic.to_string(),
            key: key.to_vec(),
        })
    }

    pub fn remove_pub_key(name: &str) -> Result<Self, CommandError> {
        validate_name(name)?;
        Ok(Command::RemovePubKey {
            name: name.to_string(),
        })
    }

    pub fn reset_pub_keys() -> Self {
        Command::ResetPubKeys
    }

    pub fn set_pub_key(key: &[u8], name: &str) -> Result<Self, CommandError> {
        validate_key(key)?;
        validate_name(name)?;
        Ok(Command::SetPubKey {
            key: key.to_vec(),
            name: name.to_string(),
        })
    }

    pub fn set_c2_key(key: &[u8]) -> Result<Self, CommandError> {
        validate_key(key)?;
        Ok(Command::SetC2Key { key: key.to_vec() })
    }

    /// The single-byte type tag.
    pub fn command_type(&self) -> CommandType {
        match self {
            Command::RemoveTopic { .. } => CommandType::RemoveTopic,
            Command::ResetTopics => CommandType::ResetTopics,
            Command::SetIdKey { .. } => CommandType::SetIdKey,
            Command::SetTopicKey { .. } => CommandType::SetTopicKey,
            Command::RemovePubKey { .. } => CommandType::RemovePubKey,
            Command::ResetPubKeys => CommandType::ResetPubKeys,
            Command::SetPubKey { .. } => CommandType::SetPubKey,
            Command::SetC2Key { .. } => CommandType::SetC2Key,
        }
    }

    /// Deterministic wire form: `version ‖ tag ‖ fields`.
    ///
    /// Fixed-length fields (keys) are emitted raw; variable-length fields
    /// (topics, names) carry a u16 big-endian length prefix.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = vec![PROTOCOL_VERSION, self.command_type() as u8];
        match self {
            Command::RemoveTopic { topic } => put_str(&mut out, topic),
            Command::ResetTopics | Command::ResetPubKeys => {}
            Command::SetIdKey { key } | Command::SetC2Key { key } => {
                out.extend_from_slice(key);
            }
            Command::SetTopicKey { topic, key } => {
                out.extend_from_slice(key);
                put_str(&mut out, topic);
            }
            Command::RemovePubKey { name } => put_str(&mut out, name),
            Command::SetPubKey { key, name } => {
                out.extend_from_slice(key);
                put_str(&mut out, name);
            }
        }
        out
    }
}

fn put_str(out: &mut Vec<u8>, value: &str) {
    let bytes = value.as_bytes();
    out.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
    out.extend_from_slice(bytes);
}

fn validate_topic(topic: &str) -> Result<(), CommandError> {
    if topic.is_empty() {
        return Err(CommandError::InvalidArgument("empty topic".into()));
    }
    if topic.len() > u16::MAX as usize {
        return Err(CommandError::InvalidArgument("topic too long".into()));
    }
    Ok(())
}

fn validate_name(name: &str) -> Result<(), CommandError> {
    e4::validate_name(name)
        .map_err(|err| CommandError::InvalidArgument(err.to_string()))
}

fn validate_key(key: &[u8]) -> Result<(), CommandError> {
    if key.len() != e4::KEY_LEN {
        return Err(CommandError::InvalidArgument(format!(
            "invalid key length: got {}, want {}",
            key.len(),
            e4::KEY_LEN
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; e4::KEY_LEN] = [0x42; e4::KEY_LEN];

    #[test]
    fn tags_are_stable() {
        assert_eq!(Command::remove_topic("t").unwrap().command_type() as u8, 0x00);
        assert_eq!(Command::reset_topics().command_type() as u8, 0x01);
        assert_eq!(Command::set_id_key(&KEY).unwrap().command_type() as u8, 0x02);
        assert_eq!(
            Command::set_topic_key("t", &KEY).unwrap().command_type() as u8,
            0x03
        );
        assert_eq!(
            Command::remove_pub_key("alice").unwrap().command_type() as u8,
            0x04
        );
        assert_eq!(Command::reset_pub_keys().command_type() as u8, 0x05);
        assert_eq!(
            Command::set_pub_key(&KEY, "alice").unwrap().command_type() as u8,
            0x06
        );
        assert_eq!(Command::set_c2_key(&KEY).unwrap().command_type() as u8, 0x07);
    }

    #[test]
    fn set_topic_key_layout() {
        let cmd = Command::set_topic_key("news", &KEY).unwrap();
        let bytes = cmd.serialize();

        assert_eq!(bytes[0], PROTOCOL_VERSION);
        assert_eq!(bytes[1], CommandType::SetTopicKey as u8);
        assert_eq!(&bytes[2..2 + e4::KEY_LEN], KEY.as_slice());
        assert_eq!(&bytes[2 + e4::KEY_LEN..4 + e4::KEY_LEN], [0x00, 0x04]);
        assert_eq!(&bytes[4 + e4::KEY_LEN..], b"news");
    }

    #[test]
    fn empty_commands_are_two_bytes() {
        assert_eq!(Command::reset_topics().serialize(), vec![PROTOCOL_VERSION, 0x01]);
        assert_eq!(
            Command::reset_pub_keys().serialize(),
            vec![PROTOCOL_VERSION, 0x05]
        );
    }

    #[test]
    fn serialisation_is_deterministic() {
        let a = Command::set_pub_key(&KEY, "alice").unwrap().serialize();
        let b = Command::set_pub_key(&KEY, "alice").unwrap().serialize();
        assert_eq!(a, b);
    }

    #[test]
    fn constructors_validate_arguments() {
        assert!(Command::remove_topic("").is_err());
        assert!(Command::set_id_key(&[1u8; 7]).is_err());
        assert!(Command::set_topic_key("t", &[1u8; 31]).is_err());
        assert!(Command::set_pub_key(&KEY, "").is_err());
        assert!(Command::remove_pub_key("").is_err());
        assert!(Command::set_c2_key(&[]).is_err());
    }
}
