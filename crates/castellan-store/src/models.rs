//! Row models.

use sqlx::FromRow;

/// A client row. `key` is encrypted at rest.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct Client {
    pub id: Vec<u8>,
    pub name: String,
    pub key: Vec<u8>,
}

impl Client {
    /// The client's private command topic, derived from its id.
    pub fn command_topic(&self) -> String {
        format!("e4/{}", hex::encode(&self.id))
    }
}

/// A topic key row. `key` is encrypted at rest.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct TopicKey {
    pub topic: String,
    pub key: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_topic_is_hex_of_id() {
        let client = Client {
            id: vec![0xde, 0xad, 0xbe, 0xef],
            name: "alice".into(),
            key: vec![],
        };
        assert_eq!(client.command_topic(), "e4/deadbeef");
    }
}
