use std::fmt::{self, Write as _};
use std::str::FromStr;

use snafu::{OptionExt, ensure};
use uuid::Uuid;

use super::error::{EngineError, EngineResult, InvalidIdSnafu};

const ADDRESS_SEPARATOR: char = '~';

/// Durable key of one conversation, derived from its local and peer addresses.
///
/// Two conversations between the same pair of addresses always map to the same
/// key, which is what keeps list entries unique across rebuilds. The text form
/// is `local~peer` with `%` and `~` inside an address written as `%25` and `%7E`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConversationId {
    local: String,
    peer: String,
}

impl ConversationId {
    pub fn from_addresses(local: impl Into<String>, peer: impl Into<String>) -> Self {
        Self {
            local: local.into(),
            peer: peer.into(),
        }
    }

    pub fn parse(raw: &str) -> EngineResult<Self> {
        let (local, peer) = raw.split_once(ADDRESS_SEPARATOR).context(InvalidIdSnafu {
            stage: "split-conversation-id",
            id_type: "conversation-id",
            raw: raw.to_string(),
        })?;
        ensure!(
            !local.is_empty() && !peer.is_empty() && !peer.contains(ADDRESS_SEPARATOR),
            InvalidIdSnafu {
                stage: "validate-conversation-id",
                id_type: "conversation-id",
                raw: raw.to_string(),
            }
        );
        let local = unescape_address(local).context(InvalidIdSnafu {
            stage: "unescape-local-address",
            id_type: "conversation-id",
            raw: raw.to_string(),
        })?;
        let peer = unescape_address(peer).context(InvalidIdSnafu {
            stage: "unescape-peer-address",
            id_type: "conversation-id",
            raw: raw.to_string(),
        })?;
        Ok(Self::from_addresses(local, peer))
    }

    pub fn local_address(&self) -> &str {
        &self.local
    }

    pub fn peer_address(&self) -> &str {
        &self.peer
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_escaped(formatter, &self.local)?;
        formatter.write_char(ADDRESS_SEPARATOR)?;
        write_escaped(formatter, &self.peer)
    }
}

impl FromStr for ConversationId {
    type Err = EngineError;

    fn from_str(raw: &str) -> EngineResult<Self> {
        Self::parse(raw)
    }
}

fn write_escaped(formatter: &mut fmt::Formatter<'_>, address: &str) -> fmt::Result {
    for character in address.chars() {
        match character {
            '%' => formatter.write_str("%25")?,
            ADDRESS_SEPARATOR => formatter.write_str("%7E")?,
            other => formatter.write_char(other)?,
        }
    }
    Ok(())
}

fn unescape_address(escaped: &str) -> Option<String> {
    let mut address = String::with_capacity(escaped.len());
    let mut characters = escaped.chars();
    while let Some(character) = characters.next() {
        if character != '%' {
            address.push(character);
            continue;
        }
        let code = [characters.next()?, characters.next()?];
        match code {
            ['2', '5'] => address.push('%'),
            ['7', 'E' | 'e'] => address.push(ADDRESS_SEPARATOR),
            _ => return None,
        }
    }
    Some(address)
}

/// Identifier of one history record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventLogId(Uuid);

impl EventLogId {
    pub fn new_v7() -> Self {
        Self(Uuid::now_v7())
    }
}

impl fmt::Display for EventLogId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}", self.0)
    }
}
