//! The external agent contract
//!
//! The runtime never talks to the game server directly; it drives an
//! [`AgentHandle`] collaborator that owns the connection, serialises
//! side-effecting instructions among concurrent invocations, and emits
//! asynchronous world events. This module defines:
//! - The [`AgentHandle`] trait consumed by the context surface
//! - The [`Instruction`] wire enum forwarded to the collaborator
//! - [`AgentEvent`] for the asynchronous event stream
//! - [`NotConnected`], a placeholder handle that fails every call

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::{
    Json,
    error::ProgramError,
    value::{AgentState, ItemStack, Position},
};

/// A side-effecting instruction forwarded to the external agent.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(
    tag = "type",
    content = "params",
    rename_all = "lowercase",
    rename_all_fields = "camelCase"
)]
pub enum Instruction {
    Goto {
        target: Position,
        #[serde(skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },
    Stop,
    Dig {
        position: Position,
    },
    Place {
        position: Position,
        #[serde(skip_serializing_if = "Option::is_none")]
        item: Option<String>,
    },
    Craft {
        recipe: String,
        count: u32,
    },
    Look {
        target: Position,
    },
    Attack {
        #[serde(skip_serializing_if = "Option::is_none")]
        entity_id: Option<i64>,
    },
    Equip {
        item: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        destination: Option<String>,
    },
    Chat {
        message: String,
    },
}

impl Instruction {
    /// The wire name of the instruction type.
    pub fn kind(&self) -> &'static str {
        match self {
            Instruction::Goto { .. } => "goto",
            Instruction::Stop => "stop",
            Instruction::Dig { .. } => "dig",
            Instruction::Place { .. } => "place",
            Instruction::Craft { .. } => "craft",
            Instruction::Look { .. } => "look",
            Instruction::Attack { .. } => "attack",
            Instruction::Equip { .. } => "equip",
            Instruction::Chat { .. } => "chat",
        }
    }
}

/// An asynchronous event emitted by the external agent (death, respawn,
/// chat, ...). Delivered to programs holding the `events` capability.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AgentEvent {
    pub name: String,
    #[serde(default)]
    pub payload: Json,
}

/// Contract the runtime needs from the external agent collaborator.
///
/// Implementations own their mutual exclusion: instruction calls from
/// concurrent invocations may interleave, but each call is a single
/// request/response interaction.
#[async_trait]
pub trait AgentHandle: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Current physical state snapshot.
    async fn state(&self) -> Result<AgentState, ProgramError>;

    /// Current inventory contents.
    async fn inventory(&self) -> Result<Vec<ItemStack>, ProgramError>;

    /// The block kind at an integer position, if any is loaded there.
    async fn block_at(&self, position: Position) -> Result<Option<String>, ProgramError>;

    /// World time in ticks.
    async fn world_time(&self) -> Result<i64, ProgramError>;

    /// Executes one instruction and returns its JSON-shaped outcome.
    async fn execute(&self, instruction: Instruction) -> Result<Json, ProgramError>;

    /// Subscribes to the asynchronous event stream.
    fn events(&self) -> broadcast::Receiver<AgentEvent>;
}

/// A placeholder handle for an agent that is not bound. Every call fails
/// with `EXTERNAL_DISCONNECTED`; the event stream never yields.
pub struct NotConnected {
    events: broadcast::Sender<AgentEvent>,
}

impl Default for NotConnected {
    fn default() -> Self {
        let (events, _) = broadcast::channel(1);
        Self { events }
    }
}

impl NotConnected {
    pub fn new() -> Self {
        Self::default()
    }

    fn error() -> ProgramError {
        ProgramError::disconnected("agent is not connected")
    }
}

#[async_trait]
impl AgentHandle for NotConnected {
    fn is_connected(&self) -> bool {
        false
    }

    async fn state(&self) -> Result<AgentState, ProgramError> {
        Err(Self::error())
    }

    async fn inventory(&self) -> Result<Vec<ItemStack>, ProgramError> {
        Err(Self::error())
    }

    async fn block_at(&self, _position: Position) -> Result<Option<String>, ProgramError> {
        Err(Self::error())
    }

    async fn world_time(&self) -> Result<i64, ProgramError> {
        Err(Self::error())
    }

    async fn execute(&self, _instruction: Instruction) -> Result<Json, ProgramError> {
        Err(Self::error())
    }

    fn events(&self) -> broadcast::Receiver<AgentEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instruction_wire_shape() {
        let goto = Instruction::Goto {
            target: Position::new(0.0, 64.0, 0.0),
            timeout_ms: Some(30_000),
        };
        let s = serde_json::to_string(&goto).unwrap();
        assert!(s.contains(r#""type":"goto""#));
        assert!(s.contains(r#""timeoutMs":30000"#));

        let chat = Instruction::Chat {
            message: "hello".into(),
        };
        assert_eq!(chat.kind(), "chat");
    }

    #[tokio::test]
    async fn not_connected_fails_every_call() {
        let agent = NotConnected::new();
        assert!(!agent.is_connected());
        let err = agent.state().await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::ExternalDisconnected);
        assert!(agent.execute(Instruction::Stop).await.is_err());
    }
}
