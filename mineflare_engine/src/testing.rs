//! Mock collaborators for exercising the runtime without a game server
//!
//! [`MockAgent`] implements the external agent contract over an in-memory
//! block map and inventory, records every instruction it receives, and can
//! be scripted to fail. It backs the engine's own tests and is exported so
//! embedders can dry-run programs.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, VecDeque},
    sync::atomic::{AtomicBool, AtomicI64, Ordering},
};
use tokio::sync::broadcast;

use mineflare_core::{
    Json,
    agent::{AgentEvent, AgentHandle, Instruction},
    error::ProgramError,
    value::{AgentState, ItemStack, Position},
};

pub struct MockAgent {
    connected: AtomicBool,
    state: Mutex<AgentState>,
    blocks: Mutex<BTreeMap<(i64, i64, i64), String>>,
    inventory: Mutex<Vec<ItemStack>>,
    instructions: Mutex<Vec<Instruction>>,
    scripted_failures: Mutex<VecDeque<ProgramError>>,
    ticks: AtomicI64,
    events: broadcast::Sender<AgentEvent>,
}

impl Default for MockAgent {
    fn default() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            connected: AtomicBool::new(true),
            state: Mutex::new(AgentState {
                position: Position::new(0.0, 64.0, 0.0),
                health: 20.0,
                food: 20.0,
                oxygen: 20.0,
                on_ground: true,
                ..AgentState::default()
            }),
            blocks: Mutex::new(BTreeMap::new()),
            inventory: Mutex::new(Vec::new()),
            instructions: Mutex::new(Vec::new()),
            scripted_failures: Mutex::new(VecDeque::new()),
            ticks: AtomicI64::new(1000),
            events,
        }
    }
}

impl MockAgent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn set_block(&self, x: i64, y: i64, z: i64, kind: impl Into<String>) {
        self.blocks.lock().insert((x, y, z), kind.into());
    }

    pub fn set_inventory(&self, items: Vec<ItemStack>) {
        *self.inventory.lock() = items;
    }

    pub fn set_ticks(&self, ticks: i64) {
        self.ticks.store(ticks, Ordering::SeqCst);
    }

    /// Queues a failure for an upcoming `execute` call, consumed in order.
    pub fn fail_next(&self, err: ProgramError) {
        self.scripted_failures.lock().push_back(err);
    }

    /// Every instruction received so far, in order.
    pub fn instructions(&self) -> Vec<Instruction> {
        self.instructions.lock().clone()
    }

    pub fn instruction_count(&self) -> usize {
        self.instructions.lock().len()
    }

    /// Emits an asynchronous agent event to subscribers.
    pub fn push_event(&self, name: impl Into<String>, payload: Json) {
        let _ = self.events.send(AgentEvent {
            name: name.into(),
            payload,
        });
    }
}

#[async_trait]
impl AgentHandle for MockAgent {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn state(&self) -> Result<AgentState, ProgramError> {
        Ok(self.state.lock().clone())
    }

    async fn inventory(&self) -> Result<Vec<ItemStack>, ProgramError> {
        Ok(self.inventory.lock().clone())
    }

    async fn block_at(&self, position: Position) -> Result<Option<String>, ProgramError> {
        Ok(self.blocks.lock().get(&position.block()).cloned())
    }

    async fn world_time(&self) -> Result<i64, ProgramError> {
        Ok(self.ticks.load(Ordering::SeqCst))
    }

    async fn execute(&self, instruction: Instruction) -> Result<Json, ProgramError> {
        self.instructions.lock().push(instruction.clone());
        if let Some(err) = self.scripted_failures.lock().pop_front() {
            return Err(err);
        }
        match instruction {
            Instruction::Goto { target, .. } => {
                self.state.lock().position = target;
            }
            Instruction::Dig { position } => {
                if let Some(kind) = self.blocks.lock().remove(&position.block()) {
                    let mut inventory = self.inventory.lock();
                    match inventory.iter_mut().find(|item| item.name == kind) {
                        Some(item) => item.count += 1,
                        None => inventory.push(ItemStack {
                            name: kind,
                            count: 1,
                        }),
                    }
                }
            }
            Instruction::Place { position, item } => {
                self.blocks.lock().insert(
                    position.block(),
                    item.unwrap_or_else(|| "stone".to_string()),
                );
            }
            Instruction::Craft { recipe, count } => {
                let mut inventory = self.inventory.lock();
                match inventory.iter_mut().find(|i| i.name == recipe) {
                    Some(item) => item.count += count,
                    None => inventory.push(ItemStack {
                        name: recipe,
                        count,
                    }),
                }
            }
            _ => {}
        }
        Ok(serde_json::json!({"status": "ok"}))
    }

    fn events(&self) -> broadcast::Receiver<AgentEvent> {
        self.events.subscribe()
    }
}
