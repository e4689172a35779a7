//! Program execution engine for Mineflare
//!
//! # Overview
//! This crate is the runtime that loads user-supplied programs, exposes a
//! controlled API surface to them, throttles their effects on the shared
//! agent, and guarantees safe termination under timeouts, cancellation and
//! faults. It provides:
//! - The embedded scripting language and its async interpreter ([`script`])
//! - The isolated evaluation environment with a controlled timer
//!   ([`sandbox`])
//! - Capability admission and quota accounting ([`budget`])
//! - Timeout / retry / transaction / parallel combinators ([`flow`])
//! - The per-invocation API surface ([`context`])
//! - Per-invocation lifecycle orchestration ([`runner`])
//! - The persistent named-program catalogue ([`registry`])
//!
//! # Usage
//! 1. Build a [`registry::Registry`] rooted at a programs directory
//! 2. Register program sources with [`registry::Registry::add`]
//! 3. Run them against an agent handle with [`registry::Registry::run`]
//!
//! ```rust,ignore
//! let registry = Registry::builder().with_root(dir).build().await?;
//! registry.add("miner", source).await?;
//! let record = registry.run(agent, "miner", args, RunOptions::default()).await?;
//! ```

pub mod budget;
pub mod context;
pub mod flow;
pub mod registry;
pub mod runner;
pub mod sandbox;
pub mod script;
pub mod testing;

pub use budget::{OperationBudget, QuotaTable};
pub use context::{Ctx, ContextBuilder};
pub use registry::{Registry, RegistryBuilder};
pub use runner::{RunReport, Runner};
pub use sandbox::Sandbox;
