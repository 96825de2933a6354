//! MeldCast State Library
//!
//! This crate keeps multiplayer tile-game sessions running while players
//! drop and come back.
//!
//! # Overview
//!
//! - **Meld Rules** - Groups and runs with wildcards, and the initial-meld
//!   threshold.
//!
//! - **Turn State Machine** - Hands, board, pile, and whose turn it is, with
//!   per-turn undo and a turn clock.
//!
//! - **Connection Tracking** - Per-seat connection status, disconnect
//!   classification, and adaptive grace periods.
//!
//! - **Pause and Continuation** - The game pauses when the player holding
//!   the turn drops. If they miss their grace period, the remaining players
//!   vote to skip the turn, hand the seat to a bot, or end the game.
//!
//! - **Runtime** - One task per session, cancellable timers, bot moves, and
//!   best-effort snapshot persistence.
//!
//! # Design Principles
//!
//! 1. **State is synchronous** - Everything under [`state`] takes the
//!    current time as an argument and never sleeps or spawns.
//!
//! 2. **One command at a time** - A session only changes through
//!    [`Session::handle`], and the runtime feeds it serially.
//!
//! 3. **Timers are keyed** - A fired timer is only acted on if the state it
//!    was armed for is still current.
//!
//! 4. **No networking** - Transports talk to the [`runtime::Supervisor`] and
//!    receive [`runtime::Delivery`] values to fan out.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use meldcast_state::config::EngineConfig;
//! use meldcast_state::persistence::MemoryStore;
//! use meldcast_state::runtime::Supervisor;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let (supervisor, mut deliveries) =
//!     Supervisor::start(EngineConfig::default(), Arc::new(MemoryStore::new()));
//!
//! let seat = supervisor
//!     .create_session("conn-1".to_string(), "Alice".to_string())
//!     .await
//!     .unwrap();
//! supervisor.add_bot(&seat.session_id, "Bot".to_string()).await.unwrap();
//! supervisor.start_session("conn-1").await.unwrap();
//!
//! while let Ok(delivery) = deliveries.try_recv() {
//!     println!("{:?} <- {}", delivery.audience, delivery.event.name());
//! }
//! supervisor.shutdown().await;
//! # }
//! ```

pub mod bot;
pub mod config;
pub mod persistence;
pub mod runtime;
pub mod state;

// Re-export everything from state module at crate root
pub use state::*;

pub use bot::{BotStrategy, SimpleBot};
pub use config::{ConfigError, EngineConfig};
pub use persistence::{MemoryStore, PersistenceError, SaveQueue, SnapshotStore};
pub use runtime::{Delivery, ServiceError, Supervisor};
