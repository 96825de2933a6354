//! Session supervisor.
//!
//! Owns every running session and the mapping from transport connections to
//! seats. Transport handlers call into it with a connection id; it resolves
//! the seat, forwards the command to the session's actor, and waits for the
//! result. Finished sessions are dropped from the registry as their actors
//! report in.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::actor::{self, ActorContext, SessionHandle};
use super::{Clock, Delivery, ServiceError};
use crate::bot::{BotStrategy, SimpleBot};
use crate::config::EngineConfig;
use crate::persistence::{SaveQueue, SnapshotStore};
use crate::state::decision::ContinuationChoice;
use crate::state::events::{Audience, ServerEvent};
use crate::state::game::PlayerId;
use crate::state::session::{Reply, Session, SessionCommand, SessionId};
use crate::state::tile::TileId;

/// Transport-level connection identifier.
pub type ConnectionId = String;

/// A player's place in a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Seat {
    pub session_id: SessionId,
    pub player_id: PlayerId,
}

struct Entry {
    handle: SessionHandle,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct Registry {
    sessions: RwLock<HashMap<SessionId, Entry>>,
    seats: RwLock<HashMap<ConnectionId, Seat>>,
}

impl Registry {
    async fn handle(&self, session_id: &str) -> Result<SessionHandle, ServiceError> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map(|e| e.handle.clone())
            .ok_or_else(|| ServiceError::UnknownSession(session_id.to_string()))
    }

    async fn seat(&self, connection_id: &str) -> Result<Seat, ServiceError> {
        self.seats
            .read()
            .await
            .get(connection_id)
            .cloned()
            .ok_or_else(|| ServiceError::UnknownConnection(connection_id.to_string()))
    }

    /// Point `connection_id` at `seat`, dropping any older connection that
    /// held the same seat.
    async fn bind(&self, connection_id: ConnectionId, seat: Seat) {
        let mut seats = self.seats.write().await;
        seats.retain(|_, existing| *existing != seat);
        seats.insert(connection_id, seat);
    }

    async fn reap(&self, session_id: &str) {
        self.sessions.write().await.remove(session_id);
        self.seats
            .write()
            .await
            .retain(|_, seat| seat.session_id != session_id);
    }
}

/// Entry point for transports.
pub struct Supervisor {
    config: EngineConfig,
    store: Arc<dyn SnapshotStore>,
    context: ActorContext,
    registry: Arc<Registry>,
    reaper: JoinHandle<()>,
}

impl Supervisor {
    /// Start a supervisor with the default bot strategy. Notifications for
    /// all sessions come out of the returned receiver.
    pub fn start(
        config: EngineConfig,
        store: Arc<dyn SnapshotStore>,
    ) -> (Self, mpsc::UnboundedReceiver<Delivery>) {
        Self::start_with_strategy(config, store, Arc::new(SimpleBot))
    }

    pub fn start_with_strategy(
        config: EngineConfig,
        store: Arc<dyn SnapshotStore>,
        strategy: Arc<dyn BotStrategy>,
    ) -> (Self, mpsc::UnboundedReceiver<Delivery>) {
        let (deliveries_tx, deliveries_rx) = mpsc::unbounded_channel();
        let (finished_tx, finished_rx) = mpsc::unbounded_channel();

        let saves = Arc::new(SaveQueue::start(store.clone(), config.save_max_attempts));
        let context = ActorContext {
            clock: Clock::new(),
            strategy,
            saves,
            deliveries: deliveries_tx,
            finished: finished_tx,
            tick: config.timer_tick(),
            max_bot_actions: config.max_bot_actions_per_turn,
        };

        let registry = Arc::new(Registry::default());
        let reaper = tokio::spawn(reap_finished(registry.clone(), finished_rx));

        info!(
            turn_time_limit_secs = ?config.turn_time_limit_secs,
            base_grace_period_secs = config.base_grace_period_secs,
            "Supervisor started"
        );
        let supervisor = Self {
            config,
            store,
            context,
            registry,
            reaper,
        };
        (supervisor, deliveries_rx)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub async fn session_count(&self) -> usize {
        self.registry.sessions.read().await.len()
    }

    pub async fn seat_of(&self, connection_id: &str) -> Option<Seat> {
        self.registry.seat(connection_id).await.ok()
    }

    /// Open a new session with the caller in the first seat.
    pub async fn create_session(
        &self,
        connection_id: ConnectionId,
        name: String,
    ) -> Result<Seat, ServiceError> {
        let session_id = Uuid::new_v4().to_string();
        let session = Session::new(
            session_id.clone(),
            self.config.session_options(),
            self.context.clock.now(),
        );
        self.launch(session).await;
        info!(session_id = %session_id, "Session created");

        let seat = self.seat_new_player(connection_id, &session_id, name).await?;
        self.deliver(
            &session_id,
            Audience::Player(seat.player_id),
            ServerEvent::SessionCreated {
                session_id: session_id.clone(),
                player_id: seat.player_id,
            },
        );
        Ok(seat)
    }

    pub async fn join_session(
        &self,
        connection_id: ConnectionId,
        session_id: &str,
        name: String,
    ) -> Result<Seat, ServiceError> {
        self.seat_new_player(connection_id, session_id, name).await
    }

    /// Fill an open seat with a bot before the game starts.
    pub async fn add_bot(&self, session_id: &str, name: String) -> Result<PlayerId, ServiceError> {
        let handle = self.registry.handle(session_id).await?;
        match handle
            .execute(SessionCommand::Join { name, is_bot: true })
            .await?
        {
            Reply::Joined { player_id } => Ok(player_id),
            _ => Err(ServiceError::SessionClosed(session_id.to_string())),
        }
    }

    pub async fn start_session(&self, connection_id: &str) -> Result<Reply, ServiceError> {
        let seat = self.registry.seat(connection_id).await?;
        self.execute(&seat.session_id, SessionCommand::Start).await
    }

    pub async fn draw_tile(&self, connection_id: &str) -> Result<Reply, ServiceError> {
        self.on_seat(connection_id, |player_id| SessionCommand::Draw { player_id })
            .await
    }

    pub async fn play_set(
        &self,
        connection_id: &str,
        selection: Vec<Vec<TileId>>,
    ) -> Result<Reply, ServiceError> {
        self.on_seat(connection_id, |player_id| SessionCommand::PlaySet {
            player_id,
            selection,
        })
        .await
    }

    pub async fn update_board(
        &self,
        connection_id: &str,
        layout: Vec<Vec<TileId>>,
        from_hand: Vec<TileId>,
    ) -> Result<Reply, ServiceError> {
        self.on_seat(connection_id, |player_id| SessionCommand::UpdateBoard {
            player_id,
            layout,
            from_hand,
        })
        .await
    }

    pub async fn undo_turn(&self, connection_id: &str) -> Result<Reply, ServiceError> {
        self.on_seat(connection_id, |player_id| SessionCommand::Undo { player_id })
            .await
    }

    pub async fn end_turn(&self, connection_id: &str) -> Result<Reply, ServiceError> {
        self.on_seat(connection_id, |player_id| SessionCommand::EndTurn { player_id })
            .await
    }

    pub async fn cast_continuation_vote(
        &self,
        connection_id: &str,
        choice: ContinuationChoice,
    ) -> Result<Reply, ServiceError> {
        self.on_seat(connection_id, |player_id| SessionCommand::Vote { player_id, choice })
            .await
    }

    pub async fn report_connection_metrics(
        &self,
        connection_id: &str,
        latency_ms: u32,
        is_mobile: bool,
    ) -> Result<Reply, ServiceError> {
        self.on_seat(connection_id, |player_id| SessionCommand::ReportMetrics {
            player_id,
            latency_ms,
            is_mobile,
        })
        .await
    }

    /// The transport lost `connection_id`. Its seat stays reserved while the
    /// session decides what to do.
    pub async fn transport_disconnected(
        &self,
        connection_id: &str,
        raw_reason: &str,
    ) -> Result<Reply, ServiceError> {
        let seat = self.registry.seats.write().await.remove(connection_id);
        let Some(seat) = seat else {
            debug!(connection_id, "Unseated connection closed");
            return Ok(Reply::Ignored);
        };
        self.execute(
            &seat.session_id,
            SessionCommand::Disconnected {
                player_id: seat.player_id,
                raw_reason: raw_reason.to_string(),
            },
        )
        .await
    }

    /// A new connection claims an existing seat. On success the seat is
    /// bound to `connection_id`.
    pub async fn reconnect(
        &self,
        connection_id: ConnectionId,
        seat: Seat,
        attempt: u32,
    ) -> Result<Reply, ServiceError> {
        let reply = self
            .execute(
                &seat.session_id,
                SessionCommand::ReconnectAttempt {
                    player_id: seat.player_id,
                    attempt,
                },
            )
            .await?;
        if reply == Reply::Reconnected {
            info!(%connection_id, session_id = %seat.session_id, player_id = seat.player_id, "Seat rebound");
            self.registry.bind(connection_id, seat).await;
        }
        Ok(reply)
    }

    /// The seat's private view, for resynchronizing a client.
    pub async fn player_view(&self, connection_id: &str) -> Result<serde_json::Value, ServiceError> {
        let seat = self.registry.seat(connection_id).await?;
        let handle = self.registry.handle(&seat.session_id).await?;
        handle.player_view(seat.player_id).await
    }

    /// Bring a stored session back to life. Its human seats have to
    /// reconnect before they can act.
    pub async fn restore_session(&self, session_id: &str) -> Result<(), ServiceError> {
        if self.registry.sessions.read().await.contains_key(session_id) {
            return Ok(());
        }
        let snapshot = self
            .store
            .load(session_id)?
            .ok_or_else(|| ServiceError::UnknownSession(session_id.to_string()))?;
        let session = Session::restore(
            snapshot,
            self.config.session_options(),
            self.context.clock.now(),
        )?;
        self.launch(session).await;
        Ok(())
    }

    /// Restore every stored session. Unreadable snapshots are skipped.
    pub async fn restore_all(&self) -> Result<usize, ServiceError> {
        let mut restored = 0;
        for session_id in self.store.list()? {
            match self.restore_session(&session_id).await {
                Ok(()) => restored += 1,
                Err(err) => warn!(session_id = %session_id, %err, "Snapshot not restored"),
            }
        }
        info!(restored, "Stored sessions restored");
        Ok(restored)
    }

    /// Save every running session and stop.
    pub async fn shutdown(self) {
        let entries: Vec<Entry> = self
            .registry
            .sessions
            .write()
            .await
            .drain()
            .map(|(_, entry)| entry)
            .collect();
        for entry in entries {
            entry.handle.shutdown().await;
            if let Err(err) = entry.task.await {
                debug!("session actor ended abnormally: {err}");
            }
        }
        self.reaper.abort();

        let saves = self.context.saves.clone();
        drop(self.context);
        match Arc::try_unwrap(saves) {
            Ok(saves) => saves.shutdown().await,
            Err(saves) => saves.flush().await,
        }
        info!("Supervisor stopped");
    }

    // Internals

    async fn launch(&self, session: Session) {
        let session_id = session.id.clone();
        let (handle, task) = actor::spawn(session, self.context.clone());
        self.registry
            .sessions
            .write()
            .await
            .insert(session_id, Entry { handle, task });
    }

    async fn seat_new_player(
        &self,
        connection_id: ConnectionId,
        session_id: &str,
        name: String,
    ) -> Result<Seat, ServiceError> {
        let handle = self.registry.handle(session_id).await?;
        let reply = handle
            .execute(SessionCommand::Join {
                name,
                is_bot: false,
            })
            .await?;
        let Reply::Joined { player_id } = reply else {
            return Err(ServiceError::SessionClosed(session_id.to_string()));
        };

        let seat = Seat {
            session_id: session_id.to_string(),
            player_id,
        };
        self.registry.bind(connection_id, seat.clone()).await;
        Ok(seat)
    }

    async fn on_seat(
        &self,
        connection_id: &str,
        command: impl FnOnce(PlayerId) -> SessionCommand,
    ) -> Result<Reply, ServiceError> {
        let seat = self.registry.seat(connection_id).await?;
        self.execute(&seat.session_id, command(seat.player_id)).await
    }

    async fn execute(
        &self,
        session_id: &str,
        command: SessionCommand,
    ) -> Result<Reply, ServiceError> {
        let handle = self.registry.handle(session_id).await?;
        handle.execute(command).await
    }

    fn deliver(&self, session_id: &str, audience: Audience, event: ServerEvent) {
        let delivery = Delivery {
            session_id: session_id.to_string(),
            audience,
            event,
        };
        if self.context.deliveries.send(delivery).is_err() {
            debug!(session_id, "delivery channel closed");
        }
    }
}

async fn reap_finished(registry: Arc<Registry>, mut finished: mpsc::UnboundedReceiver<SessionId>) {
    while let Some(session_id) = finished.recv().await {
        registry.reap(&session_id).await;
        debug!(session_id = %session_id, "Session removed from registry");
    }
}
