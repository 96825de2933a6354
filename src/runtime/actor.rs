//! Session actor.
//!
//! Each session lives in its own task and is reached only through its
//! mailbox, so commands, timer expiries and bot moves for one session are
//! applied one at a time in arrival order. Different sessions run in
//! parallel.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::timer::TimerSet;
use super::{Clock, Delivery, ServiceError};
use crate::bot::{BotAction, BotStrategy, BotView};
use crate::persistence::SaveQueue;
use crate::state::game::PlayerId;
use crate::state::session::{
    Reply, Session, SessionCommand, SessionError, SessionId, TimerKey,
};

pub(crate) enum ActorMessage {
    Command {
        command: SessionCommand,
        reply: oneshot::Sender<Result<Reply, SessionError>>,
    },
    View {
        player_id: PlayerId,
        reply: oneshot::Sender<serde_json::Value>,
    },
    Timer(TimerKey),
    Shutdown(oneshot::Sender<()>),
}

impl From<TimerKey> for ActorMessage {
    fn from(key: TimerKey) -> Self {
        Self::Timer(key)
    }
}

/// What an actor shares with the rest of the runtime.
#[derive(Clone)]
pub(crate) struct ActorContext {
    pub clock: Clock,
    pub strategy: Arc<dyn BotStrategy>,
    pub saves: Arc<SaveQueue>,
    pub deliveries: mpsc::UnboundedSender<Delivery>,
    /// Told the id of every session that finished
    pub finished: mpsc::UnboundedSender<SessionId>,
    pub tick: Option<Duration>,
    pub max_bot_actions: usize,
}

/// Cheap, cloneable address of a running session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    session_id: SessionId,
    tx: mpsc::UnboundedSender<ActorMessage>,
}

impl std::fmt::Debug for ActorMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Command { command, .. } => write!(f, "Command({})", command.name()),
            Self::View { player_id, .. } => write!(f, "View({player_id})"),
            Self::Timer(key) => write!(f, "Timer({key:?})"),
            Self::Shutdown(_) => write!(f, "Shutdown"),
        }
    }
}

impl SessionHandle {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Run one command through the session and wait for its result.
    pub async fn execute(&self, command: SessionCommand) -> Result<Reply, ServiceError> {
        let (reply, rx) = oneshot::channel();
        self.send(ActorMessage::Command { command, reply })?;
        let result = rx.await.map_err(|_| self.closed())?;
        Ok(result?)
    }

    /// The session as `player_id` sees it.
    pub async fn player_view(&self, player_id: PlayerId) -> Result<serde_json::Value, ServiceError> {
        let (reply, rx) = oneshot::channel();
        self.send(ActorMessage::View { player_id, reply })?;
        rx.await.map_err(|_| self.closed())
    }

    /// Ask the actor to save and stop. Resolves once it has.
    pub(crate) async fn shutdown(&self) {
        let (done, rx) = oneshot::channel();
        if self.send(ActorMessage::Shutdown(done)).is_ok() {
            let _ = rx.await;
        }
    }

    fn send(&self, message: ActorMessage) -> Result<(), ServiceError> {
        self.tx.send(message).map_err(|_| self.closed())
    }

    fn closed(&self) -> ServiceError {
        ServiceError::SessionClosed(self.session_id.clone())
    }
}

/// Start the actor for `session`.
pub(crate) fn spawn(session: Session, context: ActorContext) -> (SessionHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = SessionHandle {
        session_id: session.id.clone(),
        tx: tx.clone(),
    };
    let actor = SessionActor {
        session,
        context,
        timers: TimerSet::new(),
        mailbox: tx.downgrade(),
    };
    let task = tokio::spawn(actor.run(rx));
    (handle, task)
}

struct SessionActor {
    session: Session,
    context: ActorContext,
    timers: TimerSet,
    mailbox: mpsc::WeakUnboundedSender<ActorMessage>,
}

impl SessionActor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<ActorMessage>) {
        debug!(session_id = %self.session.id, "session actor started");
        let mut ticker = self.context.tick.map(|period| {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        // Restored sessions may already need bots or timers
        let before = self.session.revision();
        self.settle(before, true);

        while !self.session.is_finished() {
            tokio::select! {
                message = rx.recv() => {
                    let Some(message) = message else {
                        debug!(session_id = %self.session.id, "all handles dropped");
                        break;
                    };
                    if !self.on_message(message) {
                        break;
                    }
                }
                _ = next_tick(&mut ticker) => {
                    let now = self.context.clock.now();
                    self.session.tick(now);
                    self.flush_outbox();
                }
            }
        }

        self.timers.cancel_all();
        if self.session.is_finished() {
            self.context.saves.remove(self.session.id.clone());
            let _ = self.context.finished.send(self.session.id.clone());
            info!(
                session_id = %self.session.id,
                reason = ?self.session.end_reason(),
                "Session reclaimed"
            );
        }
        debug!(session_id = %self.session.id, "session actor stopped");
    }

    /// Returns false when the actor should stop.
    fn on_message(&mut self, message: ActorMessage) -> bool {
        let before = self.session.revision();
        match message {
            ActorMessage::Command { command, reply } => {
                let now = self.context.clock.now();
                let result = self.session.handle(command, now);
                self.settle(before, false);
                let _ = reply.send(result);
            }
            ActorMessage::View { player_id, reply } => {
                let _ = reply.send(self.session.player_view(player_id));
            }
            ActorMessage::Timer(key) => {
                let now = self.context.clock.now();
                match self.session.handle(SessionCommand::TimerFired(key), now) {
                    Ok(Reply::Ignored) => debug!(session_id = %self.session.id, ?key, "Stale timer"),
                    Ok(_) => debug!(session_id = %self.session.id, ?key, "Timer handled"),
                    Err(err) => warn!(session_id = %self.session.id, ?key, %err, "Timer failed"),
                }
                self.settle(before, false);
            }
            ActorMessage::Shutdown(done) => {
                if self.session.is_started() && !self.session.is_finished() {
                    self.context.saves.enqueue(self.session.snapshot());
                }
                let _ = done.send(());
                return false;
            }
        }
        true
    }

    /// Let bots move, deliver notifications, re-arm timers, and save if
    /// anything changed.
    fn settle(&mut self, before: u64, force_save: bool) {
        self.drive_bots();
        self.flush_outbox();

        let now = self.context.clock.now();
        if let Some(mailbox) = self.mailbox.upgrade() {
            self.timers
                .reconcile(&self.session.pending_timers(), now, &mailbox);
        }

        let changed = force_save || self.session.revision() != before;
        if changed && !self.session.is_finished() && self.session.is_started() {
            self.context.saves.enqueue(self.session.snapshot());
        }
    }

    /// Play bot turns until a human holds the turn.
    fn drive_bots(&mut self) {
        let mut actions = 0;
        let mut force_end = false;

        while let Some(view) = BotView::from_session(&self.session) {
            let player_id = view.player_id;
            let action = if force_end || actions >= self.context.max_bot_actions {
                BotAction::EndTurn
            } else {
                self.context.strategy.choose(&view)
            };
            let ending = action == BotAction::EndTurn;

            let now = self.context.clock.now();
            match self.session.handle(action.into_command(player_id), now) {
                Ok(_) if ending => {
                    actions = 0;
                    force_end = false;
                }
                Ok(_) => actions += 1,
                Err(err) if ending => {
                    warn!(session_id = %self.session.id, player_id, %err, "Bot could not end its turn");
                    break;
                }
                Err(err) => {
                    debug!(
                        session_id = %self.session.id,
                        player_id,
                        strategy = self.context.strategy.name(),
                        %err,
                        "Bot move rejected, ending turn"
                    );
                    force_end = true;
                }
            }
        }
    }

    fn flush_outbox(&mut self) {
        for outbound in self.session.take_outbound() {
            let delivery = Delivery {
                session_id: self.session.id.clone(),
                audience: outbound.audience,
                event: outbound.event,
            };
            if self.context.deliveries.send(delivery).is_err() {
                debug!(session_id = %self.session.id, "delivery channel closed");
            }
        }
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bot::SimpleBot;
    use crate::persistence::{MemoryStore, SnapshotStore};
    use crate::state::session::SessionOptions;
    use pretty_assertions::assert_eq;

    struct Harness {
        handle: SessionHandle,
        deliveries: mpsc::UnboundedReceiver<Delivery>,
        finished: mpsc::UnboundedReceiver<SessionId>,
        store: Arc<MemoryStore>,
        saves: Arc<SaveQueue>,
    }

    fn harness(options: SessionOptions) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let saves = Arc::new(SaveQueue::start(store.clone(), 3));
        let (deliveries_tx, deliveries) = mpsc::unbounded_channel();
        let (finished_tx, finished) = mpsc::unbounded_channel();
        let clock = Clock::new();
        let context = ActorContext {
            clock,
            strategy: Arc::new(SimpleBot),
            saves: saves.clone(),
            deliveries: deliveries_tx,
            finished: finished_tx,
            tick: None,
            max_bot_actions: 8,
        };
        let session = Session::new("table".to_string(), options, clock.now());
        let (handle, _task) = spawn(session, context);
        Harness {
            handle,
            deliveries,
            finished,
            store,
            saves,
        }
    }

    fn options() -> SessionOptions {
        SessionOptions {
            turn_time_limit: Some(Duration::from_secs(60)),
            seed: Some(5),
            ..SessionOptions::default()
        }
    }

    async fn join(handle: &SessionHandle, name: &str, is_bot: bool) -> PlayerId {
        let command = SessionCommand::Join {
            name: name.to_string(),
            is_bot,
        };
        match handle.execute(command).await.unwrap() {
            Reply::Joined { player_id } => player_id,
            other => panic!("unexpected reply {other:?}"),
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Delivery>) -> Vec<&'static str> {
        let mut names = Vec::new();
        while let Ok(delivery) = rx.try_recv() {
            names.push(delivery.event.name());
        }
        names
    }

    #[tokio::test(start_paused = true)]
    async fn test_turn_timer_advances_turn() {
        let mut h = harness(options());
        join(&h.handle, "Ann", false).await;
        join(&h.handle, "Ben", false).await;
        h.handle.execute(SessionCommand::Start).await.unwrap();
        drain(&mut h.deliveries);

        tokio::time::sleep(Duration::from_secs(61)).await;

        // Ben now holds the turn
        let err = h
            .handle
            .execute(SessionCommand::EndTurn { player_id: 1 })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "not_your_turn");
        h.handle
            .execute(SessionCommand::EndTurn { player_id: 2 })
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_bot_plays_its_turn() {
        let mut h = harness(options());
        join(&h.handle, "Ann", false).await;
        join(&h.handle, "Robo", true).await;
        h.handle.execute(SessionCommand::Start).await.unwrap();

        h.handle
            .execute(SessionCommand::EndTurn { player_id: 1 })
            .await
            .unwrap();

        // The bot moved within the same step, so the turn is back with Ann
        h.handle
            .execute(SessionCommand::EndTurn { player_id: 1 })
            .await
            .unwrap();
        assert!(drain(&mut h.deliveries).contains(&"game_state"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_grace_expiry_opens_vote() {
        let mut h = harness(options());
        join(&h.handle, "Ann", false).await;
        join(&h.handle, "Ben", false).await;
        join(&h.handle, "Cat", false).await;
        h.handle.execute(SessionCommand::Start).await.unwrap();
        drain(&mut h.deliveries);

        h.handle
            .execute(SessionCommand::Disconnected {
                player_id: 1,
                raw_reason: "transport close".to_string(),
            })
            .await
            .unwrap();
        assert!(drain(&mut h.deliveries).contains(&"game_paused"));

        tokio::time::sleep(Duration::from_secs(200)).await;

        let events = drain(&mut h.deliveries);
        assert!(events.contains(&"grace_period_expired"), "{events:?}");
        assert!(events.contains(&"voting_progress"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_finished_session_is_reclaimed() {
        let mut h = harness(options());
        join(&h.handle, "Ann", false).await;
        join(&h.handle, "Robo", true).await;
        h.handle.execute(SessionCommand::Start).await.unwrap();
        h.saves.flush().await;
        assert!(h.store.load("table").unwrap().is_some());

        h.handle
            .execute(SessionCommand::Disconnected {
                player_id: 1,
                raw_reason: "closed".to_string(),
            })
            .await
            .unwrap();

        assert_eq!(h.finished.recv().await, Some("table".to_string()));
        let events = drain(&mut h.deliveries);
        assert!(events.contains(&"game_ended"), "{events:?}");

        h.saves.flush().await;
        assert!(h.store.load("table").unwrap().is_none());
        assert!(h.handle.execute(SessionCommand::Start).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_instant_change_is_saved() {
        let h = harness(options());
        join(&h.handle, "Ann", false).await;
        join(&h.handle, "Ben", false).await;
        h.handle.execute(SessionCommand::Start).await.unwrap();
        h.saves.flush().await;
        assert_eq!(h.store.load("table").unwrap().unwrap().current_player_index, 0);

        // Virtual time has not moved since the start
        h.handle
            .execute(SessionCommand::EndTurn { player_id: 1 })
            .await
            .unwrap();
        h.saves.flush().await;
        assert_eq!(h.store.load("table").unwrap().unwrap().current_player_index, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_view_reports_session() {
        let h = harness(options());
        let player_id = join(&h.handle, "Ann", false).await;

        let view = h.handle.player_view(player_id).await.unwrap();
        assert_eq!(view["session_id"], "table");
    }
}
