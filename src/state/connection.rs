//! Connection status tracking.
//!
//! Each seat has a connection record with its own state machine, independent
//! of the turn state. Transport disconnect signals are classified using the
//! connection's recent quality, and that classification drives how long the
//! seat is held open for reconnection.
//!
//! # State Diagram
//!
//! ```text
//! ┌───────────┐ disconnect ┌───────────────┐ attempt ┌──────────────┐
//! │ Connected │───────────▶│ Disconnecting │────────▶│ Reconnecting │
//! └───────────┘            └───────┬───────┘         └──────┬───────┘
//!       ▲                          │ grace expired          │
//!       │                          ▼                        │
//!       │                  ┌──────────────┐   failed        │
//!       │                  │ Disconnected │◀────────────────┤
//!       │                  └──────┬───────┘                 │
//!       │                         │ late attempt            │
//!       │                         └──────▶ Reconnecting     │
//!       └───────────────────────────────────────────────────┘
//!                               success
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::game::PlayerId;
use super::to_chrono;

/// Default grace period for a stable desktop connection (30 seconds).
pub const DEFAULT_BASE_GRACE_PERIOD: Duration = Duration::from_secs(30);

/// Longest grace period any connection receives (2 minutes).
pub const DEFAULT_MAX_GRACE_PERIOD: Duration = Duration::from_secs(120);

/// Latency under which a connection counts as good.
pub const GOOD_LATENCY_MS: u32 = 150;

/// Latency under which a connection counts as fair.
pub const FAIR_LATENCY_MS: u32 = 400;

/// Connection status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionStatus {
    /// Actively connected
    Connected,
    /// Transport dropped, seat held open
    Disconnecting,
    /// Reconnect attempt in progress
    Reconnecting,
    /// Grace period over or reconnect failed
    Disconnected,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connected => "CONNECTED",
            Self::Disconnecting => "DISCONNECTING",
            Self::Reconnecting => "RECONNECTING",
            Self::Disconnected => "DISCONNECTED",
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Whether the state machine defines `self -> to`.
    pub fn can_transition_to(&self, to: ConnectionStatus) -> bool {
        use ConnectionStatus::*;
        matches!(
            (self, to),
            (Connected, Disconnecting)
                | (Disconnecting, Reconnecting)
                | (Disconnecting, Disconnected)
                | (Reconnecting, Connected)
                | (Reconnecting, Disconnected)
                | (Disconnected, Reconnecting)
        )
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classified cause of a transport disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DisconnectReason {
    NetworkInstability,
    ConnectionLost,
    IntentionalDisconnect,
    NetworkTimeout,
    ServerShutdown,
    MobileInterruption,
    UnknownDisconnect,
}

impl DisconnectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NetworkInstability => "NETWORK_INSTABILITY",
            Self::ConnectionLost => "CONNECTION_LOST",
            Self::IntentionalDisconnect => "INTENTIONAL_DISCONNECT",
            Self::NetworkTimeout => "NETWORK_TIMEOUT",
            Self::ServerShutdown => "SERVER_SHUTDOWN",
            Self::MobileInterruption => "MOBILE_INTERRUPTION",
            Self::UnknownDisconnect => "UNKNOWN_DISCONNECT",
        }
    }

    /// Classify a raw transport reason using the connection's prior quality.
    pub fn classify(raw: &str, quality: ConnectionQuality, is_mobile: bool) -> Self {
        let raw = raw.to_ascii_lowercase();
        let transport_failure = raw.contains("transport error") || raw.contains("transport close");

        if raw.contains("transport error") && quality == ConnectionQuality::Poor {
            Self::NetworkInstability
        } else if raw.contains("client disconnect") || raw.contains("intentional") {
            Self::IntentionalDisconnect
        } else if raw.contains("server disconnect") || raw.contains("shutdown") {
            Self::ServerShutdown
        } else if raw.contains("timeout") {
            Self::NetworkTimeout
        } else if transport_failure && is_mobile {
            Self::MobileInterruption
        } else if transport_failure {
            Self::ConnectionLost
        } else {
            Self::UnknownDisconnect
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection quality derived from latency samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionQuality {
    #[default]
    Unknown,
    Good,
    Fair,
    Poor,
}

impl ConnectionQuality {
    pub fn from_latency(latency_ms: u32) -> Self {
        if latency_ms < GOOD_LATENCY_MS {
            Self::Good
        } else if latency_ms < FAIR_LATENCY_MS {
            Self::Fair
        } else {
            Self::Poor
        }
    }
}

/// One entry in a record's status history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    pub from: ConnectionStatus,
    pub to: ConnectionStatus,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// Error when a connection transition is not in the state machine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid connection transition for player {player_id} from {from} to {to}: {reason}")]
pub struct InvalidTransition {
    pub player_id: PlayerId,
    pub from: ConnectionStatus,
    pub to: ConnectionStatus,
    pub reason: &'static str,
}

/// How long a dropped seat is held, by connection profile.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GracePolicy {
    pub base: Duration,
    pub mobile_multiplier: f64,
    pub poor_quality_multiplier: f64,
    pub max: Duration,
}

impl Default for GracePolicy {
    fn default() -> Self {
        Self {
            base: DEFAULT_BASE_GRACE_PERIOD,
            mobile_multiplier: 2.0,
            poor_quality_multiplier: 1.5,
            max: DEFAULT_MAX_GRACE_PERIOD,
        }
    }
}

impl GracePolicy {
    /// Grace period for a record. Mobile and poor-quality connections get
    /// longer windows than stable desktop ones.
    pub fn duration_for(&self, record: &ConnectionRecord) -> Duration {
        let mut factor = 1.0;
        if record.is_mobile {
            factor *= self.mobile_multiplier;
        }
        let unstable = record.quality == ConnectionQuality::Poor
            || record.last_reason == Some(DisconnectReason::NetworkInstability);
        if unstable {
            factor *= self.poor_quality_multiplier;
        }
        let secs = self.base.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.max.as_secs_f64() {
            return self.max;
        }
        Duration::try_from_secs_f64(secs).map_or(self.max, |d| d.min(self.max))
    }
}

/// Connection state for a single seat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub player_id: PlayerId,
    pub status: ConnectionStatus,
    pub is_mobile: bool,
    pub is_bot: bool,
    pub quality: ConnectionQuality,
    /// Most recent latency sample
    pub latency_ms: Option<u32>,
    /// Classification of the most recent disconnect
    pub last_reason: Option<DisconnectReason>,
    /// Bumped on every disconnect; guards stale reconnect-window timers
    pub disconnect_seq: u64,
    /// When the seat stops being held, while disconnecting or reconnecting
    pub grace_deadline: Option<DateTime<Utc>>,
    pub reconnect_attempts: u32,
    /// Append-only
    history: Vec<StatusChange>,
}

impl ConnectionRecord {
    pub fn new(player_id: PlayerId) -> Self {
        Self {
            player_id,
            status: ConnectionStatus::Connected,
            is_mobile: false,
            is_bot: false,
            quality: ConnectionQuality::Unknown,
            latency_ms: None,
            last_reason: None,
            disconnect_seq: 0,
            grace_deadline: None,
            reconnect_attempts: 0,
            history: Vec::new(),
        }
    }

    pub fn new_bot(player_id: PlayerId) -> Self {
        Self {
            is_bot: true,
            ..Self::new(player_id)
        }
    }

    pub fn history(&self) -> &[StatusChange] {
        &self.history
    }

    /// Apply a transition, appending to history. Rejected transitions leave
    /// the record untouched.
    pub fn transition(
        &mut self,
        to: ConnectionStatus,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(to) {
            warn!(
                player_id = self.player_id,
                from = %self.status,
                to = %to,
                "Rejected connection transition"
            );
            return Err(InvalidTransition {
                player_id: self.player_id,
                from: self.status,
                to,
                reason: "transition not defined by the connection state machine",
            });
        }

        debug!(player_id = self.player_id, from = %self.status, to = %to, reason, "Connection transition");
        self.history.push(StatusChange {
            from: self.status,
            to,
            reason: reason.to_string(),
            at: now,
        });
        self.status = to;
        Ok(())
    }

    /// Handle a transport disconnect: classify it and start holding the seat.
    pub fn disconnect(
        &mut self,
        raw_reason: &str,
        policy: &GracePolicy,
        now: DateTime<Utc>,
    ) -> Result<DisconnectReason, InvalidTransition> {
        let reason = DisconnectReason::classify(raw_reason, self.quality, self.is_mobile);
        self.transition(ConnectionStatus::Disconnecting, reason.as_str(), now)?;

        self.last_reason = Some(reason);
        self.disconnect_seq += 1;
        self.reconnect_attempts = 0;
        self.grace_deadline = Some(now + to_chrono(policy.duration_for(self)));
        Ok(reason)
    }

    /// A reconnect attempt arrived.
    pub fn begin_reconnect(&mut self, attempt: u32, now: DateTime<Utc>) -> Result<(), InvalidTransition> {
        self.transition(
            ConnectionStatus::Reconnecting,
            &format!("reconnect attempt {}", attempt),
            now,
        )?;
        self.reconnect_attempts = attempt;
        Ok(())
    }

    /// The reconnect attempt succeeded.
    pub fn complete_reconnect(&mut self, now: DateTime<Utc>) -> Result<(), InvalidTransition> {
        self.transition(ConnectionStatus::Connected, "reconnected", now)?;
        self.grace_deadline = None;
        Ok(())
    }

    /// Give up on the seat: grace expired or the reconnect failed.
    pub fn expire(&mut self, reason: &str, now: DateTime<Utc>) -> Result<(), InvalidTransition> {
        self.transition(ConnectionStatus::Disconnected, reason, now)?;
        self.grace_deadline = None;
        Ok(())
    }

    /// Record a latency sample from the transport.
    pub fn record_metrics(&mut self, latency_ms: u32, is_mobile: bool) {
        self.latency_ms = Some(latency_ms);
        self.quality = ConnectionQuality::from_latency(latency_ms);
        self.is_mobile = is_mobile;
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "player_id": self.player_id,
            "status": self.status.as_str(),
            "is_mobile": self.is_mobile,
            "is_bot": self.is_bot,
            "quality": self.quality,
            "last_reason": self.last_reason.map(|r| r.as_str()),
            "grace_deadline": self.grace_deadline
        })
    }
}

/// Connection records for every seat of one session.
#[derive(Debug, Clone, Default)]
pub struct ConnectionTracker {
    records: BTreeMap<PlayerId, ConnectionRecord>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, record: ConnectionRecord) {
        self.records.insert(record.player_id, record);
    }

    pub fn get(&self, player_id: PlayerId) -> Option<&ConnectionRecord> {
        self.records.get(&player_id)
    }

    pub fn get_mut(&mut self, player_id: PlayerId) -> Option<&mut ConnectionRecord> {
        self.records.get_mut(&player_id)
    }

    pub fn status(&self, player_id: PlayerId) -> Option<ConnectionStatus> {
        self.records.get(&player_id).map(|r| r.status)
    }

    pub fn records(&self) -> impl Iterator<Item = &ConnectionRecord> {
        self.records.values()
    }

    /// Connected human seats, in seat-id order.
    pub fn connected_humans(&self) -> Vec<PlayerId> {
        self.records
            .values()
            .filter(|r| !r.is_bot && r.status.is_connected())
            .map(|r| r.player_id)
            .collect()
    }

    /// Human seats not currently connected.
    pub fn absent_humans(&self) -> Vec<PlayerId> {
        self.records
            .values()
            .filter(|r| !r.is_bot && !r.status.is_connected())
            .map(|r| r.player_id)
            .collect()
    }

    pub fn human_count(&self) -> usize {
        self.records.values().filter(|r| !r.is_bot).count()
    }

    pub fn bot_count(&self) -> usize {
        self.records.values().filter(|r| r.is_bot).count()
    }

    /// True when no human seat is connected or still within its grace window.
    pub fn all_humans_gone(&self) -> bool {
        self.records
            .values()
            .filter(|r| !r.is_bot)
            .all(|r| r.status == ConnectionStatus::Disconnected)
    }

    /// Hand a record over to a bot. Bots are always connected, so the seat
    /// is marked connected whatever state the human left it in.
    pub fn mark_bot(&mut self, player_id: PlayerId, now: DateTime<Utc>) {
        let Some(record) = self.records.get_mut(&player_id) else {
            return;
        };
        record.is_bot = true;
        record.grace_deadline = None;
        const REASON: &str = "seat taken over by bot";
        if matches!(
            record.status,
            ConnectionStatus::Disconnecting | ConnectionStatus::Disconnected
        ) {
            // Both edges exist in the machine, so neither can fail.
            let _ = record.transition(ConnectionStatus::Reconnecting, REASON, now);
        }
        if record.status == ConnectionStatus::Reconnecting {
            let _ = record.transition(ConnectionStatus::Connected, REASON, now);
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Array(self.records.values().map(|r| r.to_json()).collect())
    }
}
