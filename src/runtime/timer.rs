//! Armed timers for one session.
//!
//! The session says which deadlines it wants; [`TimerSet::reconcile`] makes
//! the set of running sleeps match. A sleep that fires sends its key back to
//! the owning mailbox, where the session decides whether it still matters.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

use crate::state::elapsed_between;
use crate::state::session::{TimerKey, TimerRequest};

#[derive(Debug, Default)]
pub struct TimerSet {
    armed: HashMap<TimerKey, (DateTime<Utc>, JoinHandle<()>)>,
}

impl TimerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel timers that are no longer wanted and arm the new ones.
    ///
    /// Fired keys are delivered through `mailbox`; the set never keeps the
    /// mailbox alive on its own.
    pub fn reconcile<M>(
        &mut self,
        wanted: &[TimerRequest],
        now: DateTime<Utc>,
        mailbox: &mpsc::UnboundedSender<M>,
    ) where
        M: From<TimerKey> + Send + 'static,
    {
        self.armed.retain(|key, (deadline, handle)| {
            let keep = wanted
                .iter()
                .any(|r| r.key == *key && r.deadline == *deadline);
            if !keep {
                trace!(?key, "Timer cancelled");
                handle.abort();
            }
            keep
        });

        for request in wanted {
            if self.armed.contains_key(&request.key) {
                continue;
            }
            let key = request.key;
            let delay = elapsed_between(now, request.deadline);
            let mailbox = mailbox.downgrade();
            let handle = tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Some(mailbox) = mailbox.upgrade() {
                    let _ = mailbox.send(M::from(key));
                }
            });
            trace!(?key, ?delay, "Timer armed");
            self.armed.insert(key, (request.deadline, handle));
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, (_, handle)) in self.armed.drain() {
            handle.abort();
        }
    }

    pub fn is_armed(&self, key: &TimerKey) -> bool {
        self.armed.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.armed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.armed.is_empty()
    }
}

impl Drop for TimerSet {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Clock;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn request(key: TimerKey, clock: &Clock, secs: i64) -> TimerRequest {
        TimerRequest {
            key,
            deadline: clock.now() + chrono::Duration::seconds(secs),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_once_due() {
        let clock = Clock::new();
        let (tx, mut rx) = mpsc::unbounded_channel::<TimerKey>();
        let mut timers = TimerSet::new();

        let key = TimerKey::Turn { epoch: 3 };
        timers.reconcile(&[request(key, &clock, 30)], clock.now(), &tx);

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(rx.try_recv().unwrap(), key);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unwanted_timer_is_cancelled() {
        let clock = Clock::new();
        let (tx, mut rx) = mpsc::unbounded_channel::<TimerKey>();
        let mut timers = TimerSet::new();

        let turn = TimerKey::Turn { epoch: 1 };
        let grace = TimerKey::Grace { pause_id: 1 };
        timers.reconcile(&[request(turn, &clock, 10)], clock.now(), &tx);
        timers.reconcile(&[request(grace, &clock, 20)], clock.now(), &tx);

        assert!(!timers.is_armed(&turn));
        assert!(timers.is_armed(&grace));

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(rx.try_recv().unwrap(), grace);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_moved_deadline_rearms() {
        let clock = Clock::new();
        let (tx, mut rx) = mpsc::unbounded_channel::<TimerKey>();
        let mut timers = TimerSet::new();

        let key = TimerKey::Turn { epoch: 1 };
        timers.reconcile(&[request(key, &clock, 10)], clock.now(), &tx);
        timers.reconcile(&[request(key, &clock, 40)], clock.now(), &tx);
        assert_eq!(timers.len(), 1);

        tokio::time::sleep(Duration::from_secs(15)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(rx.try_recv().unwrap(), key);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all() {
        let clock = Clock::new();
        let (tx, mut rx) = mpsc::unbounded_channel::<TimerKey>();
        let mut timers = TimerSet::new();

        timers.reconcile(
            &[request(TimerKey::Turn { epoch: 1 }, &clock, 5)],
            clock.now(),
            &tx,
        );
        timers.cancel_all();
        assert!(timers.is_empty());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(rx.try_recv().is_err());
    }
}
