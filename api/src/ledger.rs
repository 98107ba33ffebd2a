//! Per-identity conversation sessions with a fixed-window request quota.
//!
//! Every identity gets one lazily created [`Session`]. The outer map lock is only
//! held to find or insert a session; the per-session mutex is held for the whole
//! reset → check → generate → record sequence, so two concurrent requests from
//! the same identity can never both pass the quota check.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use motorchat_core::auth::subject_fingerprint;
use motorchat_core::chat::{ChatMessage, Role};
use tokio::sync::{Mutex, RwLock};

use crate::backend::{CompletionBackend, GenerationError};

/// Upper bound on stored messages per session, system seed included.
pub const MAX_HISTORY: usize = 10;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a thorough automotive information and \
troubleshooting assistant. Diagnose the car problems users describe, explain likely causes, \
suggest fixes and walk through simple repairs step by step, and say clearly when a \
professional mechanic is needed. Answer questions about makes, models, engines, \
transmissions, suspension, fuel economy, performance and safety features. Give maintenance \
checklists and seasonal care advice, help compare vehicles for the user's needs and budget, \
outline general traffic, inspection and insurance topics, and cover electric and hybrid \
vehicles, eco-friendly driving and industry trends. Keep answers clear, concise and friendly, \
explain technical terms, and always put the user's safety first. If a question is not about \
cars, politely steer the conversation back to cars.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaPolicy {
    pub limit: u32,
    pub window: Duration,
}

impl Default for QuotaPolicy {
    fn default() -> Self {
        Self {
            limit: 5,
            window: Duration::hours(24),
        }
    }
}

/// Source of the current time. Read once the session lock is held.
pub trait Clock: Send {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

impl Clock for DateTime<Utc> {
    fn now(&self) -> DateTime<Utc> {
        *self
    }
}

#[derive(Debug)]
struct Session {
    history: Vec<ChatMessage>,
    request_count: u32,
    window_start: DateTime<Utc>,
}

impl Session {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            history: Vec::new(),
            request_count: 0,
            window_start: now,
        }
    }

    /// Start a fresh window once the current one has fully elapsed.
    fn roll_window(&mut self, policy: &QuotaPolicy, now: DateTime<Utc>) -> bool {
        if now - self.window_start >= policy.window {
            self.request_count = 0;
            self.window_start = now;
            return true;
        }
        false
    }

    fn reset_time(&self, policy: &QuotaPolicy) -> DateTime<Utc> {
        self.window_start + policy.window
    }
}

#[cfg(test)]
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub history: Vec<ChatMessage>,
    pub request_count: u32,
    pub window_start: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExchangeOutcome {
    Reply {
        message: String,
        remaining_requests: u32,
        reset_time: DateTime<Utc>,
    },
    QuotaExceeded {
        reset_time: DateTime<Utc>,
    },
}

pub struct SessionLedger {
    backend: Arc<dyn CompletionBackend>,
    policy: QuotaPolicy,
    system_prompt: String,
    sessions: RwLock<HashMap<String, Arc<Mutex<Session>>>>,
}

impl SessionLedger {
    pub fn new(
        backend: Arc<dyn CompletionBackend>,
        policy: QuotaPolicy,
        system_prompt: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            policy,
            system_prompt: system_prompt.into(),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> QuotaPolicy {
        self.policy
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    #[cfg(test)]
    pub async fn snapshot(&self, identity_id: &str) -> Option<SessionSnapshot> {
        let handle = self.sessions.read().await.get(identity_id).cloned()?;
        let session = handle.lock().await;
        Some(SessionSnapshot {
            history: session.history.clone(),
            request_count: session.request_count,
            window_start: session.window_start,
        })
    }

    async fn session(&self, identity_id: &str, now: DateTime<Utc>) -> Arc<Mutex<Session>> {
        if let Some(existing) = self.sessions.read().await.get(identity_id) {
            return existing.clone();
        }
        self.sessions
            .write()
            .await
            .entry(identity_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Session::new(now))))
            .clone()
    }

    /// Run one quota-checked exchange for an already verified identity.
    ///
    /// A quota rejection touches neither the counter nor the history. A backend
    /// failure leaves the user turn in the history but does not count against
    /// the quota. The window is judged by the clock as read after the session
    /// lock is acquired, so a request queued behind a slow one sees the real time.
    pub async fn exchange(
        &self,
        identity_id: &str,
        message: String,
        clock: impl Clock,
    ) -> Result<ExchangeOutcome, GenerationError> {
        let subject = subject_fingerprint(identity_id);
        let handle = self.session(identity_id, clock.now()).await;
        let mut session = handle.lock().await;
        let now = clock.now();

        if session.roll_window(&self.policy, now) {
            tracing::debug!(subject = %subject, "quota window reset");
        }
        let reset_time = session.reset_time(&self.policy);

        if session.request_count >= self.policy.limit {
            tracing::info!(
                subject = %subject,
                request_count = session.request_count,
                reset_time = %reset_time,
                "quota exceeded"
            );
            return Ok(ExchangeOutcome::QuotaExceeded { reset_time });
        }

        if session.history.is_empty() {
            session
                .history
                .push(ChatMessage::system(self.system_prompt.as_str()));
        }
        session.history.push(ChatMessage::user(message));
        // Also bounds the history a run of failed generations leaves behind.
        trim_history(&mut session.history);

        let reply = self.backend.complete(&session.history).await?;

        session.history.push(ChatMessage::assistant(reply.as_str()));
        trim_history(&mut session.history);
        session.request_count += 1;

        let remaining_requests = self.policy.limit.saturating_sub(session.request_count);
        tracing::info!(
            subject = %subject,
            request_count = session.request_count,
            remaining_requests,
            history_len = session.history.len(),
            "exchange completed"
        );

        Ok(ExchangeOutcome::Reply {
            message: reply,
            remaining_requests,
            reset_time,
        })
    }
}

/// Drop the oldest turns beyond [`MAX_HISTORY`], keeping a leading system seed in place.
fn trim_history(history: &mut Vec<ChatMessage>) {
    if history.len() <= MAX_HISTORY {
        return;
    }
    let pinned = usize::from(history.first().is_some_and(|m| m.role == Role::System));
    let excess = history.len() - MAX_HISTORY;
    history.drain(pinned..pinned + excess);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ManualClock, ScriptedBackend};
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 9, 23, 8, 0, 0).unwrap()
    }

    fn ledger(backend: Arc<ScriptedBackend>, policy: QuotaPolicy) -> Arc<SessionLedger> {
        Arc::new(SessionLedger::new(backend, policy, "You only talk about cars."))
    }

    async fn reply(ledger: &SessionLedger, id: &str, msg: &str, now: DateTime<Utc>) -> u32 {
        match ledger.exchange(id, msg.to_string(), now).await.unwrap() {
            ExchangeOutcome::Reply {
                remaining_requests, ..
            } => remaining_requests,
            other => panic!("expected reply, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn first_exchange_seeds_system_prompt() {
        let backend = Arc::new(ScriptedBackend::new());
        let ledger = ledger(backend.clone(), QuotaPolicy::default());

        let outcome = ledger
            .exchange("U1", "My engine knocks".to_string(), t0())
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ExchangeOutcome::Reply {
                message: "reply #1".to_string(),
                remaining_requests: 4,
                reset_time: t0() + Duration::hours(24),
            }
        );

        let seen = backend.requests();
        assert_eq!(seen.len(), 1);
        assert_eq!(
            seen[0],
            vec![
                ChatMessage::system("You only talk about cars."),
                ChatMessage::user("My engine knocks"),
            ]
        );

        let snapshot = ledger.snapshot("U1").await.unwrap();
        assert_eq!(snapshot.history.len(), 3);
        assert_eq!(snapshot.history[2], ChatMessage::assistant("reply #1"));
        assert_eq!(snapshot.request_count, 1);
    }

    #[tokio::test]
    async fn sixth_request_hits_quota_without_side_effects() {
        let backend = Arc::new(ScriptedBackend::new());
        let ledger = ledger(backend.clone(), QuotaPolicy::default());

        let mut remaining = Vec::new();
        for i in 0..5 {
            let now = t0() + Duration::minutes(i);
            remaining.push(reply(&ledger, "U1", "question", now).await);
        }
        assert_eq!(remaining, vec![4, 3, 2, 1, 0]);
        let after_fifth = ledger.snapshot("U1").await.unwrap();

        let outcome = ledger
            .exchange("U1", "one more".to_string(), t0() + Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ExchangeOutcome::QuotaExceeded {
                reset_time: t0() + Duration::hours(24)
            }
        );
        assert_eq!(ledger.snapshot("U1").await.unwrap(), after_fifth);
        assert_eq!(backend.calls(), 5);
    }

    #[tokio::test]
    async fn rejected_calls_are_idempotent() {
        let backend = Arc::new(ScriptedBackend::new());
        let ledger = ledger(
            backend.clone(),
            QuotaPolicy {
                limit: 2,
                window: Duration::hours(24),
            },
        );
        reply(&ledger, "U1", "a", t0()).await;
        reply(&ledger, "U1", "b", t0()).await;
        let before = ledger.snapshot("U1").await.unwrap();

        for i in 0..10 {
            let outcome = ledger
                .exchange("U1", format!("spam {i}"), t0() + Duration::minutes(i))
                .await
                .unwrap();
            assert!(matches!(outcome, ExchangeOutcome::QuotaExceeded { .. }));
        }
        assert_eq!(ledger.snapshot("U1").await.unwrap(), before);
        assert_eq!(backend.calls(), 2);
    }

    #[tokio::test]
    async fn history_stays_bounded_and_keeps_the_seed() {
        let backend = Arc::new(ScriptedBackend::new());
        let ledger = ledger(
            backend.clone(),
            QuotaPolicy {
                limit: 100,
                window: Duration::hours(24),
            },
        );

        for i in 0..20 {
            reply(&ledger, "U1", &format!("turn {i}"), t0()).await;
            let snapshot = ledger.snapshot("U1").await.unwrap();
            assert!(snapshot.history.len() <= MAX_HISTORY);
            assert_eq!(snapshot.history[0].role, Role::System);
        }

        let snapshot = ledger.snapshot("U1").await.unwrap();
        assert_eq!(snapshot.history.len(), MAX_HISTORY);
        assert_eq!(snapshot.history[MAX_HISTORY - 1], ChatMessage::assistant("reply #20"));
        assert_eq!(snapshot.history[MAX_HISTORY - 2], ChatMessage::user("turn 19"));
        // Seed plus nine turns; the first non-seed entry is the tail of an older exchange.
        assert_eq!(snapshot.history[1], ChatMessage::assistant("reply #16"));
    }

    #[test]
    fn trim_without_seed_drops_from_front() {
        let mut history: Vec<ChatMessage> =
            (0..12).map(|i| ChatMessage::user(format!("m{i}"))).collect();
        trim_history(&mut history);
        assert_eq!(history.len(), MAX_HISTORY);
        assert_eq!(history[0], ChatMessage::user("m2"));
    }

    #[tokio::test]
    async fn window_resets_exactly_at_period_boundary() {
        let backend = Arc::new(ScriptedBackend::new());
        let ledger = ledger(backend.clone(), QuotaPolicy::default());
        let period = QuotaPolicy::default().window;

        reply(&ledger, "U1", "first", t0()).await;

        reply(&ledger, "U1", "almost", t0() + period - Duration::milliseconds(1)).await;
        let snapshot = ledger.snapshot("U1").await.unwrap();
        assert_eq!(snapshot.request_count, 2);
        assert_eq!(snapshot.window_start, t0());

        let remaining = reply(&ledger, "U1", "boundary", t0() + period).await;
        let snapshot = ledger.snapshot("U1").await.unwrap();
        assert_eq!(snapshot.request_count, 1);
        assert_eq!(snapshot.window_start, t0() + period);
        assert_eq!(remaining, 4);
    }

    #[tokio::test]
    async fn exhausted_quota_recovers_in_next_window() {
        let backend = Arc::new(ScriptedBackend::new());
        let ledger = ledger(
            backend,
            QuotaPolicy {
                limit: 1,
                window: Duration::hours(24),
            },
        );
        reply(&ledger, "U1", "a", t0()).await;
        let blocked = ledger
            .exchange("U1", "b".to_string(), t0() + Duration::hours(23))
            .await
            .unwrap();
        assert!(matches!(blocked, ExchangeOutcome::QuotaExceeded { .. }));
        assert_eq!(reply(&ledger, "U1", "c", t0() + Duration::hours(24)).await, 0);
    }

    #[tokio::test]
    async fn failed_generation_keeps_user_turn_but_not_count() {
        let backend = Arc::new(ScriptedBackend::new());
        let ledger = ledger(backend.clone(), QuotaPolicy::default());

        backend.fail_next(true);
        let err = ledger
            .exchange("U1", "Why is my brake pedal soft?".to_string(), t0())
            .await
            .unwrap_err();
        assert!(matches!(err, GenerationError::Malformed(_)));

        let snapshot = ledger.snapshot("U1").await.unwrap();
        assert_eq!(snapshot.request_count, 0);
        assert_eq!(
            snapshot.history,
            vec![
                ChatMessage::system("You only talk about cars."),
                ChatMessage::user("Why is my brake pedal soft?"),
            ]
        );

        backend.fail_next(false);
        assert_eq!(reply(&ledger, "U1", "Still soft", t0()).await, 4);
        let snapshot = ledger.snapshot("U1").await.unwrap();
        assert_eq!(snapshot.history.len(), 4);
        assert_eq!(snapshot.history[2], ChatMessage::user("Still soft"));
    }

    #[tokio::test]
    async fn repeated_failures_keep_history_and_backend_payload_bounded() {
        let backend = Arc::new(ScriptedBackend::new());
        let ledger = ledger(backend.clone(), QuotaPolicy::default());

        backend.fail_next(true);
        for i in 0..25 {
            let result = ledger
                .exchange("U1", format!("attempt {i}"), t0())
                .await;
            assert!(result.is_err());
        }

        let snapshot = ledger.snapshot("U1").await.unwrap();
        assert_eq!(snapshot.request_count, 0);
        assert_eq!(snapshot.history.len(), MAX_HISTORY);
        assert_eq!(snapshot.history[0].role, Role::System);
        assert_eq!(snapshot.history[MAX_HISTORY - 1], ChatMessage::user("attempt 24"));
        assert!(backend.requests().iter().all(|sent| sent.len() <= MAX_HISTORY));

        backend.fail_next(false);
        assert_eq!(reply(&ledger, "U1", "working again?", t0()).await, 4);
        let sent = backend.requests();
        let last = sent.last().unwrap();
        assert_eq!(last.len(), MAX_HISTORY);
        assert_eq!(last[MAX_HISTORY - 1], ChatMessage::user("working again?"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn queued_request_judges_window_at_lock_time() {
        let backend = Arc::new(ScriptedBackend::with_delay(std::time::Duration::from_millis(150)));
        let policy = QuotaPolicy {
            limit: 2,
            window: Duration::hours(1),
        };
        let ledger = ledger(backend.clone(), policy);
        let clock = ManualClock::starting_at(t0());
        reply(&ledger, "U1", "first", t0()).await;

        let slow = tokio::spawn({
            let (ledger, clock) = (ledger.clone(), clock.clone());
            async move { ledger.exchange("U1", "second".to_string(), clock).await }
        });
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        let queued = tokio::spawn({
            let (ledger, clock) = (ledger.clone(), clock.clone());
            async move { ledger.exchange("U1", "third".to_string(), clock).await }
        });
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        clock.set(t0() + policy.window);

        assert!(matches!(
            slow.await.unwrap().unwrap(),
            ExchangeOutcome::Reply { remaining_requests: 0, .. }
        ));
        assert_eq!(
            queued.await.unwrap().unwrap(),
            ExchangeOutcome::Reply {
                message: "reply #3".to_string(),
                remaining_requests: 1,
                reset_time: t0() + policy.window * 2,
            }
        );
        let snapshot = ledger.snapshot("U1").await.unwrap();
        assert_eq!(snapshot.window_start, t0() + policy.window);
        assert_eq!(snapshot.request_count, 1);
    }

    #[tokio::test]
    async fn sessions_are_independent_per_identity() {
        let backend = Arc::new(ScriptedBackend::new());
        let ledger = ledger(
            backend,
            QuotaPolicy {
                limit: 1,
                window: Duration::hours(24),
            },
        );
        reply(&ledger, "U1", "a", t0()).await;
        assert_eq!(reply(&ledger, "U2", "b", t0()).await, 0);
        assert_eq!(ledger.session_count().await, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_requests_at_limit_admit_exactly_one() {
        let backend = Arc::new(ScriptedBackend::with_delay(std::time::Duration::from_millis(50)));
        let ledger = ledger(backend.clone(), QuotaPolicy::default());
        for _ in 0..4 {
            reply(&ledger, "U1", "warm up", t0()).await;
        }

        let a = tokio::spawn({
            let ledger = ledger.clone();
            async move { ledger.exchange("U1", "left".to_string(), t0()).await }
        });
        let b = tokio::spawn({
            let ledger = ledger.clone();
            async move { ledger.exchange("U1", "right".to_string(), t0()).await }
        });
        let outcomes = [a.await.unwrap().unwrap(), b.await.unwrap().unwrap()];

        let replies = outcomes
            .iter()
            .filter(|o| matches!(o, ExchangeOutcome::Reply { .. }))
            .count();
        let rejected = outcomes
            .iter()
            .filter(|o| matches!(o, ExchangeOutcome::QuotaExceeded { .. }))
            .count();
        assert_eq!((replies, rejected), (1, 1));
        assert_eq!(ledger.snapshot("U1").await.unwrap().request_count, 5);
        assert_eq!(backend.calls(), 5);
    }
}
