// SPDX-License-Identifier: Apache-2.0
//! The event-stream broker: a bounded, single-producer-biased queue shared
//! by competing event consumers, plus a broadcast-style result-waiter path
//! for callers that only care about the terminal outcome.
//!
//! The queue itself is a plain `VecDeque` behind a `std::sync::Mutex` rather
//! than a channel — channels don't support evicting the oldest element, and
//! `drop_oldest` needs exactly that. `push`/`push_async` stay fully
//! synchronous (no `.await` inside the critical section) the way the source
//! contract describes them; only `result()` and the owner/attached-task
//! monitors suspend.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::{watch, Notify};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::warn;

use crate::message::Message;
use crate::Event;

/// What to do when `push`/`complete`/`error` would exceed `capacity`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropStrategy {
    /// Evict the oldest buffered event to make room.
    DropOldest,
    /// Reject the newcomer; the queue's head is unchanged.
    DropNewest,
    /// Reject the newcomer and report it to the caller.
    Error,
}

#[derive(Debug, Clone)]
pub struct EventStreamConfig {
    pub capacity: usize,
    pub drop_strategy: DropStrategy,
    /// Cancel the stream with reason `"timeout"` if no terminal event is
    /// produced within this long. `None` disables the idle timeout.
    pub idle_timeout: Option<Duration>,
}

impl Default for EventStreamConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            drop_strategy: DropStrategy::Error,
            idle_timeout: None,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PushError {
    #[error("event queue overflow")]
    Overflow,
    #[error("stream already terminated")]
    Closed,
}

/// Outcome of a `result()` wait.
#[derive(Debug, Clone)]
pub enum ResultOutcome {
    Completed(Vec<Message>),
    Error {
        reason: String,
        partial: Option<Value>,
    },
    Canceled {
        reason: String,
    },
    Timeout,
    StreamNotFound,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Stats {
    pub queue_size: usize,
    pub max_queue: usize,
    pub dropped: u64,
}

#[derive(Clone)]
enum TerminalOutcome {
    Completed(Vec<Message>),
    Error(String, Option<Value>),
    Canceled(String),
}

impl From<TerminalOutcome> for ResultOutcome {
    fn from(t: TerminalOutcome) -> Self {
        match t {
            TerminalOutcome::Completed(m) => ResultOutcome::Completed(m),
            TerminalOutcome::Error(reason, partial) => ResultOutcome::Error { reason, partial },
            TerminalOutcome::Canceled(reason) => ResultOutcome::Canceled { reason },
        }
    }
}

struct Inner {
    queue: VecDeque<Event>,
    capacity: usize,
    drop_strategy: DropStrategy,
    dropped: u64,
    outcome: Option<TerminalOutcome>,
    monitor_generation: u64,
    attached_abort: Option<AbortHandle>,
}

/// A per-loop-invocation event broker. Cheap to clone — every clone shares
/// the same underlying queue and terminal state.
#[derive(Clone)]
pub struct EventStream {
    inner: Arc<Mutex<Inner>>,
    notify: Arc<Notify>,
    terminal_tx: Arc<watch::Sender<Option<TerminalOutcome>>>,
    terminal_rx: watch::Receiver<Option<TerminalOutcome>>,
    idle_notify: Arc<Notify>,
}

impl EventStream {
    pub fn new(config: EventStreamConfig) -> Self {
        Self::with_owner(config, None)
    }

    /// `owner`, if supplied, is a task whose completion (success, panic, or
    /// abort) cancels the stream with reason `"owner_down"`.
    pub fn with_owner(config: EventStreamConfig, owner: Option<JoinHandle<()>>) -> Self {
        let (terminal_tx, terminal_rx) = watch::channel(None);
        let stream = Self {
            inner: Arc::new(Mutex::new(Inner {
                queue: VecDeque::new(),
                capacity: config.capacity,
                drop_strategy: config.drop_strategy,
                dropped: 0,
                outcome: None,
                monitor_generation: 0,
                attached_abort: None,
            })),
            notify: Arc::new(Notify::new()),
            terminal_tx: Arc::new(terminal_tx),
            terminal_rx,
            idle_notify: Arc::new(Notify::new()),
        };

        if let Some(owner) = owner {
            let this = stream.clone();
            tokio::spawn(async move {
                let _ = owner.await;
                this.cancel("owner_down");
            });
        }

        if let Some(timeout) = config.idle_timeout {
            let this = stream.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(timeout) => {
                        this.cancel("timeout");
                    }
                    _ = this.idle_notify.notified() => {}
                }
            });
        }

        stream
    }

    /// Register the one subordinate task whose abnormal exit is a fatal
    /// stream error. Re-attaching replaces the previous monitor — the old
    /// task's death no longer affects the stream.
    pub fn attach_task(&self, handle: JoinHandle<()>) {
        let abort_handle = handle.abort_handle();
        let generation = {
            let mut inner = self.inner.lock().unwrap();
            inner.monitor_generation += 1;
            inner.attached_abort = Some(abort_handle);
            inner.monitor_generation
        };

        let this = self.clone();
        tokio::spawn(async move {
            let result = handle.await;
            let still_current = {
                let inner = this.inner.lock().unwrap();
                inner.monitor_generation == generation
            };
            if !still_current {
                return;
            }
            if let Err(join_err) = result {
                if join_err.is_cancelled() {
                    // We killed it ourselves via cancel(); not a crash.
                    return;
                }
                warn!(error = %join_err, "attached task crashed; failing stream");
                this.error(&format!("task_crashed: {join_err}"), None);
            }
        });
    }

    /// Synchronous, immediate push. Returns `Overflow` under the `Error`
    /// drop strategy when the queue is full, or `Closed` once a terminal
    /// event has already been produced.
    pub fn push(&self, event: Event) -> Result<(), PushError> {
        let mut inner = self.inner.lock().unwrap();
        Self::enqueue(&mut inner, event).map(|_| ())
    }

    /// Fire-and-forget push: drops silently on overflow or on a closed
    /// stream.
    pub fn push_async(&self, event: Event) {
        let mut inner = self.inner.lock().unwrap();
        let _ = Self::enqueue(&mut inner, event);
        drop(inner);
        self.notify.notify_waiters();
    }

    fn enqueue(inner: &mut Inner, event: Event) -> Result<bool, PushError> {
        if inner.outcome.is_some() {
            return Err(PushError::Closed);
        }
        if inner.queue.len() >= inner.capacity {
            match inner.drop_strategy {
                DropStrategy::DropOldest => {
                    inner.queue.pop_front();
                    inner.dropped += 1;
                    inner.queue.push_back(event);
                    Ok(true)
                }
                DropStrategy::DropNewest => {
                    inner.dropped += 1;
                    Ok(true)
                }
                DropStrategy::Error => {
                    inner.dropped += 1;
                    Err(PushError::Overflow)
                }
            }
        } else {
            inner.queue.push_back(event);
            Ok(true)
        }
    }

    /// Push `event`, evicting the oldest buffered item if necessary — the
    /// terminal event is always delivered regardless of drop strategy.
    fn enqueue_terminal(inner: &mut Inner, event: Event) {
        if inner.queue.len() >= inner.capacity {
            inner.queue.pop_front();
            inner.dropped += 1;
        }
        inner.queue.push_back(event);
    }

    fn finish(&self, outcome: TerminalOutcome, event: Event) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.outcome.is_some() {
                return; // first terminal call wins
            }
            inner.outcome = Some(outcome.clone());
            Self::enqueue_terminal(&mut inner, event);
        }
        self.notify.notify_waiters();
        self.idle_notify.notify_waiters();
        let _ = self.terminal_tx.send(Some(outcome));
    }

    /// Publish the terminal `agent_end(messages)` event. Idempotent — only
    /// the first call of `complete`/`error`/`cancel` has any effect.
    pub fn complete(&self, final_messages: Vec<Message>) {
        self.finish(
            TerminalOutcome::Completed(final_messages.clone()),
            Event::AgentEnd {
                messages: final_messages,
            },
        );
    }

    /// Publish the terminal `error(reason, partial)` event.
    pub fn error(&self, reason: &str, partial: Option<Value>) {
        self.finish(
            TerminalOutcome::Error(reason.to_string(), partial.clone()),
            Event::Error {
                reason: reason.to_string(),
                partial_state: partial,
            },
        );
    }

    /// Publish the terminal `canceled(reason)` event and kill the attached
    /// task, if any.
    pub fn cancel(&self, reason: &str) {
        let abort = {
            let mut inner = self.inner.lock().unwrap();
            if inner.outcome.is_some() {
                return;
            }
            inner.outcome = Some(TerminalOutcome::Canceled(reason.to_string()));
            Self::enqueue_terminal(
                &mut inner,
                Event::Canceled {
                    reason: reason.to_string(),
                },
            );
            inner.attached_abort.take()
        };
        self.notify.notify_waiters();
        self.idle_notify.notify_waiters();
        let _ = self
            .terminal_tx
            .send(Some(TerminalOutcome::Canceled(reason.to_string())));
        if let Some(abort) = abort {
            abort.abort();
        }
    }

    /// Pull the next queued event, or `None` once the queue is drained and a
    /// terminal event has already been produced.
    pub async fn recv(&self) -> Option<Event> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock().unwrap();
                if let Some(event) = inner.queue.pop_front() {
                    return Some(event);
                }
                if inner.outcome.is_some() {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// A consumer handle over this stream — multiple consumers compete for
    /// the same FIFO queue.
    pub fn events(&self) -> EventConsumer {
        EventConsumer {
            stream: self.clone(),
        }
    }

    /// Block for a terminal event (or timeout). Every result-waiter on the
    /// same stream observes the same outcome.
    pub async fn result(&self, timeout: Option<Duration>) -> ResultOutcome {
        let mut rx = self.terminal_rx.clone();
        if let Some(outcome) = rx.borrow().clone() {
            return outcome.into();
        }
        let wait = rx.changed();
        let changed = match timeout {
            Some(d) => match tokio::time::timeout(d, wait).await {
                Ok(r) => r,
                Err(_) => return ResultOutcome::Timeout,
            },
            None => wait.await,
        };
        match changed {
            Ok(()) => rx
                .borrow()
                .clone()
                .map(ResultOutcome::from)
                .unwrap_or(ResultOutcome::StreamNotFound),
            Err(_) => ResultOutcome::StreamNotFound,
        }
    }

    pub fn stats(&self) -> Stats {
        let inner = self.inner.lock().unwrap();
        Stats {
            queue_size: inner.queue.len(),
            max_queue: inner.capacity,
            dropped: inner.dropped,
        }
    }
}

/// A competing event-consumer handle.
pub struct EventConsumer {
    stream: EventStream,
}

impl EventConsumer {
    pub async fn next(&self) -> Option<Event> {
        self.stream.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(capacity: usize, strategy: DropStrategy) -> EventStreamConfig {
        EventStreamConfig {
            capacity,
            drop_strategy: strategy,
            idle_timeout: None,
        }
    }

    #[tokio::test]
    async fn push_then_recv_in_fifo_order() {
        let stream = EventStream::new(cfg(10, DropStrategy::Error));
        stream.push(Event::TurnStart).unwrap();
        stream.push(Event::MessageEnd { message: Message::user("a") }).unwrap();
        let consumer = stream.events();
        assert!(matches!(consumer.next().await, Some(Event::TurnStart)));
        assert!(matches!(consumer.next().await, Some(Event::MessageEnd { .. })));
    }

    #[tokio::test]
    async fn complete_is_terminal_and_last() {
        let stream = EventStream::new(cfg(10, DropStrategy::Error));
        stream.push(Event::TurnStart).unwrap();
        stream.complete(vec![Message::user("done")]);
        let consumer = stream.events();
        assert!(matches!(consumer.next().await, Some(Event::TurnStart)));
        assert!(matches!(consumer.next().await, Some(Event::AgentEnd { .. })));
        assert!(consumer.next().await.is_none());
    }

    #[tokio::test]
    async fn complete_after_complete_is_noop() {
        let stream = EventStream::new(cfg(10, DropStrategy::Error));
        stream.complete(vec![Message::user("first")]);
        stream.complete(vec![Message::user("second")]);
        match stream.result(None).await {
            ResultOutcome::Completed(messages) => {
                assert_eq!(messages.len(), 1);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn error_after_complete_is_ignored() {
        let stream = EventStream::new(cfg(10, DropStrategy::Error));
        stream.complete(vec![]);
        stream.error("late", None);
        match stream.result(None).await {
            ResultOutcome::Completed(_) => {}
            other => panic!("complete should have won, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn push_after_terminal_is_rejected() {
        let stream = EventStream::new(cfg(10, DropStrategy::Error));
        stream.complete(vec![]);
        assert_eq!(stream.push(Event::TurnStart), Err(PushError::Closed));
    }

    #[tokio::test]
    async fn overflow_with_error_strategy_rejects_and_counts_dropped() {
        let stream = EventStream::new(cfg(20, DropStrategy::Error));
        let mut ok_count = 0;
        let mut overflow_count = 0;
        for _ in 0..100 {
            match stream.push(Event::TurnStart) {
                Ok(()) => ok_count += 1,
                Err(PushError::Overflow) => overflow_count += 1,
                Err(PushError::Closed) => unreachable!(),
            }
        }
        assert_eq!(ok_count, 20);
        assert_eq!(overflow_count, 80);
        let stats = stream.stats();
        assert_eq!(stats.dropped, 80);
        assert_eq!(stats.queue_size, 20);
    }

    #[tokio::test]
    async fn drop_oldest_keeps_most_recent_event() {
        let stream = EventStream::new(cfg(1, DropStrategy::DropOldest));
        for i in 0..5 {
            stream
                .push(Event::MessageEnd {
                    message: Message::user(format!("m{i}")),
                })
                .unwrap();
        }
        let stats = stream.stats();
        assert_eq!(stats.queue_size, 1);
        assert_eq!(stats.dropped, 4);
        let consumer = stream.events();
        match consumer.next().await {
            Some(Event::MessageEnd { message: Message::User { content, .. } }) => {
                let crate::ContentBlock::Text { text } = &content[0] else {
                    panic!("expected text block");
                };
                assert_eq!(text, "m4");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn drop_newest_rejects_silently_and_counts_dropped() {
        let stream = EventStream::new(cfg(1, DropStrategy::DropNewest));
        stream.push(Event::TurnStart).unwrap();
        stream.push(Event::TurnEnd {
            message: Message::user("x"),
            tool_results: vec![],
        }).unwrap();
        let stats = stream.stats();
        assert_eq!(stats.queue_size, 1);
        assert_eq!(stats.dropped, 1);
    }

    #[tokio::test]
    async fn terminal_always_delivered_even_when_queue_full() {
        let stream = EventStream::new(cfg(1, DropStrategy::DropOldest));
        stream.push(Event::TurnStart).unwrap();
        stream.complete(vec![Message::user("done")]);
        let stats = stream.stats();
        assert_eq!(stats.queue_size, 1);
        let consumer = stream.events();
        assert!(matches!(consumer.next().await, Some(Event::AgentEnd { .. })));
    }

    #[tokio::test]
    async fn multiple_result_waiters_get_same_outcome() {
        let stream = EventStream::new(cfg(10, DropStrategy::Error));
        let waiters: Vec<_> = (0..5)
            .map(|_| {
                let s = stream.clone();
                tokio::spawn(async move { s.result(None).await })
            })
            .collect();
        stream.complete(vec![Message::user("ok")]);
        for w in waiters {
            match w.await.unwrap() {
                ResultOutcome::Completed(messages) => assert_eq!(messages.len(), 1),
                other => panic!("unexpected: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn owner_down_cancels_stream() {
        let owner = tokio::spawn(async {
            tokio::time::sleep(Duration::from_millis(10)).await;
        });
        let stream = EventStream::with_owner(cfg(10, DropStrategy::Error), Some(owner));
        match tokio::time::timeout(Duration::from_millis(200), stream.result(None)).await {
            Ok(ResultOutcome::Canceled { reason }) => assert_eq!(reason, "owner_down"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn attached_task_crash_fails_stream() {
        let stream = EventStream::new(cfg(10, DropStrategy::Error));
        let handle = tokio::spawn(async { panic!("boom") });
        stream.attach_task(handle);
        match stream.result(None).await {
            ResultOutcome::Error { reason, .. } => assert!(reason.contains("task_crashed")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn reattaching_ignores_old_task_death() {
        let stream = EventStream::new(cfg(10, DropStrategy::Error));
        let doomed = tokio::spawn(async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            panic!("old task");
        });
        stream.attach_task(doomed);
        let fine = tokio::spawn(async {
            tokio::time::sleep(Duration::from_millis(10)).await;
        });
        stream.attach_task(fine);
        tokio::time::sleep(Duration::from_millis(150)).await;
        stream.complete(vec![]);
        match stream.result(None).await {
            ResultOutcome::Completed(_) => {}
            other => panic!("old monitor should not have fired: {other:?}"),
        }
    }

    #[tokio::test]
    async fn idle_timeout_cancels_with_timeout_reason() {
        let stream = EventStream::new(EventStreamConfig {
            capacity: 10,
            drop_strategy: DropStrategy::Error,
            idle_timeout: Some(Duration::from_millis(20)),
        });
        match stream.result(Some(Duration::from_millis(500))).await {
            ResultOutcome::Canceled { reason } => assert_eq!(reason, "timeout"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn completion_cancels_pending_idle_timeout() {
        let stream = EventStream::new(EventStreamConfig {
            capacity: 10,
            drop_strategy: DropStrategy::Error,
            idle_timeout: Some(Duration::from_millis(30)),
        });
        stream.complete(vec![Message::user("done")]);
        tokio::time::sleep(Duration::from_millis(60)).await;
        match stream.result(None).await {
            ResultOutcome::Completed(_) => {}
            other => panic!("idle timeout should not have overridden completion: {other:?}"),
        }
    }

    #[tokio::test]
    async fn result_timeout_without_terminal_event() {
        let stream = EventStream::new(cfg(10, DropStrategy::Error));
        match stream.result(Some(Duration::from_millis(20))).await {
            ResultOutcome::Timeout => {}
            other => panic!("unexpected: {other:?}"),
        }
    }
}
