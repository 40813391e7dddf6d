// SPDX-License-Identifier: MIT
//! Presence heartbeat engine.
//!
//! One worker task owns all engine state and multiplexes over four event
//! sources: the downstream sender channel, the announce/poll/degraded
//! schedules, force-send requests, and shutdown.
//!
//! # State machine
//!
//! ```text
//!              ┌───────────────┐   sender available    ┌─────────────────┐
//!   start ──►  │   no sender   │ ────────────────────► │   with sender   │
//!              │ (outer loop)  │                       │  (inner loop)   │
//!              └───────────────┘ ◄──────────────────── └─────────────────┘
//!                                     sender done
//! ```
//!
//! Both loops share one latch: `should_announce`. It is set by a poll that
//! detects a changed spec, by the forced announce tick, or by a force-send
//! request, and it is cleared only by a successful announce on either path.
//! The latch survives loop transitions, so an announce owed while the stream
//! was down is delivered through the fallback upsert, and vice versa.
//!
//! The stream path applies no backoff of its own (the stream handle owns
//! reconnect pacing); the fallback path backs off with jitter after each
//! failed upsert.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::debug;

use crate::config::{HeartbeatCallback, HeartbeatConfig};
use crate::driver::HeartbeatDriver;
use crate::interval::{half_jitter, seventh_jitter, Interval, IntervalConfig};
use crate::stream::{DownstreamHandle, DownstreamSender};

/// Sentinel errors surfaced through the heartbeat callback.
///
/// Callers distinguish these by variant, not by message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum HeartbeatError {
    /// A send over the control stream failed. No backoff is applied at this
    /// layer; the stream handle owns reconnect pacing.
    #[error("control stream heartbeat failed")]
    AnnounceFailed,
    /// The fallback upsert failed. The engine backs off before retrying.
    #[error("upsert fallback heartbeat failed")]
    FallbackFailed,
    /// Emitted periodically while no stream sender is available and the
    /// fallback path is not going to help. External health reporters treat
    /// this as the degraded signal.
    #[error("no control stream sender available")]
    NoSender,
}

/// Internal event stream used by tests to synchronize with the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TestEvent {
    Start,
    Close,
    AnnounceOk,
    AnnounceErr,
    FallbackOk,
    FallbackErr,
    PollSame,
    PollDiff,
    AnnounceInterval,
    FallbackBackoff,
    NoFallback,
    OnHeartbeatOk,
    OnHeartbeatErr,
}

/// Parked force-send completions, fired on any successful announce.
type WaiterList = Arc<Mutex<Vec<oneshot::Sender<()>>>>;

/// Cloneable control surface for a running [`Heartbeat`].
#[derive(Clone)]
pub struct HeartbeatControl {
    force_tx: mpsc::Sender<oneshot::Sender<()>>,
    shutdown: Arc<watch::Sender<bool>>,
    /// Waiter list shared with the worker. Owned here so it outlives the
    /// worker task: waiters still parked at shutdown are never completed,
    /// and their `force_send` calls run out their own timeout.
    waiters: WaiterList,
}

impl HeartbeatControl {
    /// Stop the engine. Idempotent; the worker returns at its next
    /// multiplex point and in-flight sends are abandoned.
    pub fn close(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Request an announce and block until one succeeds or `timeout`
    /// elapses.
    ///
    /// This only sets the should-announce latch; it does not bypass the
    /// fallback backoff, and with no sender and no fallback the request can
    /// only ever time out. Closing the engine does not complete parked
    /// waiters either: the call still runs out its full timeout, and waiters
    /// left behind are discarded on the next successful announce.
    pub async fn force_send(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let (tx, rx) = oneshot::channel();
        match tokio::time::timeout_at(deadline, self.force_tx.send(tx)).await {
            Err(_) => bail!("timed out waiting to trigger announce"),
            Ok(Err(_)) => {
                // The worker is gone and will never pick the request up;
                // burn the remaining deadline like any other unfulfilled
                // announce.
                tokio::time::sleep_until(deadline).await;
                bail!("timed out waiting to trigger announce");
            }
            Ok(Ok(())) => {}
        }
        match tokio::time::timeout_at(deadline, rx).await {
            Err(_) => bail!("timed out waiting for announce success"),
            Ok(Err(_)) => {
                // Waiter abandoned without ever being fired (engine shut
                // down mid-flight).
                tokio::time::sleep_until(deadline).await;
                bail!("timed out waiting for announce success");
            }
            Ok(Ok(())) => Ok(()),
        }
    }
}

/// Presence heartbeat worker.
///
/// Construct with [`Heartbeat::new`] (or a driver-specific wrapper such as
/// [`crate::ssh::new_ssh_server_heartbeat`]), grab a [`HeartbeatControl`]
/// via [`Heartbeat::control`], then spawn [`Heartbeat::run`]. The worker
/// runs until [`HeartbeatControl::close`] is called or the stream handle
/// shuts down.
pub struct Heartbeat {
    config: HeartbeatConfig,
    handle: Arc<dyn DownstreamHandle>,
    driver: Box<dyn HeartbeatDriver>,
    force_rx: mpsc::Receiver<oneshot::Sender<()>>,
    shutdown_rx: watch::Receiver<bool>,
    control: HeartbeatControl,
    test_events: Option<mpsc::UnboundedSender<TestEvent>>,
}

impl std::fmt::Debug for Heartbeat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Heartbeat").finish_non_exhaustive()
    }
}

impl Heartbeat {
    pub fn new(
        handle: Arc<dyn DownstreamHandle>,
        driver: Box<dyn HeartbeatDriver>,
        config: HeartbeatConfig,
    ) -> Self {
        let config = config.normalized();
        let (force_tx, force_rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let control = HeartbeatControl {
            force_tx,
            shutdown: Arc::new(shutdown_tx),
            waiters: Arc::new(Mutex::new(Vec::new())),
        };
        Self {
            config,
            handle,
            driver,
            force_rx,
            shutdown_rx,
            control,
            test_events: None,
        }
    }

    pub fn control(&self) -> HeartbeatControl {
        self.control.clone()
    }

    #[cfg(test)]
    pub(crate) fn with_test_events(mut self, events: mpsc::UnboundedSender<TestEvent>) -> Self {
        self.test_events = Some(events);
        self
    }

    /// Drive the heartbeat until close.
    pub async fn run(self) {
        let Heartbeat {
            config,
            handle,
            driver,
            mut force_rx,
            mut shutdown_rx,
            control,
            test_events,
        } = self;

        let mut worker = Worker {
            driver,
            on_heartbeat_inner: config.on_heartbeat,
            test_events,
            should_announce: false,
            fallback_backoff: config.fallback_backoff,
            fallback_deadline: Instant::now(),
            waiters: Arc::clone(&control.waiters),
        };
        let mut timers = Timers {
            // Forced announcement even when the spec is unchanged.
            announce: Interval::new(IntervalConfig {
                first_duration: Some(half_jitter(config.announce_interval)),
                duration: config.announce_interval,
                jitter: Some(seventh_jitter),
            }),
            // Change detection against the last announced snapshot.
            poll: Interval::new(IntervalConfig {
                first_duration: Some(half_jitter(config.poll_interval)),
                duration: config.poll_interval,
                jitter: Some(seventh_jitter),
            }),
            // Degraded-state emission cadence. Unjittered: health reporters
            // key off its regularity.
            degraded: Interval::new(IntervalConfig {
                first_duration: None,
                duration: config.degraded_check_interval,
                jitter: None,
            }),
        };
        let mut handle_closed = handle.closed();

        // Keeps the force/shutdown channels open for the worker's lifetime
        // even if every caller-held control clone is dropped.
        let _control = control;

        debug!(
            announce = ?config.announce_interval,
            poll = ?config.poll_interval,
            "heartbeat worker started"
        );
        worker.test_event(TestEvent::Start);
        run_outer(
            &mut worker,
            &mut timers,
            handle.as_ref(),
            &mut force_rx,
            &mut shutdown_rx,
            &mut handle_closed,
        )
        .await;
        worker.test_event(TestEvent::Close);
        debug!("heartbeat worker stopped");
    }
}

/// Worker-local engine state. Only the worker task touches this.
struct Worker {
    driver: Box<dyn HeartbeatDriver>,
    on_heartbeat_inner: Option<HeartbeatCallback>,
    test_events: Option<mpsc::UnboundedSender<TestEvent>>,

    /// Set by a poll diff, the announce tick, or force-send. Cleared only by
    /// a successful announce on either path. Starts false so the control
    /// stream has a chance to connect before the first announce; the first
    /// poll always reports a change, so startup still announces within a few
    /// seconds regardless.
    should_announce: bool,

    fallback_backoff: Duration,
    /// Earliest moment the next fallback attempt is allowed. The stream path
    /// ignores this.
    fallback_deadline: Instant,

    /// Parked force-send completions, shared with the control handle so the
    /// list survives the worker. Fired on any successful announce.
    waiters: WaiterList,
}

struct Timers {
    announce: Interval,
    poll: Interval,
    degraded: Interval,
}

enum OuterEvent {
    NewSender(Option<DownstreamSender>),
    AnnounceTick,
    PollTick,
    DegradedTick,
    Force(Option<oneshot::Sender<()>>),
    Closed,
}

enum InnerEvent {
    SenderDone,
    AnnounceTick,
    PollTick,
    DegradedTick,
    Force(Option<oneshot::Sender<()>>),
    Closed,
}

enum LoopExit {
    SenderGone,
    Closed,
}

impl Worker {
    fn test_event(&self, event: TestEvent) {
        if let Some(events) = &self.test_events {
            let _ = events.send(event);
        }
    }

    fn on_heartbeat(&self, result: Result<(), HeartbeatError>) {
        match result {
            Ok(()) => self.test_event(TestEvent::OnHeartbeatOk),
            Err(_) => self.test_event(TestEvent::OnHeartbeatErr),
        }
        if let Some(on_heartbeat) = &self.on_heartbeat_inner {
            on_heartbeat(result);
        }
    }

    /// Sequenced success block: push both schedules out a full period, clear
    /// the latch, report success, then release parked force-send waiters.
    /// Order matters to observers.
    fn announce_success(&mut self, timers: &mut Timers) {
        timers.announce.reset();
        timers.degraded.reset();
        self.should_announce = false;
        self.on_heartbeat(Ok(()));
        for waiter in self
            .waiters
            .lock()
            .expect("waiter list poisoned")
            .drain(..)
        {
            let _ = waiter.send(());
        }
    }
}

/// No-sender loop: announcements owed while the stream is down go through
/// the fallback upsert, gated by its backoff.
async fn run_outer(
    w: &mut Worker,
    timers: &mut Timers,
    handle: &dyn DownstreamHandle,
    force_rx: &mut mpsc::Receiver<oneshot::Sender<()>>,
    shutdown_rx: &mut watch::Receiver<bool>,
    handle_closed: &mut watch::Receiver<bool>,
) {
    loop {
        if w.should_announce {
            if !w.driver.supports_fallback() {
                w.test_event(TestEvent::NoFallback);
            } else if Instant::now() < w.fallback_deadline {
                w.test_event(TestEvent::FallbackBackoff);
            } else if !fallback_send(w, timers, shutdown_rx, handle_closed).await {
                return;
            }
        }

        let event = tokio::select! {
            maybe_sender = handle.next_sender() => OuterEvent::NewSender(maybe_sender),
            _ = timers.announce.tick() => OuterEvent::AnnounceTick,
            _ = timers.poll.tick() => OuterEvent::PollTick,
            _ = timers.degraded.tick() => OuterEvent::DegradedTick,
            waiter = force_rx.recv() => OuterEvent::Force(waiter),
            _ = shutdown_rx.wait_for(|closed| *closed) => OuterEvent::Closed,
            _ = handle_closed.wait_for(|closed| *closed) => OuterEvent::Closed,
        };

        match event {
            OuterEvent::NewSender(Some(sender)) => {
                match run_inner(w, timers, &sender, force_rx, shutdown_rx, handle_closed).await {
                    LoopExit::Closed => return,
                    LoopExit::SenderGone => timers.degraded.reset(),
                }
            }
            // The stream handle hung up for good.
            OuterEvent::NewSender(None) => return,
            OuterEvent::AnnounceTick => {
                w.test_event(TestEvent::AnnounceInterval);
                w.should_announce = true;
            }
            OuterEvent::PollTick => {
                if w.driver.poll().await {
                    w.test_event(TestEvent::PollDiff);
                    w.should_announce = true;
                } else {
                    w.test_event(TestEvent::PollSame);
                }
            }
            OuterEvent::DegradedTick => {
                // Without a fallback, or without any announce on the
                // horizon, nothing will reach the controller: surface the
                // degraded state to health reporters.
                if !w.driver.supports_fallback()
                    || (!w.driver.poll().await && !w.should_announce)
                {
                    w.on_heartbeat(Err(HeartbeatError::NoSender));
                }
            }
            OuterEvent::Force(Some(waiter)) => {
                w.should_announce = true;
                w.waiters.lock().expect("waiter list poisoned").push(waiter);
            }
            OuterEvent::Force(None) => {}
            OuterEvent::Closed => return,
        }
    }
}

/// With-sender loop: announcements go over the control stream. Returns when
/// the sender is invalidated or the engine closes.
async fn run_inner(
    w: &mut Worker,
    timers: &mut Timers,
    sender: &DownstreamSender,
    force_rx: &mut mpsc::Receiver<oneshot::Sender<()>>,
    shutdown_rx: &mut watch::Receiver<bool>,
    handle_closed: &mut watch::Receiver<bool>,
) -> LoopExit {
    timers.degraded.reset();

    // Poll immediately so a fresh connection announces without waiting for
    // the next poll tick.
    if w.driver.poll().await {
        w.test_event(TestEvent::PollDiff);
        w.should_announce = true;
    } else {
        w.test_event(TestEvent::PollSame);
    }

    loop {
        if w.should_announce && !stream_send(w, timers, sender, shutdown_rx, handle_closed).await {
            return LoopExit::Closed;
        }

        let event = tokio::select! {
            _ = sender.done() => InnerEvent::SenderDone,
            _ = timers.announce.tick() => InnerEvent::AnnounceTick,
            _ = timers.poll.tick() => InnerEvent::PollTick,
            _ = timers.degraded.tick() => InnerEvent::DegradedTick,
            waiter = force_rx.recv() => InnerEvent::Force(waiter),
            _ = shutdown_rx.wait_for(|closed| *closed) => InnerEvent::Closed,
            _ = handle_closed.wait_for(|closed| *closed) => InnerEvent::Closed,
        };

        match event {
            // Sender invalidated: yield back to the outer loop, which waits
            // for the handle to produce a replacement.
            InnerEvent::SenderDone => return LoopExit::SenderGone,
            InnerEvent::AnnounceTick => {
                w.test_event(TestEvent::AnnounceInterval);
                w.should_announce = true;
            }
            InnerEvent::PollTick => {
                if w.driver.poll().await {
                    w.test_event(TestEvent::PollDiff);
                    w.should_announce = true;
                } else {
                    w.test_event(TestEvent::PollSame);
                }
            }
            InnerEvent::DegradedTick => {
                // Quiet and healthy: affirmatively clear any degraded state
                // reported during a previous outage.
                if !w.driver.poll().await && !w.should_announce {
                    w.on_heartbeat(Ok(()));
                }
            }
            InnerEvent::Force(Some(waiter)) => {
                w.should_announce = true;
                w.waiters.lock().expect("waiter list poisoned").push(waiter);
            }
            InnerEvent::Force(None) => {}
            InnerEvent::Closed => return LoopExit::Closed,
        }
    }
}

/// One fallback upsert attempt. Returns false if shutdown was observed
/// mid-send.
async fn fallback_send(
    w: &mut Worker,
    timers: &mut Timers,
    shutdown_rx: &mut watch::Receiver<bool>,
    handle_closed: &mut watch::Receiver<bool>,
) -> bool {
    let outcome = tokio::select! {
        ok = w.driver.fallback_announce() => Some(ok),
        _ = shutdown_rx.wait_for(|closed| *closed) => None,
        _ = handle_closed.wait_for(|closed| *closed) => None,
    };
    let Some(ok) = outcome else { return false };

    if ok {
        w.test_event(TestEvent::FallbackOk);
        w.announce_success(timers);
    } else {
        w.test_event(TestEvent::FallbackErr);
        w.fallback_deadline = Instant::now() + seventh_jitter(w.fallback_backoff);
        w.on_heartbeat(Err(HeartbeatError::FallbackFailed));
    }
    true
}

/// One control stream announce attempt. Returns false if shutdown was
/// observed mid-send.
async fn stream_send(
    w: &mut Worker,
    timers: &mut Timers,
    sender: &DownstreamSender,
    shutdown_rx: &mut watch::Receiver<bool>,
    handle_closed: &mut watch::Receiver<bool>,
) -> bool {
    let outcome = tokio::select! {
        ok = w.driver.announce(sender) => Some(ok),
        _ = shutdown_rx.wait_for(|closed| *closed) => None,
        _ = handle_closed.wait_for(|closed| *closed) => None,
    };
    let Some(ok) = outcome else { return false };

    if ok {
        w.test_event(TestEvent::AnnounceOk);
        w.announce_success(timers);
    } else {
        w.test_event(TestEvent::AnnounceErr);
        // No backoff here: the next attempt is paced by the schedules, and
        // reconnect pacing belongs to the stream handle.
        w.on_heartbeat(Err(HeartbeatError::AnnounceFailed));
    }
    true
}
