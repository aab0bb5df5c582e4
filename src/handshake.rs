//! The write-then-poll protocol state machine.
//!
//! ```text
//! Idle -> Dispatched -> Polling -> { Acknowledged | TimedOut | DeviceFault | Aborted } -> Idle
//! ```
//!
//! Grippers acknowledge asynchronously through their status block, so every
//! plan step writes its command words and then polls until the expected
//! status shows up, the device reports a fault, or the step deadline passes.
//! A timed out step is re-issued up to `max_attempts` times; a fault is
//! surfaced at once.
//!
//! At most one [`Session`] exists per engine. [`HandshakeEngine::abort`]
//! ends a running session within one poll interval, and
//! [`HandshakeEngine::preempt`] does the same and then holds the engine for a
//! stop sequence.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{DeviceFault, GripperError, Result};
use crate::plan::{Plan, Step};
use crate::register_map::{DeviceDescriptor, Field};
use crate::transport::Connection;

/// Poll cadence and retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timing {
    pub poll_interval: Duration,
    pub step_timeout: Duration,
    pub max_attempts: u32,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(10),
            step_timeout: Duration::from_secs(3),
            max_attempts: 3,
        }
    }
}

/// Terminal state of a handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeOutcome {
    /// Every step was acknowledged; `status` is the last status block.
    Acknowledged { status: Vec<u16>, polls: u32 },
    TimedOut { step: usize, attempts: u32 },
    DeviceFault(DeviceFault),
    Aborted,
}

/// How a single status block relates to the current step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    InProgress,
    Acknowledged,
    Fault(DeviceFault),
}

pub fn classify(descriptor: &DeviceDescriptor, step: &Step, block: &[u16]) -> Classification {
    if !step.tolerate_fault {
        if let Some(fault) = descriptor.fault_in(block) {
            return Classification::Fault(fault);
        }
    }
    if step.expect.met(descriptor, block) {
        Classification::Acknowledged
    } else {
        Classification::InProgress
    }
}

enum StepResult {
    Acknowledged,
    TimedOut,
    Fault(DeviceFault),
    Aborted,
}

/// The in-flight handshake. Dropping it returns the engine to `Idle`.
pub struct Session<'a> {
    engine: &'a HandshakeEngine,
    epoch: u64,
    pub step: usize,
    pub attempts: u32,
    pub polls: u32,
    pub deadline: Option<Instant>,
    pub last_status: Vec<u16>,
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        self.engine.active.store(false, Ordering::SeqCst);
        self.engine.idle.notify_waiters();
    }
}

/// Exclusive hold for a stop sequence. While it lives, [`HandshakeEngine::begin`]
/// fails with `Busy`.
pub struct StopGuard<'a> {
    engine: &'a HandshakeEngine,
}

impl Drop for StopGuard<'_> {
    fn drop(&mut self) {
        self.engine.stopping.store(false, Ordering::SeqCst);
    }
}

pub struct HandshakeEngine {
    descriptor: Arc<DeviceDescriptor>,
    timing: Timing,
    active: AtomicBool,
    stopping: AtomicBool,
    epoch: AtomicU64,
    wake: Notify,
    idle: Notify,
}

impl HandshakeEngine {
    pub fn new(descriptor: Arc<DeviceDescriptor>, timing: Timing) -> Self {
        Self {
            descriptor,
            timing,
            active: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
            wake: Notify::new(),
            idle: Notify::new(),
        }
    }

    pub fn timing(&self) -> Timing {
        self.timing
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Claim the connection for one handshake, or fail with `Busy`.
    pub fn begin(&self) -> Result<Session<'_>> {
        self.active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| GripperError::Busy)?;
        let session = Session {
            engine: self,
            epoch: self.epoch.load(Ordering::SeqCst),
            step: 0,
            attempts: 0,
            polls: 0,
            deadline: None,
            last_status: Vec::new(),
        };
        // checked after the epoch snapshot, so a racing preempt either sees
        // this session as active or is seen here
        if self.is_stopping() {
            return Err(GripperError::Busy);
        }
        Ok(session)
    }

    /// Mark any in-flight session as aborted and wake its poll loop.
    pub fn abort(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.wake.notify_waiters();
    }

    /// Abort the in-flight session, wait for it to release the connection and
    /// hold the engine until the returned guard is dropped.
    ///
    /// Fails with `Busy` while another stop holds the engine.
    pub async fn preempt(&self) -> Result<StopGuard<'_>> {
        self.stopping
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| GripperError::Busy)?;
        let guard = StopGuard { engine: self };
        self.abort();
        loop {
            let idle = self.idle.notified();
            if !self.is_active() {
                break;
            }
            idle.await;
        }
        Ok(guard)
    }

    /// Drive `plan` to a terminal outcome within `session`.
    pub async fn run(
        &self,
        session: &mut Session<'_>,
        connection: &Connection,
        plan: &Plan,
    ) -> Result<HandshakeOutcome> {
        for (index, step) in plan.steps.iter().enumerate() {
            session.step = index;
            session.attempts = 0;
            loop {
                session.attempts += 1;
                if self.aborted(Some(session.epoch)) {
                    return Ok(HandshakeOutcome::Aborted);
                }
                let deadline = self.dispatch(connection, plan, step).await?;
                session.deadline = Some(deadline);
                let result = self
                    .poll(
                        connection,
                        step,
                        deadline,
                        Some(session.epoch),
                        &mut session.polls,
                        &mut session.last_status,
                    )
                    .await?;
                match result {
                    StepResult::Acknowledged => {
                        debug!("{:?}: {} acknowledged", plan.command, step.label);
                        break;
                    }
                    StepResult::Fault(fault) => {
                        warn!("{:?}: {} rejected, {fault}", plan.command, step.label);
                        return Ok(HandshakeOutcome::DeviceFault(fault));
                    }
                    StepResult::Aborted => {
                        debug!("{:?}: aborted during {}", plan.command, step.label);
                        return Ok(HandshakeOutcome::Aborted);
                    }
                    StepResult::TimedOut if session.attempts >= self.timing.max_attempts => {
                        warn!(
                            "{:?}: {} timed out after {} attempt(s)",
                            plan.command, step.label, session.attempts
                        );
                        return Ok(HandshakeOutcome::TimedOut {
                            step: index,
                            attempts: session.attempts,
                        });
                    }
                    StepResult::TimedOut => {
                        warn!(
                            "{:?}: {} timed out, re-issuing ({}/{})",
                            plan.command, step.label, session.attempts, self.timing.max_attempts
                        );
                    }
                }
            }
        }
        Ok(HandshakeOutcome::Acknowledged {
            status: std::mem::take(&mut session.last_status),
            polls: session.polls,
        })
    }

    /// Run `plan` under a [`StopGuard`]. Never aborted.
    pub async fn run_priority(
        &self,
        _guard: &StopGuard<'_>,
        connection: &Connection,
        plan: &Plan,
    ) -> Result<HandshakeOutcome> {
        let mut polls = 0;
        let mut last_status = Vec::new();
        for (index, step) in plan.steps.iter().enumerate() {
            let mut attempts = 0;
            loop {
                attempts += 1;
                let deadline = self.dispatch(connection, plan, step).await?;
                match self
                    .poll(connection, step, deadline, None, &mut polls, &mut last_status)
                    .await?
                {
                    StepResult::Acknowledged => break,
                    StepResult::Fault(fault) => return Ok(HandshakeOutcome::DeviceFault(fault)),
                    StepResult::Aborted => return Ok(HandshakeOutcome::Aborted),
                    StepResult::TimedOut if attempts >= self.timing.max_attempts => {
                        return Ok(HandshakeOutcome::TimedOut {
                            step: index,
                            attempts,
                        })
                    }
                    StepResult::TimedOut => {}
                }
            }
        }
        Ok(HandshakeOutcome::Acknowledged {
            status: last_status,
            polls,
        })
    }

    /// Read the status block once, outside any handshake.
    pub async fn read_status(&self, connection: &Connection) -> Result<Vec<u16>> {
        let status = self.descriptor.lookup(Field::Status)?;
        connection.read(status.bank, status.address, status.count).await
    }

    /// Idle -> Dispatched: validate and write the step's command words.
    async fn dispatch(&self, connection: &Connection, plan: &Plan, step: &Step) -> Result<Instant> {
        if let Some(words) = &step.write {
            let command_word = words.first().copied().unwrap_or_default();
            self.descriptor.validate_command_word(command_word)?;
            debug!(
                "{:?}: {} -> {:#06x} @ {:#06x}",
                plan.command, step.label, command_word, plan.address
            );
            connection.write(plan.address, words).await?;
        }
        Ok(Instant::now() + self.timing.step_timeout)
    }

    /// Dispatched -> Polling: read the status block now and then every poll
    /// interval until the step resolves or `deadline` passes.
    async fn poll(
        &self,
        connection: &Connection,
        step: &Step,
        deadline: Instant,
        epoch: Option<u64>,
        polls: &mut u32,
        last_status: &mut Vec<u16>,
    ) -> Result<StepResult> {
        loop {
            if self.aborted(epoch) {
                return Ok(StepResult::Aborted);
            }
            if Instant::now() >= deadline {
                return Ok(StepResult::TimedOut);
            }
            let block = self.read_status(connection).await?;
            *polls += 1;
            let classification = classify(&self.descriptor, step, &block);
            *last_status = block;
            match classification {
                Classification::Acknowledged => return Ok(StepResult::Acknowledged),
                Classification::Fault(fault) => return Ok(StepResult::Fault(fault)),
                Classification::InProgress => {}
            }
            tokio::select! {
                _ = tokio::time::sleep(self.timing.poll_interval) => {}
                _ = self.wake.notified(), if epoch.is_some() => {}
            }
        }
    }

    fn aborted(&self, epoch: Option<u64>) -> bool {
        epoch.is_some_and(|epoch| self.epoch.load(Ordering::SeqCst) != epoch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockTransport;
    use crate::plan::{Command, Expect};
    use crate::register_map::{koras, Bank, Model};
    use crate::transport::TransportAdapter;

    const BUSY: u16 = koras::status::MOTOR_ENABLE;
    const DONE: u16 = koras::status::MOTOR_ENABLE | koras::status::CLOSE_ACTIVE;

    fn status_block(word: u16) -> Vec<u16> {
        let mut block = vec![0; koras::NUM_STATUS_REG as usize];
        block[0] = word;
        block
    }

    async fn setup(timing: Timing) -> (HandshakeEngine, Connection, MockTransport) {
        let mock = MockTransport::new();
        let connection = Connection::new();
        connection
            .install(TransportAdapter::new(Box::new(mock.clone()), Duration::from_secs(1)))
            .await;
        let engine = HandshakeEngine::new(Arc::new(Model::Koras.descriptor()), timing);
        (engine, connection, mock)
    }

    fn grip_plan(engine: &HandshakeEngine) -> Plan {
        crate::plan::compose(
            &engine.descriptor,
            &Command::Grip,
            crate::plan::Setpoints::defaults(&engine.descriptor),
            None,
        )
        .unwrap()
    }

    fn timing(poll_ms: u64, timeout_ms: u64, attempts: u32) -> Timing {
        Timing {
            poll_interval: Duration::from_millis(poll_ms),
            step_timeout: Duration::from_millis(timeout_ms),
            max_attempts: attempts,
        }
    }

    fn script_busy_then_done(mock: &MockTransport, busy: usize) {
        let mut blocks = vec![status_block(BUSY); busy];
        blocks.push(status_block(DONE));
        mock.script(Bank::Input, koras::ADDR_STATUS, blocks);
    }

    #[tokio::test(start_paused = true)]
    async fn busy_polls_inside_the_deadline_are_acknowledged() {
        // 9 busy polls * 10 ms < 100 ms
        let (engine, connection, mock) = setup(timing(10, 100, 1)).await;
        script_busy_then_done(&mock, 9);
        let plan = grip_plan(&engine);

        let mut session = engine.begin().unwrap();
        let outcome = engine.run(&mut session, &connection, &plan).await.unwrap();
        assert!(matches!(outcome, HandshakeOutcome::Acknowledged { polls: 10, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn busy_polls_reaching_the_deadline_time_out() {
        // 10 busy polls * 10 ms >= 100 ms
        let (engine, connection, mock) = setup(timing(10, 100, 1)).await;
        script_busy_then_done(&mock, 10);
        let plan = grip_plan(&engine);

        let mut session = engine.begin().unwrap();
        let outcome = engine.run(&mut session, &connection, &plan).await.unwrap();
        assert_eq!(outcome, HandshakeOutcome::TimedOut { step: 0, attempts: 1 });
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_steps_are_reissued() {
        let (engine, connection, mock) = setup(timing(10, 50, 3)).await;
        mock.script(Bank::Input, koras::ADDR_STATUS, [status_block(BUSY)]);
        let plan = grip_plan(&engine);

        let mut session = engine.begin().unwrap();
        let outcome = engine.run(&mut session, &connection, &plan).await.unwrap();
        assert_eq!(outcome, HandshakeOutcome::TimedOut { step: 0, attempts: 3 });

        let writes = mock.writes();
        assert_eq!(writes.len(), 3);
        assert!(writes.iter().all(|write| write == &writes[0]));
    }

    #[tokio::test(start_paused = true)]
    async fn faults_are_never_retried() {
        let (engine, connection, mock) = setup(timing(10, 100, 3)).await;
        mock.script(
            Bank::Input,
            koras::ADDR_STATUS,
            [status_block(BUSY | koras::status::MOTOR_FAULT)],
        );
        let plan = grip_plan(&engine);

        let mut session = engine.begin().unwrap();
        let outcome = engine.run(&mut session, &connection, &plan).await.unwrap();
        assert!(matches!(outcome, HandshakeOutcome::DeviceFault(_)));
        assert_eq!(mock.writes().len(), 1);
    }

    #[tokio::test]
    async fn second_session_is_busy_until_the_first_ends() {
        let (engine, _connection, _mock) = setup(Timing::default()).await;
        let session = engine.begin().unwrap();
        assert!(engine.is_active());
        assert!(matches!(engine.begin(), Err(GripperError::Busy)));

        drop(session);
        assert!(!engine.is_active());
        assert!(engine.begin().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn abort_ends_polling_within_one_interval() {
        let (engine, connection, mock) = setup(timing(20, 10_000, 1)).await;
        mock.script(Bank::Input, koras::ADDR_STATUS, [status_block(BUSY)]);
        let engine = Arc::new(engine);
        let connection = Arc::new(connection);
        let plan = grip_plan(&engine);

        let task = {
            let engine = engine.clone();
            let connection = connection.clone();
            tokio::spawn(async move {
                let mut session = engine.begin().unwrap();
                engine.run(&mut session, &connection, &plan).await
            })
        };
        tokio::time::sleep(Duration::from_millis(55)).await;

        let aborted_at = Instant::now();
        engine.abort();
        let outcome = task.await.unwrap().unwrap();
        assert_eq!(outcome, HandshakeOutcome::Aborted);
        assert!(aborted_at.elapsed() <= engine.timing().poll_interval);
        assert!(!engine.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn preempt_holds_the_engine_until_released() {
        let (engine, connection, mock) = setup(timing(20, 10_000, 1)).await;
        mock.script(Bank::Input, koras::ADDR_STATUS, [status_block(BUSY)]);
        let engine = Arc::new(engine);
        let connection = Arc::new(connection);
        let plan = grip_plan(&engine);

        let task = {
            let engine = engine.clone();
            tokio::spawn(async move {
                let mut session = engine.begin().unwrap();
                engine.run(&mut session, &connection, &plan).await
            })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;

        let guard = engine.preempt().await.unwrap();
        assert!(!engine.is_active());
        assert_eq!(task.await.unwrap().unwrap(), HandshakeOutcome::Aborted);

        assert!(matches!(engine.begin(), Err(GripperError::Busy)));
        assert!(matches!(engine.preempt().await, Err(GripperError::Busy)));

        drop(guard);
        assert!(!engine.is_stopping());
        assert!(engine.begin().is_ok());
    }

    #[test]
    fn tolerated_faults_defer_to_the_expectation() {
        let descriptor = Model::Koras.descriptor();
        let step = Step {
            label: "motor enable",
            write: None,
            expect: Expect::set(koras::status::MOTOR_ENABLE),
            tolerate_fault: true,
        };
        let faulted = status_block(koras::status::MOTOR_ENABLE | koras::status::MOTOR_FAULT);
        assert_eq!(classify(&descriptor, &step, &faulted), Classification::Acknowledged);
        assert_eq!(
            classify(&descriptor, &step, &status_block(koras::status::MOTOR_FAULT)),
            Classification::InProgress
        );

        let strict = Step {
            tolerate_fault: false,
            ..step
        };
        assert!(matches!(
            classify(&descriptor, &strict, &faulted),
            Classification::Fault(_)
        ));
    }
}
