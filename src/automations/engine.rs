// Automation engine - trigger handling, enrollment lifecycle and step
// processing.
//
// All state transitions on enrollments happen here. Per-enrollment faults are
// contained: a failing enrollment is marked failed (or safety-exited) and the
// caller moves on to the next one.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::branching::{self, GateOutcome};
use super::conditions;
use super::definition::Automation;
use super::enrollment::{Enrollment, EnrollmentStats, EnrollmentStatus};
use super::executor::ActionExecutor;
use super::exits;
use super::log::{AutomationLog, LogStatus};
use super::steps::{StepArena, StepConfig};
use crate::clock::Clock;
use crate::entities::{EntityKind, EntitySnapshot};
use crate::error::{EngineError, EngineResult};
use crate::events::TriggerEvent;
use crate::ports::{AutomationStore, EmailSender, EnrollmentStore, EntityStore, LogStore, ReminderStore};

/// Upper bound on steps drained in one processing call. Back-edges are legal
/// but only a delay step can yield, so a cycle with no delay would otherwise
/// spin here forever.
const MAX_STEPS_PER_DRAIN: usize = 100;

/// Result of one enrollment attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrollOutcome {
    Enrolled(Uuid),
    /// Uniqueness invariant: one active enrollment per (automation, entity).
    AlreadyEnrolled,
    ConditionsNotMet,
    AutomationInactive,
}

pub struct AutomationEngine {
    automations: Arc<dyn AutomationStore>,
    enrollments: Arc<dyn EnrollmentStore>,
    logs: Arc<dyn LogStore>,
    entities: Arc<dyn EntityStore>,
    executor: ActionExecutor,
    clock: Arc<dyn Clock>,
}

impl AutomationEngine {
    pub fn new(
        automations: Arc<dyn AutomationStore>,
        enrollments: Arc<dyn EnrollmentStore>,
        logs: Arc<dyn LogStore>,
        entities: Arc<dyn EntityStore>,
        email: Arc<dyn EmailSender>,
        reminders: Arc<dyn ReminderStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            automations,
            enrollments,
            logs,
            entities: entities.clone(),
            executor: ActionExecutor::new(entities, email, reminders),
            clock,
        }
    }

    /// React to a trigger event: try to enroll the entity into every active
    /// automation whose trigger matches.
    pub async fn handle_event(self: &Arc<Self>, event: &TriggerEvent) -> EngineResult<Vec<EnrollOutcome>> {
        let mut outcomes = Vec::new();

        for automation in self.automations.list_active().await? {
            if !automation.matches_trigger(event) {
                continue;
            }
            outcomes.push(self.enroll(&automation, &event.snapshot).await?);
        }

        Ok(outcomes)
    }

    /// Manually enroll an entity into one automation by id.
    pub async fn enroll_by_id(
        self: &Arc<Self>,
        automation_id: Uuid,
        snapshot: &EntitySnapshot,
    ) -> EngineResult<EnrollOutcome> {
        let automation = self
            .automations
            .get(automation_id)
            .await?
            .ok_or(EngineError::AutomationNotFound(automation_id))?;

        self.enroll(&automation, snapshot).await
    }

    /// Attempt to enroll one entity into one automation.
    ///
    /// Single-step automations are processed inline in a background task;
    /// multi-step ones are picked up by the scheduler. A new enrollment is
    /// immediately due unless the automation opens with a delay step, whose
    /// wait counts from enrollment time.
    pub async fn enroll(
        self: &Arc<Self>,
        automation: &Automation,
        snapshot: &EntitySnapshot,
    ) -> EngineResult<EnrollOutcome> {
        let now = self.clock.now();

        if !automation.is_active {
            return Ok(EnrollOutcome::AutomationInactive);
        }

        let (passed, trace) = conditions::evaluate_traced(&automation.conditions, snapshot);
        if !passed {
            debug!(automation = %automation.id, entity = %snapshot.id, "enrollment conditions not met");
            self.logs
                .append(
                    &AutomationLog::new(
                        automation.id,
                        snapshot.kind,
                        snapshot.id,
                        LogStatus::Skipped,
                        now,
                    )
                    .with_trigger(snapshot.fields.clone())
                    .with_conditions(&trace),
                )
                .await?;
            return Ok(EnrollOutcome::ConditionsNotMet);
        }

        if self
            .enrollments
            .find_active(automation.id, snapshot.kind, snapshot.id)
            .await?
            .is_some()
        {
            debug!(automation = %automation.id, entity = %snapshot.id, "already actively enrolled");
            return Ok(EnrollOutcome::AlreadyEnrolled);
        }

        let mut enrollment = Enrollment::new(automation.id, snapshot.kind, snapshot.id, now);
        if automation.is_multi_step {
            // a leading delay counts from enrollment time; the pointer stays
            // on step 0 so sweeps before the deadline leave the row untouched
            let arena = StepArena::new(self.automations.steps(automation.id).await?);
            if let Some(wait) = arena.get(0).and_then(|s| s.config.delay_duration()) {
                enrollment.next_step_at = Some(now + wait);
            }
        }

        match self.enrollments.insert(&enrollment).await {
            Ok(()) => {}
            Err(EngineError::EnrollmentConflict) => {
                // lost the insert race to a concurrent enrollment attempt
                debug!(automation = %automation.id, entity = %snapshot.id, "already actively enrolled");
                return Ok(EnrollOutcome::AlreadyEnrolled);
            }
            Err(e) => return Err(e),
        }
        self.automations.adjust_counters(automation.id, 1, 1, 0).await?;

        info!(
            automation = %automation.id,
            enrollment = %enrollment.id,
            entity = %snapshot.id,
            "enrolled"
        );
        self.logs
            .append(
                &AutomationLog::new(
                    automation.id,
                    snapshot.kind,
                    snapshot.id,
                    LogStatus::Enrolled,
                    now,
                )
                .with_enrollment(enrollment.id)
                .with_trigger(snapshot.fields.clone())
                .with_conditions(&trace),
            )
            .await?;

        if !automation.is_multi_step {
            let engine = Arc::clone(self);
            let enrollment_id = enrollment.id;
            tokio::spawn(async move {
                if let Err(e) = engine.process_single_step(enrollment_id).await {
                    warn!(enrollment = %enrollment_id, "single-step processing failed: {e}");
                }
            });
        }

        Ok(EnrollOutcome::Enrolled(enrollment.id))
    }

    /// Manually remove an entity from an automation.
    pub async fn unenroll(&self, enrollment_id: Uuid) -> EngineResult<()> {
        let mut enrollment = self
            .enrollments
            .get(enrollment_id)
            .await?
            .ok_or_else(|| EngineError::Storage(format!("enrollment {enrollment_id} not found")))?;

        if enrollment.status.is_terminal() {
            return Ok(());
        }

        let now = self.clock.now();
        enrollment.unenroll(now);
        self.enrollments.update(&enrollment).await?;
        self.automations
            .adjust_counters(enrollment.automation_id, 0, -1, 0)
            .await?;

        self.logs
            .append(
                &AutomationLog::new(
                    enrollment.automation_id,
                    enrollment.entity_kind,
                    enrollment.entity_id,
                    LogStatus::Unenrolled,
                    now,
                )
                .with_enrollment(enrollment.id),
            )
            .await?;

        Ok(())
    }

    /// Unenroll by (automation, entity), the way external callers address
    /// it. A missing active enrollment is a no-op.
    pub async fn unenroll_entity(
        &self,
        automation_id: Uuid,
        entity_kind: EntityKind,
        entity_id: Uuid,
    ) -> EngineResult<()> {
        if let Some(enrollment) = self
            .enrollments
            .find_active(automation_id, entity_kind, entity_id)
            .await?
        {
            self.unenroll(enrollment.id).await?;
        }
        Ok(())
    }

    /// Process every due enrollment once. Returns the number processed.
    ///
    /// Called by the scheduler on every tick; also usable directly for
    /// deterministic tests and manual catch-up runs.
    pub async fn process_due(&self) -> EngineResult<usize> {
        let due = self.enrollments.due(self.clock.now()).await?;
        let count = due.len();

        for enrollment in due {
            let id = enrollment.id;
            if let Err(e) = self.process_enrollment(enrollment).await {
                // contained: one bad enrollment must not stop the sweep
                warn!(enrollment = %id, "enrollment processing failed: {e}");
            }
        }

        Ok(count)
    }

    /// Force-process one enrollment regardless of its schedule.
    pub async fn process_enrollment_now(&self, enrollment_id: Uuid) -> EngineResult<()> {
        let mut enrollment = self
            .enrollments
            .get(enrollment_id)
            .await?
            .ok_or_else(|| EngineError::Storage(format!("enrollment {enrollment_id} not found")))?;

        if enrollment.status.is_terminal() {
            return Ok(());
        }

        enrollment.next_step_at = Some(self.clock.now());
        self.process_enrollment(enrollment).await
    }

    pub async fn enrollment_stats(&self, automation_id: Uuid) -> EngineResult<EnrollmentStats> {
        self.enrollments.stats(automation_id).await
    }

    /// Drive one enrollment through every step that is currently due.
    ///
    /// A delay step reschedules the enrollment and ends the drain; action,
    /// condition and branch steps are executed back to back in one call.
    async fn process_enrollment(&self, mut enrollment: Enrollment) -> EngineResult<()> {
        let Some(automation) = self.automations.get(enrollment.automation_id).await? else {
            let now = self.clock.now();
            enrollment.fail("automation definition no longer exists", now);
            self.enrollments.update(&enrollment).await?;
            return Ok(());
        };

        if !automation.is_active {
            // dormant: deactivated automations freeze their enrollments in
            // place until reactivated
            debug!(enrollment = %enrollment.id, "automation inactive, enrollment dormant");
            return Ok(());
        }

        if !automation.is_multi_step {
            // legacy flat action list. Normally run inline right after
            // enrollment, but a restart or an early sweep can get here first.
            return self.run_flat_actions(&automation, enrollment).await;
        }

        let arena = StepArena::new(self.automations.steps(automation.id).await?);

        let mut snapshot = match self
            .entities
            .find(enrollment.entity_kind, enrollment.entity_id)
            .await?
        {
            Some(snapshot) => snapshot,
            None => {
                let error = EngineError::EntityNotFound {
                    kind: enrollment.entity_kind,
                    id: enrollment.entity_id,
                }
                .to_string();
                return self
                    .finish_failed(&automation, &mut enrollment, &error, json!([]))
                    .await;
            }
        };

        let mut hops = 0usize;
        loop {
            let now = self.clock.now();
            if !enrollment.is_due(now) {
                break;
            }

            hops += 1;
            if hops > MAX_STEPS_PER_DRAIN {
                return self
                    .finish_failed(
                        &automation,
                        &mut enrollment,
                        "step cycle without a delay detected",
                        json!([]),
                    )
                    .await;
            }

            if let Some(reason) = exits::check(&automation.exit_criteria, &enrollment, &snapshot, now) {
                return self.finish_exited(&automation, &mut enrollment, &reason).await;
            }

            let Some(step) = arena.get(enrollment.current_step_index) else {
                // walked past the end of the arena (or the arena is empty)
                return self.finish_completed(&automation, &mut enrollment).await;
            };

            debug!(
                enrollment = %enrollment.id,
                step = step.step_index,
                kind = step.config.kind(),
                "processing step"
            );

            match &step.config {
                StepConfig::Delay { .. } => {
                    // the wait was applied when the pointer landed on this
                    // step, so a due delay has already been served
                    match arena.next_after(step) {
                        Some(next) => {
                            Self::advance_to(&arena, &mut enrollment, next, now);
                            self.enrollments.update(&enrollment).await?;
                            self.log_step(&enrollment, LogStatus::Advanced, json!([]))
                                .await?;
                        }
                        None => {
                            return self.finish_completed(&automation, &mut enrollment).await;
                        }
                    }
                }
                StepConfig::Condition {
                    conditions,
                    false_branch,
                } => {
                    let (outcome, trace) =
                        branching::resolve_condition_step(conditions, *false_branch, &snapshot);
                    match outcome {
                        GateOutcome::Continue => match arena.next_after(step) {
                            Some(next) => {
                                Self::advance_to(&arena, &mut enrollment, next, now);
                                self.enrollments.update(&enrollment).await?;
                                self.log_gate(&enrollment, LogStatus::Advanced, &trace).await?;
                            }
                            None => {
                                return self.finish_completed(&automation, &mut enrollment).await;
                            }
                        },
                        GateOutcome::Goto(target) => {
                            Self::advance_to(&arena, &mut enrollment, target, now);
                            self.enrollments.update(&enrollment).await?;
                            self.log_gate(&enrollment, LogStatus::Advanced, &trace).await?;
                        }
                        GateOutcome::EndSkipped => {
                            enrollment.complete(now);
                            self.enrollments.update(&enrollment).await?;
                            self.automations
                                .adjust_counters(automation.id, 0, -1, 1)
                                .await?;
                            self.log_gate(&enrollment, LogStatus::Skipped, &trace).await?;
                            return Ok(());
                        }
                    }
                }
                StepConfig::Branch {
                    branches,
                    default_branch,
                } => {
                    let (target, trace) =
                        branching::resolve_branch(branches, *default_branch, &snapshot);
                    match target {
                        Some(target) => {
                            Self::advance_to(&arena, &mut enrollment, target, now);
                            self.enrollments.update(&enrollment).await?;
                            self.log_gate(&enrollment, LogStatus::Advanced, &trace).await?;
                        }
                        None => {
                            return self.finish_completed(&automation, &mut enrollment).await;
                        }
                    }
                }
                StepConfig::Action { actions } => {
                    let result = self.executor.execute_batch(actions, &snapshot, now).await;

                    if result.all_succeeded() {
                        enrollment.set_metadata("consecutive_errors", json!(0));
                        self.log_step(&enrollment, LogStatus::Advanced, result.outcomes_json())
                            .await?;

                        // actions may have mutated the entity; re-read before
                        // the next gate or exit check
                        snapshot = match self
                            .entities
                            .find(enrollment.entity_kind, enrollment.entity_id)
                            .await?
                        {
                            Some(snapshot) => snapshot,
                            None => {
                                let error = EngineError::EntityNotFound {
                                    kind: enrollment.entity_kind,
                                    id: enrollment.entity_id,
                                }
                                .to_string();
                                return self
                                    .finish_failed(&automation, &mut enrollment, &error, json!([]))
                                    .await;
                            }
                        };

                        match arena.next_after(step) {
                            Some(next) => {
                                Self::advance_to(&arena, &mut enrollment, next, now);
                                self.enrollments.update(&enrollment).await?;
                            }
                            None => {
                                // last step of the run; the refreshed snapshot
                                // may have just met a goal
                                if let Some(reason) = exits::check(
                                    &automation.exit_criteria,
                                    &enrollment,
                                    &snapshot,
                                    now,
                                ) {
                                    return self
                                        .finish_exited(&automation, &mut enrollment, &reason)
                                        .await;
                                }
                                return self.finish_completed(&automation, &mut enrollment).await;
                            }
                        }
                    } else {
                        let error = result
                            .failed
                            .clone()
                            .unwrap_or_else(|| "action failed".to_string());
                        enrollment.record_error(&error);

                        // the error count may now trip the safety net; a
                        // safety exit takes precedence over a plain failure
                        if let Some(reason) =
                            exits::check(&automation.exit_criteria, &enrollment, &snapshot, now)
                        {
                            return self.finish_exited(&automation, &mut enrollment, &reason).await;
                        }

                        return self
                            .finish_failed(&automation, &mut enrollment, &error, result.outcomes_json())
                            .await;
                    }
                }
            }
        }

        Ok(())
    }

    /// Inline entry point for single-step automations, spawned at enrollment.
    pub(crate) async fn process_single_step(&self, enrollment_id: Uuid) -> EngineResult<()> {
        let Some(mut enrollment) = self.enrollments.get(enrollment_id).await? else {
            return Ok(());
        };
        if enrollment.status != EnrollmentStatus::Active {
            return Ok(());
        }

        let Some(automation) = self.automations.get(enrollment.automation_id).await? else {
            let now = self.clock.now();
            enrollment.fail("automation definition no longer exists", now);
            return self.enrollments.update(&enrollment).await;
        };

        self.run_flat_actions(&automation, enrollment).await
    }

    /// Single-step automations: run the flat action list once and finish.
    ///
    /// Shared by the inline task and the scheduler sweep, so the actions run
    /// even when the inline task never did (restart, or the poller won).
    async fn run_flat_actions(
        &self,
        automation: &Automation,
        mut enrollment: Enrollment,
    ) -> EngineResult<()> {
        let snapshot = match self
            .entities
            .find(enrollment.entity_kind, enrollment.entity_id)
            .await?
        {
            Some(snapshot) => snapshot,
            None => {
                let error = EngineError::EntityNotFound {
                    kind: enrollment.entity_kind,
                    id: enrollment.entity_id,
                }
                .to_string();
                return self
                    .finish_failed(automation, &mut enrollment, &error, json!([]))
                    .await;
            }
        };

        let now = self.clock.now();
        let result = self
            .executor
            .execute_batch(&automation.actions, &snapshot, now)
            .await;

        if result.all_succeeded() {
            self.log_step(&enrollment, LogStatus::Advanced, result.outcomes_json())
                .await?;
            self.finish_completed(automation, &mut enrollment).await
        } else {
            let error = result
                .failed
                .clone()
                .unwrap_or_else(|| "action failed".to_string());
            self.finish_failed(automation, &mut enrollment, &error, result.outcomes_json())
                .await
        }
    }

    /// Move the step pointer. Landing on a delay step parks the enrollment
    /// for that step's wait, which ends the current drain.
    fn advance_to(arena: &StepArena, enrollment: &mut Enrollment, next: i32, now: DateTime<Utc>) {
        enrollment.current_step_index = next;
        enrollment.next_step_at = match arena.get(next).and_then(|s| s.config.delay_duration()) {
            Some(wait) => Some(now + wait),
            None => Some(now),
        };
    }

    async fn finish_completed(
        &self,
        automation: &Automation,
        enrollment: &mut Enrollment,
    ) -> EngineResult<()> {
        let now = self.clock.now();
        enrollment.complete(now);
        self.enrollments.update(enrollment).await?;
        self.automations.adjust_counters(automation.id, 0, -1, 1).await?;

        info!(enrollment = %enrollment.id, automation = %automation.id, "enrollment completed");
        self.log_step(enrollment, LogStatus::Completed, json!([])).await
    }

    async fn finish_exited(
        &self,
        automation: &Automation,
        enrollment: &mut Enrollment,
        reason: &str,
    ) -> EngineResult<()> {
        let now = self.clock.now();
        enrollment.exit(reason, now);
        self.enrollments.update(enrollment).await?;
        self.automations.adjust_counters(automation.id, 0, -1, 0).await?;

        info!(enrollment = %enrollment.id, reason, "enrollment exited");
        self.logs
            .append(
                &AutomationLog::new(
                    enrollment.automation_id,
                    enrollment.entity_kind,
                    enrollment.entity_id,
                    LogStatus::Exited,
                    now,
                )
                .with_enrollment(enrollment.id)
                .with_error(reason),
            )
            .await
    }

    /// One failed attempt yields one audit row, carrying whatever action
    /// outcomes the attempt produced.
    async fn finish_failed(
        &self,
        automation: &Automation,
        enrollment: &mut Enrollment,
        error: &str,
        outcomes: serde_json::Value,
    ) -> EngineResult<()> {
        let now = self.clock.now();
        enrollment.fail(error, now);
        self.enrollments.update(enrollment).await?;
        self.automations.adjust_counters(automation.id, 0, -1, 0).await?;

        warn!(enrollment = %enrollment.id, "enrollment failed: {error}");
        self.logs
            .append(
                &AutomationLog::new(
                    enrollment.automation_id,
                    enrollment.entity_kind,
                    enrollment.entity_id,
                    LogStatus::Failed,
                    now,
                )
                .with_enrollment(enrollment.id)
                .with_actions(outcomes)
                .with_error(error),
            )
            .await
    }

    async fn log_step(
        &self,
        enrollment: &Enrollment,
        status: LogStatus,
        actions: serde_json::Value,
    ) -> EngineResult<()> {
        self.logs
            .append(
                &AutomationLog::new(
                    enrollment.automation_id,
                    enrollment.entity_kind,
                    enrollment.entity_id,
                    status,
                    self.clock.now(),
                )
                .with_enrollment(enrollment.id)
                .with_actions(actions),
            )
            .await
    }

    async fn log_gate(
        &self,
        enrollment: &Enrollment,
        status: LogStatus,
        trace: &[super::conditions::ConditionTrace],
    ) -> EngineResult<()> {
        self.logs
            .append(
                &AutomationLog::new(
                    enrollment.automation_id,
                    enrollment.entity_kind,
                    enrollment.entity_id,
                    status,
                    self.clock.now(),
                )
                .with_enrollment(enrollment.id)
                .with_conditions(trace),
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automations::actions::ActionConfig;
    use crate::automations::conditions::Condition;
    use crate::automations::steps::AutomationStep;
    use crate::clock::ManualClock;
    use crate::entities::EntityKind;
    use crate::events::TriggerType;
    use crate::storage::memory::{
        MemoryAutomationStore, MemoryEnrollmentStore, MemoryEntityStore, MemoryLogStore,
        MemoryMailer, MemoryReminderStore,
    };
    use chrono::{Duration, Utc};
    use serde_json::json;

    struct Harness {
        engine: Arc<AutomationEngine>,
        automations: Arc<MemoryAutomationStore>,
        enrollments: Arc<MemoryEnrollmentStore>,
        entities: Arc<MemoryEntityStore>,
        logs: Arc<MemoryLogStore>,
        clock: Arc<ManualClock>,
    }

    fn harness() -> Harness {
        let automations = Arc::new(MemoryAutomationStore::default());
        let enrollments = Arc::new(MemoryEnrollmentStore::default());
        let logs = Arc::new(MemoryLogStore::default());
        let entities = Arc::new(MemoryEntityStore::default());
        let clock = Arc::new(ManualClock::new(Utc::now()));

        let engine = Arc::new(AutomationEngine::new(
            automations.clone(),
            enrollments.clone(),
            logs.clone(),
            entities.clone(),
            Arc::new(MemoryMailer::default()),
            Arc::new(MemoryReminderStore::default()),
            clock.clone(),
        ));

        Harness {
            engine,
            automations,
            enrollments,
            entities,
            logs,
            clock,
        }
    }

    fn contact(h: &Harness, fields: serde_json::Value) -> EntitySnapshot {
        let id = Uuid::new_v4();
        h.entities.insert(EntityKind::Contact, id, fields);
        h.entities.snapshot(EntityKind::Contact, id).unwrap()
    }

    #[tokio::test]
    async fn duplicate_enrollment_is_rejected_while_active() {
        let h = harness();
        let mut automation = Automation::new("nurture", TriggerType::ContactCreated);
        automation.is_multi_step = true;
        h.automations.insert(automation.clone(), vec![AutomationStep::new(
            automation.id,
            0,
            StepConfig::Delay { days: 1, hours: 0, minutes: 0 },
        )]);

        let snapshot = contact(&h, json!({}));

        let first = h.engine.enroll(&automation, &snapshot).await.unwrap();
        assert!(matches!(first, EnrollOutcome::Enrolled(_)));

        let second = h.engine.enroll(&automation, &snapshot).await.unwrap();
        assert_eq!(second, EnrollOutcome::AlreadyEnrolled);

        // counters reflect exactly one enrollment
        let stored = h.automations.get(automation.id).await.unwrap().unwrap();
        assert_eq!(stored.enrolled_count, 1);
        assert_eq!(stored.active_count, 1);
    }

    #[tokio::test]
    async fn reenrollment_allowed_after_terminal_state() {
        let h = harness();
        let mut automation = Automation::new("once more", TriggerType::ContactCreated);
        automation.is_multi_step = true;
        h.automations.insert(automation.clone(), vec![AutomationStep::new(
            automation.id,
            0,
            StepConfig::Action {
                actions: vec![ActionConfig::AddContactTag { tag: "done".into() }],
            },
        )]);

        let snapshot = contact(&h, json!({}));

        let EnrollOutcome::Enrolled(first_id) =
            h.engine.enroll(&automation, &snapshot).await.unwrap()
        else {
            panic!("expected enrollment");
        };

        h.engine.process_due().await.unwrap();
        let first = h.enrollments.get(first_id).await.unwrap().unwrap();
        assert_eq!(first.status, EnrollmentStatus::Completed);

        let again = h.engine.enroll(&automation, &snapshot).await.unwrap();
        assert!(matches!(again, EnrollOutcome::Enrolled(_)));
    }

    #[tokio::test]
    async fn enrollment_conditions_gate_entry() {
        let h = harness();
        let mut automation = Automation::new("leads only", TriggerType::ContactCreated);
        automation.is_multi_step = true;
        automation.conditions = vec![Condition::has_tag("lead")];
        h.automations.insert(automation.clone(), vec![AutomationStep::new(
            automation.id,
            0,
            StepConfig::Delay { days: 1, hours: 0, minutes: 0 },
        )]);

        let not_a_lead = contact(&h, json!({ "tags": [] }));
        let outcome = h.engine.enroll(&automation, &not_a_lead).await.unwrap();
        assert_eq!(outcome, EnrollOutcome::ConditionsNotMet);

        let statuses: Vec<_> = h.logs.all().iter().map(|l| l.status).collect();
        assert_eq!(statuses, vec![LogStatus::Skipped]);
    }

    #[tokio::test]
    async fn inactive_automation_rejects_enrollment() {
        let h = harness();
        let mut automation = Automation::new("paused", TriggerType::ContactCreated);
        automation.is_active = false;
        h.automations.insert(automation.clone(), vec![]);

        let snapshot = contact(&h, json!({}));
        let outcome = h.engine.enroll(&automation, &snapshot).await.unwrap();
        assert_eq!(outcome, EnrollOutcome::AutomationInactive);
    }

    #[tokio::test]
    async fn delay_step_parks_enrollment_until_due() {
        let h = harness();
        let mut automation = Automation::new("wait then tag", TriggerType::ContactCreated);
        automation.is_multi_step = true;
        h.automations.insert(
            automation.clone(),
            vec![
                AutomationStep::new(
                    automation.id,
                    0,
                    StepConfig::Delay { days: 2, hours: 0, minutes: 0 },
                ),
                AutomationStep::new(
                    automation.id,
                    1,
                    StepConfig::Action {
                        actions: vec![ActionConfig::AddContactTag { tag: "nurtured".into() }],
                    },
                ),
            ],
        );

        let snapshot = contact(&h, json!({}));
        let enrolled_at = h.clock.now();
        let EnrollOutcome::Enrolled(id) = h.engine.enroll(&automation, &snapshot).await.unwrap()
        else {
            panic!("expected enrollment");
        };

        // enrolling applies the leading delay; the pointer stays on step 0
        let parked = h.enrollments.get(id).await.unwrap().unwrap();
        assert_eq!(parked.status, EnrollmentStatus::Active);
        assert_eq!(parked.current_step_index, 0);
        assert_eq!(parked.next_step_at, Some(enrolled_at + Duration::days(2)));

        // sweeping before the delay elapses leaves the row untouched
        h.engine.process_due().await.unwrap();
        let untouched = h.enrollments.get(id).await.unwrap().unwrap();
        assert_eq!(untouched.current_step_index, 0);
        assert_eq!(untouched.next_step_at, parked.next_step_at);
        assert!(!h
            .entities
            .snapshot(snapshot.kind, snapshot.id)
            .unwrap()
            .has_tag("nurtured"));

        h.clock.advance(Duration::days(2));
        h.engine.process_due().await.unwrap();

        let done = h.enrollments.get(id).await.unwrap().unwrap();
        assert_eq!(done.status, EnrollmentStatus::Completed);
        assert!(h
            .entities
            .snapshot(snapshot.kind, snapshot.id)
            .unwrap()
            .has_tag("nurtured"));
    }

    #[tokio::test]
    async fn branch_routes_by_deal_value() {
        let h = harness();
        let mut automation = Automation::new("deal routing", TriggerType::DealCreated);
        automation.is_multi_step = true;
        h.automations.insert(
            automation.clone(),
            vec![
                AutomationStep::new(
                    automation.id,
                    0,
                    StepConfig::Branch {
                        branches: vec![crate::automations::steps::BranchArm {
                            name: "high_value".into(),
                            conditions: vec![Condition::greater_than("value", 10_000.0)],
                            target_step: 1,
                        }],
                        default_branch: Some(2),
                    },
                ),
                AutomationStep::new(
                    automation.id,
                    1,
                    StepConfig::Action {
                        actions: vec![ActionConfig::AddContactTag { tag: "vip".into() }],
                    },
                )
                .with_next(3),
                AutomationStep::new(
                    automation.id,
                    2,
                    StepConfig::Action {
                        actions: vec![ActionConfig::AddContactTag { tag: "standard".into() }],
                    },
                )
                .with_next(3),
                AutomationStep::new(automation.id, 3, StepConfig::Action { actions: vec![
                    ActionConfig::AddContactTag { tag: "routed".into() },
                ] }),
            ],
        );

        let deal_id = Uuid::new_v4();
        h.entities.insert(EntityKind::Deal, deal_id, json!({ "value": 50_000 }));
        let snapshot = h.entities.snapshot(EntityKind::Deal, deal_id).unwrap();

        h.engine.enroll(&automation, &snapshot).await.unwrap();
        h.engine.process_due().await.unwrap();

        let tags = h.entities.snapshot(EntityKind::Deal, deal_id).unwrap().tags();
        assert!(tags.contains(&"vip".to_string()));
        assert!(!tags.contains(&"standard".to_string()));
        assert!(tags.contains(&"routed".to_string()));
    }

    #[tokio::test]
    async fn condition_gate_without_false_branch_ends_as_skipped() {
        let h = harness();
        let mut automation = Automation::new("gated", TriggerType::ContactUpdated);
        automation.is_multi_step = true;
        h.automations.insert(
            automation.clone(),
            vec![
                AutomationStep::new(
                    automation.id,
                    0,
                    StepConfig::Condition {
                        conditions: vec![Condition::equals("status", json!("qualified"))],
                        false_branch: None,
                    },
                ),
                AutomationStep::new(
                    automation.id,
                    1,
                    StepConfig::Action {
                        actions: vec![ActionConfig::AddContactTag { tag: "qualified".into() }],
                    },
                ),
            ],
        );

        let snapshot = contact(&h, json!({ "status": "new" }));
        let EnrollOutcome::Enrolled(id) = h.engine.enroll(&automation, &snapshot).await.unwrap()
        else {
            panic!("expected enrollment");
        };

        h.engine.process_due().await.unwrap();

        let done = h.enrollments.get(id).await.unwrap().unwrap();
        assert_eq!(done.status, EnrollmentStatus::Completed);
        assert!(!h
            .entities
            .snapshot(snapshot.kind, snapshot.id)
            .unwrap()
            .has_tag("qualified"));

        let statuses: Vec<_> = h.logs.all().iter().map(|l| l.status).collect();
        assert!(statuses.contains(&LogStatus::Skipped));
    }

    #[tokio::test]
    async fn goal_exit_interrupts_the_run() {
        let h = harness();
        let mut automation = Automation::new("until customer", TriggerType::ContactCreated);
        automation.is_multi_step = true;
        automation.exit_criteria.goals_enabled = true;
        automation.exit_criteria.goals = vec![crate::automations::exits::GoalCriterion::TagMatch {
            tags: vec!["customer".into()],
            match_all: false,
            present: true,
        }];
        h.automations.insert(
            automation.clone(),
            vec![
                AutomationStep::new(
                    automation.id,
                    0,
                    StepConfig::Action {
                        actions: vec![ActionConfig::AddContactTag { tag: "customer".into() }],
                    },
                ),
                AutomationStep::new(
                    automation.id,
                    1,
                    StepConfig::Action {
                        actions: vec![ActionConfig::AddContactTag { tag: "never".into() }],
                    },
                ),
            ],
        );

        let snapshot = contact(&h, json!({}));
        let EnrollOutcome::Enrolled(id) = h.engine.enroll(&automation, &snapshot).await.unwrap()
        else {
            panic!("expected enrollment");
        };

        h.engine.process_due().await.unwrap();

        // step 0 tags the contact as customer; the refreshed snapshot trips
        // the goal before step 1 runs
        let done = h.enrollments.get(id).await.unwrap().unwrap();
        assert_eq!(done.status, EnrollmentStatus::Exited);
        assert_eq!(done.exit_reason.as_deref(), Some("goal met"));
        assert!(!h
            .entities
            .snapshot(snapshot.kind, snapshot.id)
            .unwrap()
            .has_tag("never"));
    }

    #[tokio::test]
    async fn failed_action_fails_the_enrollment() {
        let h = harness();
        let mut automation = Automation::new("mail them", TriggerType::ContactCreated);
        automation.is_multi_step = true;
        h.automations.insert(
            automation.clone(),
            vec![AutomationStep::new(
                automation.id,
                0,
                StepConfig::Action {
                    // contact has no email and no explicit recipient
                    actions: vec![ActionConfig::SendEmail {
                        subject: "hi".into(),
                        body: "there".into(),
                        to: None,
                    }],
                },
            )],
        );

        let snapshot = contact(&h, json!({}));
        let EnrollOutcome::Enrolled(id) = h.engine.enroll(&automation, &snapshot).await.unwrap()
        else {
            panic!("expected enrollment");
        };

        h.engine.process_due().await.unwrap();

        let done = h.enrollments.get(id).await.unwrap().unwrap();
        assert_eq!(done.status, EnrollmentStatus::Failed);
        assert_eq!(done.consecutive_errors(), 1);

        let stored = h.automations.get(automation.id).await.unwrap().unwrap();
        assert_eq!(stored.active_count, 0);
        assert_eq!(stored.completed_count, 0);

        // one attempt, one failed audit row
        let failed_logs = h
            .logs
            .all()
            .iter()
            .filter(|l| l.status == LogStatus::Failed)
            .count();
        assert_eq!(failed_logs, 1);
    }

    #[tokio::test]
    async fn deleted_entity_fails_the_enrollment() {
        let h = harness();
        let mut automation = Automation::new("orphan", TriggerType::ContactCreated);
        automation.is_multi_step = true;
        h.automations.insert(
            automation.clone(),
            vec![AutomationStep::new(
                automation.id,
                0,
                StepConfig::Action {
                    actions: vec![ActionConfig::AddContactTag { tag: "x".into() }],
                },
            )],
        );

        let snapshot = contact(&h, json!({}));
        let EnrollOutcome::Enrolled(id) = h.engine.enroll(&automation, &snapshot).await.unwrap()
        else {
            panic!("expected enrollment");
        };

        h.entities.remove(snapshot.kind, snapshot.id);
        h.engine.process_due().await.unwrap();

        let done = h.enrollments.get(id).await.unwrap().unwrap();
        assert_eq!(done.status, EnrollmentStatus::Failed);
        assert!(done.metadata["error"]
            .as_str()
            .unwrap()
            .contains("not found"));
    }

    #[tokio::test]
    async fn unenroll_is_terminal_and_logged() {
        let h = harness();
        let mut automation = Automation::new("leave me", TriggerType::ContactCreated);
        automation.is_multi_step = true;
        h.automations.insert(
            automation.clone(),
            vec![AutomationStep::new(
                automation.id,
                0,
                StepConfig::Delay { days: 30, hours: 0, minutes: 0 },
            )],
        );

        let snapshot = contact(&h, json!({}));
        let EnrollOutcome::Enrolled(id) = h.engine.enroll(&automation, &snapshot).await.unwrap()
        else {
            panic!("expected enrollment");
        };

        h.engine.unenroll(id).await.unwrap();

        let done = h.enrollments.get(id).await.unwrap().unwrap();
        assert_eq!(done.status, EnrollmentStatus::Unenrolled);

        // idempotent on terminal enrollments
        h.engine.unenroll(id).await.unwrap();

        let stored = h.automations.get(automation.id).await.unwrap().unwrap();
        assert_eq!(stored.active_count, 0);
    }

    #[tokio::test]
    async fn single_step_automation_runs_inline() {
        let h = harness();
        let mut automation = Automation::new("legacy tagger", TriggerType::ContactCreated);
        automation.actions = vec![ActionConfig::AddContactTag { tag: "legacy".into() }];
        h.automations.insert(automation.clone(), vec![]);

        let snapshot = contact(&h, json!({}));
        let EnrollOutcome::Enrolled(id) = h.engine.enroll(&automation, &snapshot).await.unwrap()
        else {
            panic!("expected enrollment");
        };

        // drive the inline path directly instead of racing the spawned task
        h.engine.process_single_step(id).await.unwrap();

        let done = h.enrollments.get(id).await.unwrap().unwrap();
        assert_eq!(done.status, EnrollmentStatus::Completed);
        assert!(h
            .entities
            .snapshot(snapshot.kind, snapshot.id)
            .unwrap()
            .has_tag("legacy"));
    }

    #[tokio::test]
    async fn sweep_runs_legacy_actions_when_inline_task_never_ran() {
        let h = harness();
        let mut automation = Automation::new("legacy tagger", TriggerType::ContactCreated);
        automation.actions = vec![ActionConfig::AddContactTag { tag: "lead".into() }];
        h.automations.insert(automation.clone(), vec![]);

        let snapshot = contact(&h, json!({}));

        // an enrollment persisted without its inline run, as after a restart
        let enrollment =
            Enrollment::new(automation.id, snapshot.kind, snapshot.id, h.clock.now());
        h.enrollments.insert(&enrollment).await.unwrap();

        h.engine.process_due().await.unwrap();

        let done = h.enrollments.get(enrollment.id).await.unwrap().unwrap();
        assert_eq!(done.status, EnrollmentStatus::Completed);
        assert!(h
            .entities
            .snapshot(snapshot.kind, snapshot.id)
            .unwrap()
            .has_tag("lead"));
    }

    #[tokio::test]
    async fn insert_race_surfaces_as_already_enrolled() {
        // a store whose uniqueness check loses the race: find_active sees
        // nothing but the insert still hits the active-row constraint
        struct RacyStore(MemoryEnrollmentStore);

        #[async_trait::async_trait]
        impl EnrollmentStore for RacyStore {
            async fn get(&self, id: Uuid) -> EngineResult<Option<Enrollment>> {
                self.0.get(id).await
            }

            async fn find_active(
                &self,
                _automation_id: Uuid,
                _entity_kind: EntityKind,
                _entity_id: Uuid,
            ) -> EngineResult<Option<Enrollment>> {
                Ok(None)
            }

            async fn insert(&self, enrollment: &Enrollment) -> EngineResult<()> {
                self.0.insert(enrollment).await
            }

            async fn update(&self, enrollment: &Enrollment) -> EngineResult<()> {
                self.0.update(enrollment).await
            }

            async fn due(&self, now: DateTime<Utc>) -> EngineResult<Vec<Enrollment>> {
                self.0.due(now).await
            }

            async fn stats(&self, automation_id: Uuid) -> EngineResult<EnrollmentStats> {
                self.0.stats(automation_id).await
            }
        }

        let automations = Arc::new(MemoryAutomationStore::default());
        let mut automation = Automation::new("raced", TriggerType::ContactCreated);
        automation.is_multi_step = true;
        automations.insert(
            automation.clone(),
            vec![AutomationStep::new(
                automation.id,
                0,
                StepConfig::Delay { days: 1, hours: 0, minutes: 0 },
            )],
        );

        let entities = Arc::new(MemoryEntityStore::default());
        let contact_id = Uuid::new_v4();
        entities.insert(EntityKind::Contact, contact_id, json!({}));
        let snapshot = entities.snapshot(EntityKind::Contact, contact_id).unwrap();

        let now = Utc::now();
        let store = MemoryEnrollmentStore::default();
        let existing = Enrollment::new(automation.id, snapshot.kind, snapshot.id, now);
        store.insert(&existing).await.unwrap();

        let engine = Arc::new(AutomationEngine::new(
            automations.clone(),
            Arc::new(RacyStore(store)),
            Arc::new(MemoryLogStore::default()),
            entities,
            Arc::new(MemoryMailer::default()),
            Arc::new(MemoryReminderStore::default()),
            Arc::new(ManualClock::new(now)),
        ));

        let outcome = engine.enroll(&automation, &snapshot).await.unwrap();
        assert_eq!(outcome, EnrollOutcome::AlreadyEnrolled);

        // the rejected attempt must not bump the counters
        let stored = automations.get(automation.id).await.unwrap().unwrap();
        assert_eq!(stored.enrolled_count, 0);
        assert_eq!(stored.active_count, 0);
    }

    #[tokio::test]
    async fn goal_met_by_the_final_step_records_an_exit() {
        let h = harness();
        let mut automation = Automation::new("convert", TriggerType::ContactCreated);
        automation.is_multi_step = true;
        automation.exit_criteria.goals_enabled = true;
        automation.exit_criteria.goals = vec![crate::automations::exits::GoalCriterion::TagMatch {
            tags: vec!["customer".into()],
            match_all: false,
            present: true,
        }];
        h.automations.insert(
            automation.clone(),
            vec![AutomationStep::new(
                automation.id,
                0,
                StepConfig::Action {
                    actions: vec![ActionConfig::AddContactTag { tag: "customer".into() }],
                },
            )],
        );

        let snapshot = contact(&h, json!({}));
        let EnrollOutcome::Enrolled(id) = h.engine.enroll(&automation, &snapshot).await.unwrap()
        else {
            panic!("expected enrollment");
        };

        h.engine.process_due().await.unwrap();

        // the last step itself meets the goal; that beats plain completion
        let done = h.enrollments.get(id).await.unwrap().unwrap();
        assert_eq!(done.status, EnrollmentStatus::Exited);
        assert_eq!(done.exit_reason.as_deref(), Some("goal met"));
    }

    #[tokio::test]
    async fn handle_event_enrolls_all_matching_automations() {
        let h = harness();

        let mut tagger = Automation::new("tag new contacts", TriggerType::ContactCreated);
        tagger.is_multi_step = true;
        h.automations.insert(tagger.clone(), vec![AutomationStep::new(
            tagger.id,
            0,
            StepConfig::Action {
                actions: vec![ActionConfig::AddContactTag { tag: "new".into() }],
            },
        )]);

        let mut deal_only = Automation::new("deal only", TriggerType::DealCreated);
        deal_only.is_multi_step = true;
        h.automations.insert(deal_only.clone(), vec![AutomationStep::new(
            deal_only.id,
            0,
            StepConfig::Delay { days: 1, hours: 0, minutes: 0 },
        )]);

        let snapshot = contact(&h, json!({}));
        let event = TriggerEvent::new(TriggerType::ContactCreated, snapshot, None);

        let outcomes = h.engine.handle_event(&event).await.unwrap();
        assert_eq!(outcomes.len(), 1, "only the contact automation matches");
        assert!(matches!(outcomes[0], EnrollOutcome::Enrolled(_)));
    }
}
