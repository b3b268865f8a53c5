use std::sync::Arc;

use tracing::{debug, info, warn};

use super::types::{AttemptOutcome, Pass, RunnerConfig, RunnerCursor, UnitOutcome, WorkUnit};
use crate::error::{JobError, JobResult};
use crate::result::RunSummary;
use crate::session::{ChallengeDetector, FetchedPage, Session, SessionFactory};
use crate::task::{ProgressUpdate, TaskHandle};

/// Holds the current session and closes it when replaced or dropped.
struct SessionSlot<'a> {
    factory: &'a dyn SessionFactory,
    current: Option<Box<dyn Session>>,
    opened: u32,
}

impl<'a> SessionSlot<'a> {
    fn new(factory: &'a dyn SessionFactory) -> Self {
        Self {
            factory,
            current: None,
            opened: 0,
        }
    }

    fn is_open(&self) -> bool {
        self.current.is_some()
    }

    /// Close-then-open, then warm the fresh session up.
    fn cycle(&mut self, handle: &TaskHandle, cfg: &RunnerConfig) -> JobResult<()> {
        self.close();
        let mut session = self
            .factory
            .open()
            .map_err(|err| JobError::fatal(format!("failed to open session: {}", err)))?;
        self.opened += 1;
        debug!(task_id = handle.id(), session = session.id(), "session opened");
        if let Err(err) = session.warm_up() {
            warn!(task_id = handle.id(), session = session.id(), error = %err, "warm-up failed");
        }
        self.current = Some(session);
        handle.sleep(cfg.warmup_delay.sample())
    }

    fn close(&mut self) {
        if let Some(mut session) = self.current.take() {
            session.close();
        }
    }
}

impl Drop for SessionSlot<'_> {
    fn drop(&mut self) {
        self.close();
    }
}

/// Drives a job's units through bounded-batch sessions with per-unit retries
/// and a second pass over first-pass failures.
#[derive(Clone)]
pub struct WorkUnitRunner {
    cfg: RunnerConfig,
    factory: Arc<dyn SessionFactory>,
    detector: ChallengeDetector,
}

impl WorkUnitRunner {
    pub fn new(cfg: RunnerConfig, factory: Arc<dyn SessionFactory>, detector: ChallengeDetector) -> Self {
        Self {
            cfg: cfg.normalized(),
            factory,
            detector,
        }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.cfg
    }

    /// Runs every unit, resuming from the cursor saved on `handle` if any.
    /// `deliver` consumes a fetched page (e.g. writes the artifact); its
    /// error counts as a failed attempt.
    pub fn run<F>(&self, handle: &TaskHandle, units: &[WorkUnit], mut deliver: F) -> JobResult<RunSummary>
    where
        F: FnMut(&WorkUnit, &FetchedPage) -> Result<(), String>,
    {
        let mut cursor: RunnerCursor = handle.resume_state_as().unwrap_or_default();
        let mut processed = handle.processed_items();
        let mut first_failed = handle.failed_items();
        let mut slot = SessionSlot::new(self.factory.as_ref());
        let total = units.len();
        let batch = self.cfg.batch_size;

        if cursor.next_index > 0 || cursor.pass == Pass::Retry {
            info!(
                task_id = handle.id(),
                pass = ?cursor.pass,
                next = cursor.next_index,
                "resuming work units from saved cursor"
            );
        }

        if cursor.pass == Pass::First {
            for pos in cursor.next_index..total {
                handle.checkpoint()?;
                if !slot.is_open() || pos % batch == 0 {
                    slot.cycle(handle, &self.cfg)?;
                }
                let unit = &units[pos];
                let outcome = match slot.current.as_mut() {
                    Some(session) => self.process_unit(handle, session.as_mut(), unit, &mut deliver)?,
                    None => return Err(JobError::fatal("no session available")),
                };
                if outcome.is_success() {
                    processed += 1;
                } else {
                    cursor.failed.push(pos);
                    first_failed += 1;
                }
                cursor.next_index = pos + 1;
                handle.update(
                    ProgressUpdate::new()
                        .processed(processed)
                        .failed(first_failed)
                        .step(format!("unit {}/{}", pos + 1, total))
                        .resume_state(cursor.to_value()),
                )?;
                handle.sleep(self.cfg.unit_delay.sample())?;
            }
            cursor.pass = Pass::Retry;
            cursor.next_index = 0;
            slot.close();
            if !cursor.failed.is_empty() {
                info!(task_id = handle.id(), failed = cursor.failed.len(), "retrying failed units");
            }
        }

        let retry: Vec<usize> = cursor.failed.clone();
        for pos in cursor.next_index..retry.len() {
            let Some(unit) = units.get(retry[pos]) else {
                cursor.next_index = pos + 1;
                continue;
            };
            handle.checkpoint()?;
            if !slot.is_open() || pos % batch == 0 {
                slot.cycle(handle, &self.cfg)?;
            }
            let outcome = match slot.current.as_mut() {
                Some(session) => self.process_unit(handle, session.as_mut(), unit, &mut deliver)?,
                None => return Err(JobError::fatal("no session available")),
            };
            if outcome.is_success() {
                processed += 1;
            } else {
                cursor.still_failed.push(unit.index);
            }
            cursor.next_index = pos + 1;
            handle.update(
                ProgressUpdate::new()
                    .processed(processed)
                    .step(format!("retry {}/{}", pos + 1, retry.len()))
                    .resume_state(cursor.to_value()),
            )?;
            handle.sleep(self.cfg.unit_delay.sample())?;
        }
        slot.close();

        let summary = RunSummary {
            total,
            succeeded: processed,
            first_pass_failed: first_failed,
            recovered: cursor.failed.len().saturating_sub(cursor.still_failed.len()),
            still_failed: cursor.still_failed.clone(),
            sessions_opened: slot.opened,
        };
        info!(
            task_id = handle.id(),
            succeeded = summary.succeeded,
            still_failed = summary.still_failed.len(),
            "work units finished"
        );
        Ok(summary)
    }

    /// Up to `max_attempts` attempts on one unit.
    fn process_unit<F>(
        &self,
        handle: &TaskHandle,
        session: &mut dyn Session,
        unit: &WorkUnit,
        deliver: &mut F,
    ) -> JobResult<UnitOutcome>
    where
        F: FnMut(&WorkUnit, &FetchedPage) -> Result<(), String>,
    {
        let max = self.cfg.max_attempts;
        let mut reason = String::new();
        for attempt in 1..=max {
            if attempt > 1 {
                handle.checkpoint()?;
            }
            let remaining = attempt < max;
            match self.attempt(session, unit, deliver) {
                AttemptOutcome::Delivered => {
                    debug!(task_id = handle.id(), unit = unit.index, attempt, "unit delivered");
                    return Ok(UnitOutcome::Succeeded { attempts: attempt });
                }
                AttemptOutcome::Challenged { marker } => {
                    warn!(
                        task_id = handle.id(),
                        unit = unit.index,
                        attempt,
                        session = session.id(),
                        marker = %marker,
                        "challenge detected"
                    );
                    reason = format!("challenge detected ({})", marker);
                    if remaining {
                        handle.sleep(self.cfg.challenge_backoff.sample())?;
                        if let Err(err) = session.refresh() {
                            debug!(task_id = handle.id(), error = %err, "refresh after challenge failed");
                        }
                    }
                }
                AttemptOutcome::Failed { reason: why } => {
                    warn!(task_id = handle.id(), unit = unit.index, attempt, error = %why, "attempt failed");
                    reason = why;
                    if remaining {
                        handle.sleep(self.cfg.error_backoff.sample())?;
                    }
                }
            }
        }
        warn!(task_id = handle.id(), unit = unit.index, url = %unit.url, "all attempts failed");
        Ok(UnitOutcome::Failed {
            attempts: max,
            reason,
        })
    }

    fn attempt<F>(&self, session: &mut dyn Session, unit: &WorkUnit, deliver: &mut F) -> AttemptOutcome
    where
        F: FnMut(&WorkUnit, &FetchedPage) -> Result<(), String>,
    {
        let page = match session.fetch(&unit.url) {
            Ok(page) => page,
            Err(err) => {
                return AttemptOutcome::Failed {
                    reason: err.to_string(),
                }
            }
        };
        if let Some(marker) = self.detector.detect(&page) {
            return AttemptOutcome::Challenged {
                marker: marker.to_string(),
            };
        }
        match deliver(unit, &page) {
            Ok(()) => AttemptOutcome::Delivered,
            Err(reason) => AttemptOutcome::Failed { reason },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::JobResult;
    use crate::task::{
        EventBus, JsonTaskStore, NewTask, ResumeSnapshot, StatusUpdate, TaskManager, TaskRecord, TaskRegistry,
        TaskStatus, WorkFn,
    };
    use crate::testing::{wait_for_status, Scripted, ScriptedSessionFactory, SessionEvent};
    use serde_json::Value;
    use std::time::Duration;

    fn manager() -> TaskManager {
        TaskManager::new(
            Arc::new(JsonTaskStore::in_memory()),
            Arc::new(TaskRegistry::new()),
            EventBus::default(),
            Duration::from_millis(5),
        )
    }

    fn run_job(factory: Arc<ScriptedSessionFactory>, cfg: RunnerConfig, urls: Vec<String>) -> TaskRecord {
        let dyn_factory: Arc<dyn SessionFactory> = factory;
        let runner = WorkUnitRunner::new(cfg, dyn_factory, ChallengeDetector::default());
        let units = WorkUnit::from_urls(urls.clone());
        let work: WorkFn = Arc::new(move |h: &TaskHandle| -> JobResult<Value> {
            let summary = runner.run(h, &units, |_, _| Ok(()))?;
            Ok(summary.to_value())
        });
        let manager = manager();
        let id = manager
            .create_task(NewTask::new("units", "run").total_items(urls.len() as u64), work)
            .unwrap();
        manager.start_task(id).unwrap();
        wait_for_status(manager.store().as_ref(), id, TaskStatus::Completed, Duration::from_secs(10))
    }

    fn urls(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("http://source/unit/{}", i)).collect()
    }

    #[test]
    fn clean_run_completes_everything() {
        let factory = Arc::new(ScriptedSessionFactory::new());
        let rec = run_job(factory.clone(), RunnerConfig::without_delays(), urls(10));
        assert_eq!(rec.processed_items, 10);
        assert_eq!(rec.failed_items, 0);
        assert_eq!(rec.progress, 100);
        let summary: RunSummary = serde_json::from_value(rec.result_data.unwrap()).unwrap();
        assert_eq!(summary.sessions_opened, 1);
        assert!(summary.all_succeeded());
    }

    #[test]
    fn persistent_challenge_is_counted_once_without_a_fourth_attempt() {
        let all = urls(3);
        let factory = Arc::new(ScriptedSessionFactory::new());
        factory.script(&all[1], vec![Scripted::Challenge; 6]);
        let rec = run_job(factory.clone(), RunnerConfig::without_delays(), all.clone());

        assert_eq!(rec.failed_items, 1);
        assert_eq!(rec.processed_items, 2);
        // Three attempts in each pass, never a fourth.
        assert_eq!(factory.fetch_count(&all[1]), 6);
        let refreshes = factory
            .events()
            .into_iter()
            .filter(|e| matches!(e, SessionEvent::Refreshed(_)))
            .count();
        assert_eq!(refreshes, 4);
        let summary: RunSummary = serde_json::from_value(rec.result_data.unwrap()).unwrap();
        assert_eq!(summary.still_failed, vec![1]);
    }

    #[test]
    fn retry_pass_recovers_on_a_fresh_session() {
        let all = urls(4);
        let factory = Arc::new(ScriptedSessionFactory::new());
        factory.script(
            &all[2],
            vec![
                Scripted::Error("reset".into()),
                Scripted::Challenge,
                Scripted::Error("reset".into()),
                Scripted::Ok("recovered".into()),
            ],
        );
        let rec = run_job(factory.clone(), RunnerConfig::without_delays(), all.clone());
        assert_eq!(rec.processed_items, 4);
        assert_eq!(rec.failed_items, 1);
        let summary: RunSummary = serde_json::from_value(rec.result_data.unwrap()).unwrap();
        assert_eq!(summary.recovered, 1);
        assert!(summary.still_failed.is_empty());
        assert_eq!(summary.sessions_opened, 2);

        let events = factory.events();
        let retry_fetch = events
            .iter()
            .rposition(|e| matches!(e, SessionEvent::Fetched { url, .. } if url == &all[2]))
            .unwrap();
        let reopened = events
            .iter()
            .rposition(|e| matches!(e, SessionEvent::Opened(_)))
            .unwrap();
        assert!(reopened < retry_fetch);
    }

    #[test]
    fn sessions_cycle_every_batch() {
        let all = urls(100);
        let factory = Arc::new(ScriptedSessionFactory::new());
        run_job(factory.clone(), RunnerConfig::without_delays(), all.clone());

        let events = factory.events();
        let mut boundaries = Vec::new();
        let mut fetched = 0;
        let mut pending_open = false;
        for event in &events {
            match event {
                SessionEvent::Opened(_) => pending_open = true,
                SessionEvent::Fetched { .. } => {
                    if pending_open {
                        boundaries.push(fetched);
                        pending_open = false;
                    }
                    fetched += 1;
                }
                _ => {}
            }
        }
        assert_eq!(boundaries, vec![0, 45, 90]);
        assert_eq!(factory.opened(), 3);

        // Each new session is preceded by closing the previous one.
        let closes_before_last_open = events
            .iter()
            .take_while(|e| !matches!(e, SessionEvent::Opened(3)))
            .filter(|e| matches!(e, SessionEvent::Closed(_)))
            .count();
        assert_eq!(closes_before_last_open, 2);
    }

    #[test]
    fn open_failure_is_fatal() {
        let factory = Arc::new(ScriptedSessionFactory::new());
        factory.fail_opens(true);
        let dyn_factory: Arc<dyn SessionFactory> = factory;
        let runner = WorkUnitRunner::new(RunnerConfig::without_delays(), dyn_factory, ChallengeDetector::default());
        let units = WorkUnit::from_urls(urls(2));
        let work: WorkFn = Arc::new(move |h: &TaskHandle| -> JobResult<Value> {
            Ok(runner.run(h, &units, |_, _| Ok(()))?.to_value())
        });
        let manager = manager();
        let id = manager
            .create_task(NewTask::new("units", "broken").total_items(2), work)
            .unwrap();
        manager.start_task(id).unwrap();
        let rec = wait_for_status(manager.store().as_ref(), id, TaskStatus::Failed, Duration::from_secs(5));
        assert!(rec.error_message.unwrap().contains("failed to open session"));
    }

    #[test]
    fn delivery_errors_count_as_failed_attempts() {
        let all = urls(2);
        let factory = Arc::new(ScriptedSessionFactory::new());
        let dyn_factory: Arc<dyn SessionFactory> = factory.clone();
        let runner = WorkUnitRunner::new(RunnerConfig::without_delays(), dyn_factory, ChallengeDetector::default());
        let units = WorkUnit::from_urls(all.clone());
        let work: WorkFn = Arc::new(move |h: &TaskHandle| -> JobResult<Value> {
            let summary = runner.run(h, &units, |unit, _| {
                if unit.index == 0 {
                    Err("disk full".to_string())
                } else {
                    Ok(())
                }
            })?;
            Ok(summary.to_value())
        });
        let manager = manager();
        let id = manager
            .create_task(NewTask::new("units", "deliver").total_items(2), work)
            .unwrap();
        manager.start_task(id).unwrap();
        let rec = wait_for_status(manager.store().as_ref(), id, TaskStatus::Completed, Duration::from_secs(5));
        assert_eq!(rec.processed_items, 1);
        assert_eq!(rec.failed_items, 1);
        assert_eq!(factory.fetch_count(&all[0]), 6);
    }

    /// URL fetched first on each freshly opened session, in order.
    fn first_fetch_per_session(events: &[SessionEvent]) -> Vec<String> {
        let mut firsts = Vec::new();
        let mut pending_open = false;
        for event in events {
            match event {
                SessionEvent::Opened(_) => pending_open = true,
                SessionEvent::Fetched { url, .. } if pending_open => {
                    firsts.push(url.clone());
                    pending_open = false;
                }
                _ => {}
            }
        }
        firsts
    }

    fn small_batches() -> RunnerConfig {
        RunnerConfig {
            batch_size: 2,
            ..RunnerConfig::without_delays()
        }
    }

    #[test]
    fn retry_pass_cycles_sessions_on_its_own_positions() {
        let all = urls(10);
        let factory = Arc::new(ScriptedSessionFactory::new());
        for odd in (1..10).step_by(2) {
            factory.script(&all[odd], vec![Scripted::Error("reset".into()); 3]);
        }
        let rec = run_job(factory.clone(), small_batches(), all.clone());
        assert_eq!(rec.processed_items, 10);
        assert_eq!(rec.failed_items, 5);
        let summary: RunSummary = serde_json::from_value(rec.result_data.unwrap()).unwrap();
        assert_eq!(summary.recovered, 5);
        assert_eq!(summary.sessions_opened, 8);

        // First pass opens at units 0, 2, 4, 6, 8; the retry pass over
        // [1, 3, 5, 7, 9] opens at its positions 0, 2 and 4.
        let events = factory.events();
        let expected: Vec<String> = [0, 2, 4, 6, 8, 1, 5, 9].iter().map(|&i| all[i].clone()).collect();
        assert_eq!(first_fetch_per_session(&events), expected);
        for (pos, event) in events.iter().enumerate() {
            if let SessionEvent::Opened(serial) = event {
                let closed_before = events[..pos]
                    .iter()
                    .filter(|e| matches!(e, SessionEvent::Closed(_)))
                    .count() as u64;
                assert_eq!(closed_before, serial - 1, "session {} opened before its predecessor closed", serial);
            }
        }
    }

    #[test]
    fn resume_in_the_middle_of_the_retry_pass_skips_handled_units() {
        let all = urls(10);
        let factory = Arc::new(ScriptedSessionFactory::new());
        let dyn_factory: Arc<dyn SessionFactory> = factory.clone();
        let runner = WorkUnitRunner::new(small_batches(), dyn_factory, ChallengeDetector::default());
        let units = WorkUnit::from_urls(all.clone());
        let work: WorkFn = Arc::new(move |h: &TaskHandle| -> JobResult<Value> {
            Ok(runner.run(h, &units, |_, _| Ok(()))?.to_value())
        });

        // Paused after units 1 and 3 were recovered by the retry pass.
        let cursor = RunnerCursor {
            pass: Pass::Retry,
            next_index: 2,
            failed: vec![1, 3, 5, 7, 9],
            still_failed: Vec::new(),
        };
        let snapshot = ResumeSnapshot {
            processed_items: 7,
            failed_items: 5,
            current_step: Some("retry 2/5".to_string()),
            custom_data: Some(cursor.to_value()),
        };
        let manager = manager();
        let store = manager.store();
        let id = store
            .create_task(NewTask::new("units", "resumed").total_items(10))
            .unwrap();
        store
            .update_task_status(id, StatusUpdate::new(TaskStatus::Running).counters(7, 5))
            .unwrap();
        store
            .update_task_status(
                id,
                StatusUpdate::new(TaskStatus::Paused).resume_data(snapshot.to_value()),
            )
            .unwrap();

        manager.resume_task(id, work).unwrap();
        manager.start_task(id).unwrap();
        let rec = wait_for_status(store.as_ref(), id, TaskStatus::Completed, Duration::from_secs(10));

        assert_eq!(rec.processed_items, 10);
        assert_eq!(rec.failed_items, 5);
        assert_eq!(factory.total_fetches(), 3);
        for handled in [0, 1, 2, 3, 4, 6, 8] {
            assert_eq!(factory.fetch_count(&all[handled]), 0, "unit {} fetched again", handled);
        }
        for remaining in [5, 7, 9] {
            assert_eq!(factory.fetch_count(&all[remaining]), 1);
        }
        assert_eq!(first_fetch_per_session(&factory.events()), vec![all[5].clone(), all[9].clone()]);
        let summary: RunSummary = serde_json::from_value(rec.result_data.unwrap()).unwrap();
        assert_eq!(summary.sessions_opened, 2);
        assert!(summary.still_failed.is_empty());
    }
}
