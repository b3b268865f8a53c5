//! Test doubles for the session layer and polling helpers for task state.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::session::{FetchedPage, Session, SessionError, SessionFactory};
use crate::task::{TaskId, TaskRecord, TaskStatus, TaskStore};

/// Body served for a challenge response.
pub const CHALLENGE_BODY: &str = "<html><body>请完成拼图校验</body></html>";

/// Scripted response for one fetch.
#[derive(Clone, Debug, PartialEq)]
pub enum Scripted {
    Ok(String),
    Challenge,
    Error(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    Opened(u64),
    WarmedUp(u64),
    Fetched { session: u64, url: String },
    Refreshed(u64),
    Closed(u64),
}

#[derive(Default)]
struct Script {
    responses: Mutex<HashMap<String, VecDeque<Scripted>>>,
    fetches: Mutex<HashMap<String, usize>>,
    log: Mutex<Vec<SessionEvent>>,
}

/// Session factory whose sessions replay scripted responses per URL and log
/// every interaction. Unscripted fetches succeed.
pub struct ScriptedSessionFactory {
    script: Arc<Script>,
    serial: AtomicU64,
    fail_opens: AtomicBool,
    fetch_delay: Mutex<Duration>,
}

impl ScriptedSessionFactory {
    pub fn new() -> Self {
        Self {
            script: Arc::new(Script::default()),
            serial: AtomicU64::new(1),
            fail_opens: AtomicBool::new(false),
            fetch_delay: Mutex::new(Duration::ZERO),
        }
    }

    /// Queues responses for `url`, consumed one per fetch.
    pub fn script(&self, url: &str, responses: Vec<Scripted>) {
        self.script
            .responses
            .lock()
            .entry(url.to_string())
            .or_default()
            .extend(responses);
    }

    pub fn fail_opens(&self, fail: bool) {
        self.fail_opens.store(fail, Ordering::SeqCst);
    }

    /// Makes every fetch take at least `delay`.
    pub fn set_fetch_delay(&self, delay: Duration) {
        *self.fetch_delay.lock() = delay;
    }

    pub fn events(&self) -> Vec<SessionEvent> {
        self.script.log.lock().clone()
    }

    pub fn fetch_count(&self, url: &str) -> usize {
        self.script.fetches.lock().get(url).copied().unwrap_or(0)
    }

    pub fn total_fetches(&self) -> usize {
        self.script.fetches.lock().values().sum()
    }

    pub fn opened(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, SessionEvent::Opened(_)))
            .count()
    }
}

impl Default for ScriptedSessionFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionFactory for ScriptedSessionFactory {
    fn open(&self) -> Result<Box<dyn Session>, SessionError> {
        if self.fail_opens.load(Ordering::SeqCst) {
            return Err(SessionError::Setup("scripted open failure".to_string()));
        }
        let id = self.serial.fetch_add(1, Ordering::SeqCst);
        self.script.log.lock().push(SessionEvent::Opened(id));
        Ok(Box::new(ScriptedSession {
            id,
            script: Arc::clone(&self.script),
            delay: *self.fetch_delay.lock(),
        }))
    }
}

struct ScriptedSession {
    id: u64,
    script: Arc<Script>,
    delay: Duration,
}

impl Session for ScriptedSession {
    fn id(&self) -> u64 {
        self.id
    }

    fn warm_up(&mut self) -> Result<(), SessionError> {
        self.script.log.lock().push(SessionEvent::WarmedUp(self.id));
        Ok(())
    }

    fn fetch(&mut self, url: &str) -> Result<FetchedPage, SessionError> {
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        self.script.log.lock().push(SessionEvent::Fetched {
            session: self.id,
            url: url.to_string(),
        });
        *self.script.fetches.lock().entry(url.to_string()).or_insert(0) += 1;
        let next = self
            .script
            .responses
            .lock()
            .get_mut(url)
            .and_then(|queue| queue.pop_front());
        match next {
            None => Ok(FetchedPage::new(url, 200, format!("content of {}", url))),
            Some(Scripted::Ok(body)) => Ok(FetchedPage::new(url, 200, body)),
            Some(Scripted::Challenge) => Ok(FetchedPage::new(url, 200, CHALLENGE_BODY)),
            Some(Scripted::Error(msg)) => Err(SessionError::Network(msg)),
        }
    }

    fn refresh(&mut self) -> Result<(), SessionError> {
        self.script.log.lock().push(SessionEvent::Refreshed(self.id));
        Ok(())
    }

    fn close(&mut self) {
        self.script.log.lock().push(SessionEvent::Closed(self.id));
    }
}

/// Polls `store` until task `id` has `status`. Panics after `timeout`, or as
/// soon as the task settles in a different terminal status.
pub fn wait_for_status(store: &dyn TaskStore, id: TaskId, status: TaskStatus, timeout: Duration) -> TaskRecord {
    let deadline = Instant::now() + timeout;
    loop {
        let record = store
            .get_task(id)
            .ok()
            .flatten()
            .unwrap_or_else(|| panic!("task {} not found", id));
        if record.status == status {
            return record;
        }
        if record.status.is_terminal() {
            panic!(
                "task {} settled as {} ({:?}) while waiting for {}",
                id, record.status, record.error_message, status
            );
        }
        if Instant::now() >= deadline {
            panic!("task {} still {} after {:?}, wanted {}", id, record.status, timeout, status);
        }
        thread::sleep(Duration::from_millis(5));
    }
}

/// Polls until `predicate` holds for the task record.
pub fn wait_until<P>(store: &dyn TaskStore, id: TaskId, timeout: Duration, predicate: P) -> TaskRecord
where
    P: Fn(&TaskRecord) -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        let record = store.get_task(id).ok().flatten();
        match record {
            Some(record) if predicate(&record) => return record,
            last if Instant::now() >= deadline => {
                panic!("condition not reached for task {}: {:?}", id, last)
            }
            _ => thread::sleep(Duration::from_millis(5)),
        }
    }
}
