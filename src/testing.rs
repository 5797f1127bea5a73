//! Scripted stand-ins for stores, actuators and the sleeper.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::actuator::{ActuationContext, ActuationOutcome, Actuator};
use crate::error::{AppError, Result};
use crate::poll::Sleeper;
use crate::store::{Row, StoreHandle};

/// One scripted answer to `query_one`.
#[derive(Debug, Clone)]
pub enum Scripted {
    Row(Row),
    Missing,
    /// Connection-level failure.
    Unavailable,
    /// The statement is wrong, e.g. names a column the table lacks.
    Broken(String),
}

impl Scripted {
    pub fn row(row: Row) -> Self {
        Scripted::Row(row)
    }
}

/// Answers each statement from a script. The last entry repeats once the rest are used up.
pub struct ScriptedStore {
    name: String,
    available: AtomicBool,
    scripts: Mutex<HashMap<String, VecDeque<Scripted>>>,
    queries: Mutex<Vec<(String, Vec<String>)>>,
    executes: Mutex<Vec<(String, Vec<String>)>>,
    rows_affected: Mutex<HashMap<String, u64>>,
}

impl ScriptedStore {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            available: AtomicBool::new(true),
            scripts: Mutex::new(HashMap::new()),
            queries: Mutex::new(Vec::new()),
            executes: Mutex::new(Vec::new()),
            rows_affected: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn script(&self, statement: &str, answers: Vec<Scripted>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(statement.to_string(), answers.into());
    }

    pub fn set_rows_affected(&self, statement: &str, rows: u64) {
        self.rows_affected
            .lock()
            .unwrap()
            .insert(statement.to_string(), rows);
    }

    pub fn query_count(&self, statement: &str) -> usize {
        self.queries
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, _)| s == statement)
            .count()
    }

    pub fn query_params(&self, statement: &str) -> Vec<Vec<String>> {
        self.queries
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, _)| s == statement)
            .map(|(_, p)| p.clone())
            .collect()
    }

    pub fn executed(&self) -> Vec<(String, Vec<String>)> {
        self.executes.lock().unwrap().clone()
    }

    fn next_answer(&self, statement: &str) -> Scripted {
        let mut scripts = self.scripts.lock().unwrap();
        match scripts.get_mut(statement) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap(),
            Some(queue) => queue.front().cloned().unwrap_or(Scripted::Missing),
            None => Scripted::Missing,
        }
    }
}

#[async_trait]
impl StoreHandle for ScriptedStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn query_one(&self, statement: &str, params: &[String]) -> Result<Option<Row>> {
        self.queries
            .lock()
            .unwrap()
            .push((statement.to_string(), params.to_vec()));

        match self.next_answer(statement) {
            Scripted::Row(row) => Ok(Some(row)),
            Scripted::Missing => Ok(None),
            Scripted::Unavailable => Err(AppError::Unreachable("connection refused".to_string())),
            Scripted::Broken(reason) => Err(AppError::Store(reason)),
        }
    }

    async fn execute(&self, statement: &str, params: &[String]) -> Result<u64> {
        self.executes
            .lock()
            .unwrap()
            .push((statement.to_string(), params.to_vec()));
        Ok(self
            .rows_affected
            .lock()
            .unwrap()
            .get(statement)
            .copied()
            .unwrap_or(1))
    }

    async fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }
}

/// Returns scripted outcomes in order, repeating the last. Empty script means success.
pub struct ScriptedActuator {
    name: String,
    outcomes: Mutex<VecDeque<ActuationOutcome>>,
    calls: Mutex<Vec<ActuationContext>>,
}

impl ScriptedActuator {
    pub fn new(name: &str, outcomes: Vec<ActuationOutcome>) -> Self {
        Self {
            name: name.to_string(),
            outcomes: Mutex::new(outcomes.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn succeeding(name: &str) -> Self {
        Self::new(name, Vec::new())
    }

    pub fn calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn contexts(&self) -> Vec<ActuationContext> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Actuator for ScriptedActuator {
    fn name(&self) -> &str {
        &self.name
    }

    async fn act(&self, context: &ActuationContext) -> ActuationOutcome {
        self.calls.lock().unwrap().push(context.clone());
        let mut outcomes = self.outcomes.lock().unwrap();
        if outcomes.len() > 1 {
            outcomes.pop_front().unwrap()
        } else {
            outcomes.front().cloned().unwrap_or(ActuationOutcome::Success)
        }
    }
}

/// Records requested waits and returns at once.
#[derive(Default)]
pub struct InstantSleeper {
    waits: Mutex<Vec<Duration>>,
}

impl InstantSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn waits(&self) -> Vec<Duration> {
        self.waits.lock().unwrap().clone()
    }
}

#[async_trait]
impl Sleeper for InstantSleeper {
    async fn sleep(&self, duration: Duration) {
        self.waits.lock().unwrap().push(duration);
        tokio::task::yield_now().await;
    }
}
