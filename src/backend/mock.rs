//! In-process backend for tests.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use tokio::sync::{Notify, oneshot};

use super::{BackendError, ExecutionBackend, Result, Submission};
use crate::domain::{CloseStatus, Direction, ExecutionResult, OrderTicket, Position};

pub struct MockBackend {
    available: AtomicBool,
    list_fails: AtomicBool,
    balance: Mutex<Decimal>,
    positions: Mutex<Vec<Position>>,
    closed: Mutex<HashSet<String>>,
    failing: Mutex<HashSet<String>>,
    close_calls: AtomicUsize,
    submitted: Mutex<Vec<OrderTicket>>,
    waiters: Mutex<HashMap<String, oneshot::Sender<ExecutionResult>>>,
    // balance queries park here while held
    held: AtomicBool,
    entered: Notify,
    released: Notify,
}

impl MockBackend {
    pub fn new(balance: Decimal) -> Self {
        Self {
            available: AtomicBool::new(true),
            list_fails: AtomicBool::new(false),
            balance: Mutex::new(balance),
            positions: Mutex::new(Vec::new()),
            closed: Mutex::new(HashSet::new()),
            failing: Mutex::new(HashSet::new()),
            close_calls: AtomicUsize::new(0),
            submitted: Mutex::new(Vec::new()),
            waiters: Mutex::new(HashMap::new()),
            held: AtomicBool::new(false),
            entered: Notify::new(),
            released: Notify::new(),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn set_listing_fails(&self, fails: bool) {
        self.list_fails.store(fails, Ordering::SeqCst);
    }

    pub fn set_balance(&self, balance: Decimal) {
        *self.balance.lock().unwrap() = balance;
    }

    pub fn add_position(&self, id: &str, user_id: &str) {
        self.positions.lock().unwrap().push(Position {
            id: id.to_string(),
            user_id: user_id.to_string(),
            symbol: "EURUSD".to_string(),
            direction: Direction::Long,
            size: Decimal::ONE,
        });
    }

    /// Makes every close of the position fail.
    pub fn fail_close(&self, id: &str) {
        self.failing.lock().unwrap().insert(id.to_string());
    }

    pub fn is_closed(&self, id: &str) -> bool {
        self.closed.lock().unwrap().contains(id)
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub fn submitted(&self) -> Vec<OrderTicket> {
        self.submitted.lock().unwrap().clone()
    }

    /// Parks the next balance query until [`release_balance`] is called.
    ///
    /// [`release_balance`]: MockBackend::release_balance
    pub fn hold_balance(&self) {
        self.held.store(true, Ordering::SeqCst);
    }

    /// Waits until a balance query is parked.
    pub async fn balance_entered(&self) {
        self.entered.notified().await;
    }

    pub fn release_balance(&self) {
        self.held.store(false, Ordering::SeqCst);
        self.released.notify_one();
    }

    /// Delivers a result for a submitted ticket. Returns false if nobody
    /// was waiting for it.
    pub fn settle(&self, request_id: &str, success: bool, pnl: Decimal) -> bool {
        let Some(tx) = self.waiters.lock().unwrap().remove(request_id) else {
            return false;
        };
        tx.send(ExecutionResult {
            request_id: request_id.to_string(),
            success,
            execution_id: format!("exec-{}", request_id),
            pnl,
            balance: None,
            equity: None,
            message: String::new(),
            timestamp: Utc::now(),
        })
        .is_ok()
    }

    /// Drops the result channel of a ticket without a value.
    pub fn lose(&self, request_id: &str) -> bool {
        self.waiters.lock().unwrap().remove(request_id).is_some()
    }
}

#[async_trait]
impl ExecutionBackend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    async fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn account_balance(&self, _user_id: &str) -> Result<Decimal> {
        if self.held.load(Ordering::SeqCst) {
            self.entered.notify_one();
            self.released.notified().await;
        }
        if !self.available.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable("mock offline".into()));
        }
        Ok(*self.balance.lock().unwrap())
    }

    async fn submit(&self, ticket: &OrderTicket) -> Result<Submission> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable("mock offline".into()));
        }
        let (tx, rx) = oneshot::channel();
        self.waiters
            .lock()
            .unwrap()
            .insert(ticket.request_id.clone(), tx);
        self.submitted.lock().unwrap().push(ticket.clone());
        Ok(Submission {
            execution_id: format!("exec-{}", ticket.request_id),
            result: rx,
        })
    }

    async fn open_positions(&self, user_id: Option<&str>) -> Result<Vec<Position>> {
        if self.list_fails.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable("positions unavailable".into()));
        }
        let closed = self.closed.lock().unwrap();
        Ok(self
            .positions
            .lock()
            .unwrap()
            .iter()
            .filter(|p| !closed.contains(&p.id))
            .filter(|p| user_id.is_none_or(|u| p.user_id == u))
            .cloned()
            .collect())
    }

    async fn close_position(&self, position: &Position) -> Result<CloseStatus> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.lock().unwrap().contains(&position.id) {
            return Err(BackendError::Api {
                code: 500,
                message: "broker rejected close".into(),
            });
        }
        if self.closed.lock().unwrap().insert(position.id.clone()) {
            Ok(CloseStatus::Closed)
        } else {
            Ok(CloseStatus::AlreadyClosed)
        }
    }
}
