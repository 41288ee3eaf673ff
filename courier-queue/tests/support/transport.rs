//! A transport that records what it was asked to send and answers from a
//! script.
#![allow(dead_code)]

use std::{
    collections::VecDeque,
    sync::{
        Mutex, PoisonError,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use courier_smtp::{Email, Stage, Transport, TransportError};

#[derive(Debug, Clone)]
pub enum Reply {
    Accept,
    Reject(TransportError),
    /// Never completes
    Hang,
    /// Accepts after a delay
    Slow(Duration),
    /// Panics mid-send
    Panic,
}

#[derive(Debug)]
pub struct FakeTransport {
    /// Used once the script runs out
    fallback: Reply,
    script: Mutex<VecDeque<Reply>>,
    sent: Mutex<Vec<Email>>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeTransport {
    pub fn new(fallback: Reply) -> Self {
        Self {
            fallback,
            script: Mutex::new(VecDeque::new()),
            sent: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn accepting() -> Self {
        Self::new(Reply::Accept)
    }

    pub fn rejecting() -> Self {
        Self::new(Reply::Reject(TransportError::new(
            Stage::RcptTo,
            "550 5.1.1 mailbox unavailable",
        )))
    }

    /// Replies used for the next calls, in order, before the fallback.
    pub fn then(self, reply: Reply) -> Self {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(reply);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Emails that were accepted.
    pub fn sent(&self) -> Vec<Email> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn next_reply(&self) -> Reply {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn send(&self, email: &Email) -> Result<(), TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        let result = match self.next_reply() {
            Reply::Accept => Ok(()),
            Reply::Reject(e) => Err(e),
            Reply::Hang => std::future::pending().await,
            Reply::Slow(delay) => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
            Reply::Panic => panic!("transport failed mid-send"),
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if result.is_ok() {
            self.sent
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(email.clone());
        }
        result
    }
}
