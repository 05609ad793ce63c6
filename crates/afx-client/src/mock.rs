//! In-memory platform client for tests and local development.
//!
//! Failures are scripted per session and consumed in order; inbound
//! updates are injected through the channel handed out by `open`.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use afx_common::{MessageSnapshot, PlatformError, Session, UpdateEvent};

use crate::{AuthGrant, Dialog, PlatformClient};

const RAW_CHANNEL_CAPACITY: usize = 1024;

/// A send observed by the mock.
#[derive(Debug, Clone)]
pub struct SentMessage {
    pub session_id: String,
    pub dest_ref: String,
    /// True for `copy`, false for a native forward.
    pub copied: bool,
    pub source_msg_id: Option<i64>,
    pub payload: Option<MessageSnapshot>,
    pub silent: bool,
}

#[derive(Default)]
pub struct MockPlatformClient {
    update_txs: DashMap<String, mpsc::Sender<UpdateEvent>>,
    open_errors: Mutex<HashMap<String, VecDeque<PlatformError>>>,
    send_errors: Mutex<HashMap<String, VecDeque<PlatformError>>>,
    ping_errors: Mutex<HashMap<String, VecDeque<PlatformError>>>,
    sent: Mutex<Vec<SentMessage>>,
    dialogs: Mutex<Vec<Dialog>>,
    next_message_id: AtomicI64,
}

impl MockPlatformClient {
    pub fn new() -> Self {
        Self {
            next_message_id: AtomicI64::new(1000),
            ..Default::default()
        }
    }

    /// Queue an error for the session's next `open`.
    pub fn fail_next_open(&self, session_id: &str, error: PlatformError) {
        self.open_errors
            .lock()
            .entry(session_id.to_string())
            .or_default()
            .push_back(error);
    }

    /// Queue an error for the session's next `forward`/`copy`.
    pub fn fail_next_send(&self, session_id: &str, error: PlatformError) {
        self.send_errors
            .lock()
            .entry(session_id.to_string())
            .or_default()
            .push_back(error);
    }

    /// Queue an error for the session's next `health_ping`.
    pub fn fail_next_ping(&self, session_id: &str, error: PlatformError) {
        self.ping_errors
            .lock()
            .entry(session_id.to_string())
            .or_default()
            .push_back(error);
    }

    pub fn set_dialogs(&self, dialogs: Vec<Dialog>) {
        *self.dialogs.lock() = dialogs;
    }

    /// Deliver an inbound update as if observed on the session. The
    /// session must be open.
    pub async fn inject_update(&self, session_id: &str, event: UpdateEvent) -> bool {
        let tx = match self.update_txs.get(session_id) {
            Some(tx) => tx.clone(),
            None => return false,
        };
        tx.send(event).await.is_ok()
    }

    /// Successful sends observed so far.
    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }

    pub fn is_open(&self, session_id: &str) -> bool {
        self.update_txs.contains_key(session_id)
    }

    fn pop_error(
        table: &Mutex<HashMap<String, VecDeque<PlatformError>>>,
        session_id: &str,
    ) -> Option<PlatformError> {
        table.lock().get_mut(session_id).and_then(|q| q.pop_front())
    }
}

#[async_trait]
impl PlatformClient for MockPlatformClient {
    async fn open(
        &self,
        session: &Session,
    ) -> Result<mpsc::Receiver<UpdateEvent>, PlatformError> {
        if let Some(err) = Self::pop_error(&self.open_errors, &session.id) {
            return Err(err);
        }
        let (tx, rx) = mpsc::channel(RAW_CHANNEL_CAPACITY);
        self.update_txs.insert(session.id.clone(), tx);
        Ok(rx)
    }

    async fn send_otp(&self, _session: &Session, phone: &str) -> Result<String, PlatformError> {
        Ok(format!("code-hash:{phone}"))
    }

    async fn verify_otp(
        &self,
        _session: &Session,
        code: &str,
        code_hash: &str,
    ) -> Result<AuthGrant, PlatformError> {
        if code.is_empty() {
            return Err(PlatformError::Unknown("PHONE_CODE_INVALID".into()));
        }
        Ok(AuthGrant {
            credential_blob: format!("cred:{code_hash}:{code}"),
            display_name: Some("Mock Account".to_string()),
        })
    }

    async fn list_dialogs(&self, _session_id: &str) -> Result<Vec<Dialog>, PlatformError> {
        Ok(self.dialogs.lock().clone())
    }

    async fn forward(
        &self,
        session_id: &str,
        _source_ref: &str,
        dest_ref: &str,
        source_msg_id: i64,
        silent: bool,
    ) -> Result<i64, PlatformError> {
        if let Some(err) = Self::pop_error(&self.send_errors, session_id) {
            return Err(err);
        }
        self.sent.lock().push(SentMessage {
            session_id: session_id.to_string(),
            dest_ref: dest_ref.to_string(),
            copied: false,
            source_msg_id: Some(source_msg_id),
            payload: None,
            silent,
        });
        Ok(self.next_message_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn copy(
        &self,
        session_id: &str,
        dest_ref: &str,
        payload: &MessageSnapshot,
        silent: bool,
    ) -> Result<i64, PlatformError> {
        if let Some(err) = Self::pop_error(&self.send_errors, session_id) {
            return Err(err);
        }
        self.sent.lock().push(SentMessage {
            session_id: session_id.to_string(),
            dest_ref: dest_ref.to_string(),
            copied: true,
            source_msg_id: None,
            payload: Some(payload.clone()),
            silent,
        });
        Ok(self.next_message_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn health_ping(&self, session_id: &str) -> Result<(), PlatformError> {
        match Self::pop_error(&self.ping_errors, session_id) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn close(&self, session_id: &str) -> Result<(), PlatformError> {
        self.update_txs.remove(session_id);
        Ok(())
    }
}
