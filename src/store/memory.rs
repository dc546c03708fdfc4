//! In-memory queue store with the same semantics as the SQLite adapter.
//!
//! Exists for tests and for embedding without a database file; a single
//! mutex guards all state, which is plenty at test scale.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use crate::config::TargetConfig;
use crate::error::Error;
use crate::store::{Delivery, DeliveryStatus, Message, QueueStore, RetryPolicy, Target};

#[derive(Default)]
struct Inner {
    next_message_id: i64,
    next_delivery_id: i64,
    messages: BTreeMap<i64, Message>,
    deliveries: Vec<Delivery>,
    targets: Vec<Target>,
}

pub struct MemoryStore {
    retry: RetryPolicy,
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new(retry: RetryPolicy) -> Self {
        Self {
            retry,
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("store mutex poisoned")
    }
}

fn now() -> i64 {
    Utc::now().timestamp()
}

fn eligible(delivery: &Delivery, now: i64) -> bool {
    matches!(
        delivery.status,
        DeliveryStatus::Pending | DeliveryStatus::Sending | DeliveryStatus::Failed
    ) && delivery.next_retry_at.map_or(true, |at| at <= now)
        && delivery.send_attempts < delivery.max_attempts
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn save_message(
        &self,
        payload: &[u8],
        source_label: Option<&str>,
    ) -> Result<i64, Error> {
        let mut inner = self.lock();
        let stamp = now();

        inner.next_message_id += 1;
        let message_id = inner.next_message_id;

        inner.messages.insert(
            message_id,
            Message {
                id: message_id,
                source_ip: source_label.map(str::to_owned),
                original_data: payload.to_vec(),
                data_length: payload.len() as i64,
                created_at: stamp,
                processed_at: None,
                status: "received".to_owned(),
            },
        );

        let mut enabled: Vec<Target> =
            inner.targets.iter().filter(|t| t.enabled).cloned().collect();
        enabled.sort_by_key(|t| (t.priority, t.created_at));

        for target in enabled {
            inner.next_delivery_id += 1;
            let delivery_id = inner.next_delivery_id;
            inner.deliveries.push(Delivery {
                id: delivery_id,
                message_id,
                target_server_id: target.id.clone(),
                target_server_name: target.name.clone(),
                target_address: target.address.clone(),
                status: DeliveryStatus::Pending,
                send_attempts: 0,
                max_attempts: target.max_retries,
                last_attempt_at: None,
                next_retry_at: None,
                sent_at: None,
                last_error: None,
                error_count: 0,
                data_size: payload.len() as i64,
                created_at: stamp,
                updated_at: stamp,
            });
        }

        Ok(message_id)
    }

    async fn claim_pending(&self, target_id: &str, limit: u32) -> Result<Vec<Message>, Error> {
        let inner = self.lock();
        let stamp = now();

        let mut claimed: Vec<Message> = inner
            .deliveries
            .iter()
            .filter(|d| d.target_server_id == target_id && eligible(d, stamp))
            .filter_map(|d| inner.messages.get(&d.message_id).cloned())
            .collect();

        claimed.sort_by_key(|m| (m.created_at, m.id));
        claimed.truncate(limit as usize);

        Ok(claimed)
    }

    async fn mark_sending(
        &self,
        message_id: i64,
        target_id: &str,
        attempts: u32,
    ) -> Result<(), Error> {
        let mut inner = self.lock();
        let stamp = now();

        if let Some(d) = inner.deliveries.iter_mut().find(|d| {
            d.message_id == message_id
                && d.target_server_id == target_id
                && d.status != DeliveryStatus::Sent
        }) {
            d.status = DeliveryStatus::Sending;
            d.last_attempt_at = Some(stamp);
            d.send_attempts = attempts as i64;
            d.updated_at = stamp;
        }

        Ok(())
    }

    async fn mark_sent(&self, message_id: i64, target_id: &str) -> Result<(), Error> {
        let mut inner = self.lock();
        let stamp = now();

        if let Some(d) = inner.deliveries.iter_mut().find(|d| {
            d.message_id == message_id
                && d.target_server_id == target_id
                && d.status != DeliveryStatus::Sent
        }) {
            d.status = DeliveryStatus::Sent;
            d.sent_at = Some(stamp);
            d.last_error = None;
            d.updated_at = stamp;
        }

        let all_sent = inner
            .deliveries
            .iter()
            .filter(|d| d.message_id == message_id)
            .all(|d| d.status == DeliveryStatus::Sent);
        if all_sent {
            if let Some(message) = inner.messages.get_mut(&message_id) {
                if message.processed_at.is_none() {
                    message.processed_at = Some(stamp);
                    message.status = "processed".to_owned();
                }
            }
        }

        Ok(())
    }

    async fn mark_failed(
        &self,
        message_id: i64,
        target_id: &str,
        attempts: u32,
        error: &str,
    ) -> Result<(), Error> {
        let delay = self.retry.delay_after(attempts);
        let mut inner = self.lock();
        let stamp = now();

        if let Some(d) = inner.deliveries.iter_mut().find(|d| {
            d.message_id == message_id
                && d.target_server_id == target_id
                && d.status != DeliveryStatus::Sent
        }) {
            d.status = DeliveryStatus::Failed;
            d.last_attempt_at = Some(stamp);
            d.send_attempts = attempts as i64;
            d.next_retry_at = Some(stamp + delay.as_secs() as i64);
            d.last_error = Some(error.to_owned());
            d.error_count += 1;
            d.updated_at = stamp;
        }

        Ok(())
    }

    async fn get_attempts(&self, message_id: i64, target_id: &str) -> Result<u32, Error> {
        let inner = self.lock();

        inner
            .deliveries
            .iter()
            .find(|d| d.message_id == message_id && d.target_server_id == target_id)
            .map(|d| d.send_attempts.max(0) as u32)
            .ok_or_else(|| Error::Persist {
                source: sqlx::Error::RowNotFound,
            })
    }

    async fn reconcile_targets(&self, configured: &[TargetConfig]) -> Result<(), Error> {
        let mut inner = self.lock();
        let stamp = now();

        for target in configured {
            match inner.targets.iter_mut().find(|t| t.id == target.id) {
                Some(stored) => {
                    stored.name = target.name.clone();
                    stored.address = target.address.clone();
                    stored.enabled = target.enabled;
                    stored.connection_timeout_sec = target.timeout_secs as i64;
                    stored.max_retries = target.max_retries as i64;
                    stored.batch_size = target.batch_size as i64;
                    stored.priority = target.priority as i64;
                }
                None => inner.targets.push(Target {
                    id: target.id.clone(),
                    name: target.name.clone(),
                    address: target.address.clone(),
                    enabled: target.enabled,
                    connection_timeout_sec: target.timeout_secs as i64,
                    max_retries: target.max_retries as i64,
                    batch_size: target.batch_size as i64,
                    priority: target.priority as i64,
                    created_at: stamp,
                }),
            }
        }

        for stored in inner.targets.iter_mut() {
            if !configured.iter().any(|t| t.id == stored.id) {
                stored.enabled = false;
            }
        }

        Ok(())
    }

    async fn list_enabled_targets(&self) -> Result<Vec<Target>, Error> {
        let inner = self.lock();

        let mut targets: Vec<Target> =
            inner.targets.iter().filter(|t| t.enabled).cloned().collect();
        targets.sort_by_key(|t| (t.priority, t.created_at));

        Ok(targets)
    }

    async fn delivery(
        &self,
        message_id: i64,
        target_id: &str,
    ) -> Result<Option<Delivery>, Error> {
        let inner = self.lock();

        Ok(inner
            .deliveries
            .iter()
            .find(|d| d.message_id == message_id && d.target_server_id == target_id)
            .cloned())
    }
}
