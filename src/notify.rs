use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::models::{Notification, NotificationRequest, RiskStatus, SubjectAttendanceMetric};
use crate::store::{encode, Collection, Direction, Query, RecordStore, StoreError, WriteBatch, WriteOp};

pub const ATTENDANCE_ALERT: &str = "attendance_alert";
pub const ATTENDANCE_WARNING: &str = "attendance_warning";

/// Last status seen per student and subject.
///
/// Owned by the caller; serializable so it can be persisted between runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastKnownStatus {
    students: BTreeMap<String, BTreeMap<String, RiskStatus>>,
}

impl LastKnownStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, student_id: &str, subject_code: &str) -> Option<RiskStatus> {
        self.students
            .get(student_id)
            .and_then(|subjects| subjects.get(subject_code))
            .copied()
    }

    pub fn set(&mut self, student_id: &str, subject_code: &str, status: RiskStatus) {
        self.students
            .entry(student_id.to_string())
            .or_default()
            .insert(subject_code.to_string(), status);
    }

    pub fn len(&self) -> usize {
        self.students.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Emits one request when a subject's status crosses into `notify_at` or
/// worse, and stays silent until it drops back below.
#[derive(Debug, Clone, Copy)]
pub struct NotificationTrigger {
    notify_at: RiskStatus,
}

impl NotificationTrigger {
    pub fn new(notify_at: RiskStatus) -> Self {
        Self { notify_at }
    }

    pub fn evaluate(
        &self,
        last_known: &mut LastKnownStatus,
        student_id: &str,
        metrics: &[SubjectAttendanceMetric],
    ) -> Vec<NotificationRequest> {
        let mut requests = Vec::new();
        for metric in metrics {
            let previous = last_known
                .get(student_id, &metric.subject_code)
                .unwrap_or(RiskStatus::Safe);
            last_known.set(student_id, &metric.subject_code, metric.status);

            if metric.status >= self.notify_at && previous < self.notify_at {
                debug!(
                    student_id,
                    subject = %metric.subject_code,
                    from = %previous,
                    to = %metric.status,
                    "attendance threshold crossed"
                );
                requests.push(request_for(student_id, metric));
            }
        }
        requests
    }
}

fn request_for(student_id: &str, metric: &SubjectAttendanceMetric) -> NotificationRequest {
    let (kind, title) = match metric.status {
        RiskStatus::Danger => (
            ATTENDANCE_ALERT,
            format!("Attendance critical in {}", metric.subject_code),
        ),
        _ => (
            ATTENDANCE_WARNING,
            format!("Attendance dropping in {}", metric.subject_code),
        ),
    };
    NotificationRequest {
        user_id: student_id.to_string(),
        kind: kind.to_string(),
        title,
        body: format!(
            "Your attendance in {} is {}% ({} of {} classes).",
            metric.subject_code, metric.percentage, metric.attended, metric.total
        ),
        data: json!({
            "subjectCode": metric.subject_code,
            "percentage": metric.percentage,
            "attended": metric.attended,
            "total": metric.total,
            "status": metric.status,
        }),
    }
}

/// Hands notification requests to whatever delivers them.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, request: NotificationRequest) -> Result<()>;
}

/// Stores requests in the `notifications` collection for in-app delivery.
pub struct StoreNotificationSink {
    store: Arc<dyn RecordStore>,
}

impl StoreNotificationSink {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl NotificationSink for StoreNotificationSink {
    async fn deliver(&self, request: NotificationRequest) -> Result<()> {
        let notification = Notification {
            id: Uuid::new_v4().to_string(),
            user_id: request.user_id,
            kind: request.kind,
            title: request.title,
            body: request.body,
            data: request.data,
            read: false,
            read_by: Vec::new(),
            created_at: Utc::now(),
        };
        let mut batch = WriteBatch::new();
        batch.push(WriteOp::Create {
            collection: Collection::Notifications,
            id: notification.id.clone(),
            body: encode(&notification)?,
        });
        self.store.commit(batch).await?;
        info!(
            notification_id = %notification.id,
            user_id = %notification.user_id,
            kind = %notification.kind,
            "notification queued"
        );
        Ok(())
    }
}

fn notification_not_found(err: StoreError) -> CoreError {
    match err {
        StoreError::NotFound { id, .. } => CoreError::not_found("notification", id),
        other => CoreError::Store(other),
    }
}

/// A user's stored notifications.
pub struct NotificationInbox {
    store: Arc<dyn RecordStore>,
}

impl NotificationInbox {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    /// Newest first.
    pub async fn list(&self, user_id: &str, unread_only: bool, limit: usize) -> Result<Vec<Notification>> {
        let mut query = Query::new(Collection::Notifications).eq("userId", user_id);
        if unread_only {
            query = query.eq("read", false);
        }
        let query = query.order_by("createdAt", Direction::Desc).limit(limit);
        self.store
            .query(&query)
            .await?
            .iter()
            .map(|doc| doc.decode().map_err(CoreError::from))
            .collect()
    }

    /// Marks a notification read and records the reader in one commit.
    pub async fn mark_read(&self, notification_id: &str, reader_id: &str) -> Result<()> {
        let mut fields = serde_json::Map::new();
        fields.insert("read".to_string(), json!(true));
        let mut batch = WriteBatch::new();
        batch
            .push(WriteOp::Patch {
                collection: Collection::Notifications,
                id: notification_id.to_string(),
                fields,
            })
            .push(WriteOp::AddToSet {
                collection: Collection::Notifications,
                id: notification_id.to_string(),
                field: "readBy".to_string(),
                value: json!(reader_id),
            });
        self.store
            .commit(batch)
            .await
            .map_err(notification_not_found)
    }

    pub async fn dismiss(&self, notification_id: &str) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.push(WriteOp::Delete {
            collection: Collection::Notifications,
            id: notification_id.to_string(),
        });
        self.store
            .commit(batch)
            .await
            .map_err(notification_not_found)
    }
}
