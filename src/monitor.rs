//! Live attendance watch: section snapshots in, threshold notifications out.

use std::sync::Arc;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::analytics::{self, RiskThresholds};
use crate::attendance::query::section_records_query;
use crate::models::{AttendanceRecord, NotificationRequest, RiskStatus};
use crate::notify::{LastKnownStatus, NotificationSink, NotificationTrigger};
use crate::sync::RealtimeSyncBroker;

pub struct AttendanceMonitor {
    broker: RealtimeSyncBroker,
    thresholds: RiskThresholds,
    trigger: NotificationTrigger,
    sink: Arc<dyn NotificationSink>,
}

/// Runs the trigger over every student in a snapshot of records.
pub fn evaluate_snapshot(
    trigger: &NotificationTrigger,
    thresholds: &RiskThresholds,
    last_known: &mut LastKnownStatus,
    records: &[AttendanceRecord],
) -> Vec<NotificationRequest> {
    let mut requests = Vec::new();
    for (student_id, records) in analytics::group_by_student(records) {
        let metrics = analytics::subject_metrics(&records, thresholds);
        requests.extend(trigger.evaluate(last_known, student_id, &metrics));
    }
    requests
}

fn subject_of(request: &NotificationRequest) -> Option<String> {
    request.data.get("subjectCode")?.as_str().map(str::to_string)
}

impl AttendanceMonitor {
    pub fn new(
        broker: RealtimeSyncBroker,
        thresholds: RiskThresholds,
        trigger: NotificationTrigger,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            broker,
            thresholds,
            trigger,
            sink,
        }
    }

    /// Watches one section until the returned handle is stopped.
    ///
    /// `last_known` seeds the trigger so a restarted watch does not repeat
    /// alerts that were already sent.
    pub fn watch_section(&self, section_id: &str, mut last_known: LastKnownStatus) -> MonitorHandle {
        let mut subscription = self
            .broker
            .subscribe_as::<AttendanceRecord>(section_records_query(section_id));
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let thresholds = self.thresholds;
        let trigger = self.trigger;
        let sink = self.sink.clone();
        let section_id = section_id.to_string();

        let task = tokio::spawn(async move {
            info!(section_id = %section_id, "watching attendance");
            loop {
                let snapshot = tokio::select! {
                    snapshot = subscription.next() => snapshot,
                    _ = &mut stop_rx => None,
                };
                let Some(snapshot) = snapshot else { break };

                let before = last_known.clone();
                let requests = evaluate_snapshot(&trigger, &thresholds, &mut last_known, &snapshot);
                for request in requests {
                    let user_id = request.user_id.clone();
                    let subject_code = subject_of(&request);
                    if let Err(err) = sink.deliver(request).await {
                        warn!(section_id = %section_id, user_id = %user_id, error = %err, "notification delivery failed");
                        // Unsent alerts must fire again on the next snapshot.
                        if let Some(subject_code) = subject_code {
                            let previous = before.get(&user_id, &subject_code).unwrap_or(RiskStatus::Safe);
                            last_known.set(&user_id, &subject_code, previous);
                        }
                    }
                }
            }
            subscription.cancel();
            info!(section_id = %section_id, "attendance watch stopped");
            last_known
        });

        MonitorHandle {
            stop: Some(stop_tx),
            task,
        }
    }
}

pub struct MonitorHandle {
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<LastKnownStatus>,
}

impl MonitorHandle {
    /// Stops the watch and returns the trigger state for persistence.
    pub async fn stop(mut self) -> LastKnownStatus {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        match (&mut self.task).await {
            Ok(last_known) => last_known,
            Err(err) => {
                warn!(error = %err, "attendance watch ended abnormally");
                LastKnownStatus::default()
            }
        }
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        if self.stop.is_some() {
            self.task.abort();
        }
    }
}
