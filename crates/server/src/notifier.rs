use tollgate_core::notify::{ApprovalNotification, ApprovalNotifier};
use tracing::info;

/// Publishes notifications as structured log events for downstream shippers.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingNotifier;

impl ApprovalNotifier for TracingNotifier {
    fn notify(&self, notification: ApprovalNotification) {
        let recipients =
            notification.recipients.iter().map(|id| id.as_str()).collect::<Vec<_>>().join(",");
        info!(
            event_name = "approval.notification.emitted",
            correlation_id = %notification.correlation_id,
            notification_id = %notification.notification_id,
            kind = notification.kind.as_str(),
            request_id = %notification.request_id,
            hierarchy_id = %notification.hierarchy_id,
            entity_id = %notification.entity_id,
            level_number = ?notification.level_number,
            status = notification.status.as_str(),
            recipients = %recipients,
            "approval notification emitted"
        );
    }
}
