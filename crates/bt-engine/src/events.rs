//! Shared "publish, log, and move on" helper used by every long-lived task
//! in this crate. Event-publish failures are never allowed to fail the
//! caller's operation — the job/run/schedule state has already been
//! persisted by the time this runs.

use bt_core::{Envelope, Event};
use bt_events::Publisher;
use chrono::{DateTime, Utc};
use tracing::warn;

pub async fn publish_best_effort(publisher: &dyn Publisher, event: Event, source: &str, now: DateTime<Utc>) {
    let envelope = Envelope::new(event, source, now);
    let routing_key = envelope.routing_key();
    if let Err(e) = publisher.publish(&envelope).await {
        warn!(routing_key, error = %e, "event publish failed, discarding");
    }
}
