//! Newline-delimited CloudEvent ingestion.
//!
//! Stands in for a queue consumer: each line is one JSON-encoded CloudEvent,
//! handed to the correlation bus before the next line is read. Malformed
//! lines are logged and skipped.

use synapse_core::event::CloudEventBus;
use synapse_types::event::CloudEvent;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IngestStats {
    pub published: usize,
    pub rejected: usize,
}

/// Publish every event read from `reader` until EOF or cancellation.
pub async fn ingest_events<Rd>(reader: Rd, bus: &CloudEventBus, cancel: &CancellationToken) -> std::io::Result<IngestStats>
where
    Rd: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut stats = IngestStats::default();
    let mut line_no = 0usize;

    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            break;
        };
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<CloudEvent>(&line) {
            Ok(event) => {
                let delivered = bus.publish(event);
                tracing::debug!(line = line_no, delivered, "ingested cloud event");
                stats.published += 1;
            }
            Err(e) => {
                tracing::warn!(line = line_no, error = %e, "skipping malformed cloud event");
                stats.rejected += 1;
            }
        }
    }

    tracing::info!(published = stats.published, rejected = stats.rejected, "event ingestion finished");
    Ok(stats)
}
