//! New-hop notifications from the filter's event ring buffer.
//!
//! The filter submits one record per hop it starts counting. Each record
//! begins with the hop's ingress and egress interface ids as big-endian u16.

use std::ops::ControlFlow;

use aya::maps::{MapData, RingBuf};
use thiserror::Error;
use tokio::{io::unix::AsyncFd, sync::mpsc};
use tokio_util::sync::CancellationToken;

use crate::hop::Hop;

/// Bytes of a record consumed by the monitor.
const HOP_RECORD_LEN: usize = 4;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("hop record too short: {size} bytes")]
    Truncated { size: usize },

    #[error("hop notification queue closed")]
    QueueClosed,
}

pub fn decode_hop(record: &[u8]) -> Result<Hop, IngestError> {
    if record.len() < HOP_RECORD_LEN {
        return Err(IngestError::Truncated { size: record.len() });
    }
    Ok(Hop::new(
        u16::from_be_bytes([record[0], record[1]]),
        u16::from_be_bytes([record[2], record[3]]),
    ))
}

/// Decodes one record and forwards the hop to the reconciliation loop.
pub fn dispatch(record: &[u8], new_hops: &mpsc::UnboundedSender<Hop>) -> Result<(), IngestError> {
    let hop = decode_hop(record)?;
    new_hops.send(hop).map_err(|_| IngestError::QueueClosed)
}

fn handle_record(record: &[u8], new_hops: &mpsc::UnboundedSender<Hop>) -> ControlFlow<()> {
    match dispatch(record, new_hops) {
        Ok(()) => ControlFlow::Continue(()),
        Err(err @ IngestError::Truncated { .. }) => {
            tracing::warn!(error = %err, "dropping malformed ring buffer record");
            ControlFlow::Continue(())
        }
        Err(err @ IngestError::QueueClosed) => {
            tracing::warn!(error = %err, "stopping ring buffer reader");
            ControlFlow::Break(())
        }
    }
}

/// Drains the event ring buffer until `shutdown` fires or the buffer fails.
///
/// A read error ends this task only; nothing is retried.
pub async fn read_loop(
    ring_buf: RingBuf<MapData>,
    new_hops: mpsc::UnboundedSender<Hop>,
    shutdown: CancellationToken,
) {
    let mut async_fd = match AsyncFd::new(ring_buf) {
        Ok(fd) => fd,
        Err(err) => {
            tracing::warn!(error = %err, "error reading from ring buffer");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!("ring buffer closed");
                return;
            }
            result = async_fd.readable_mut() => {
                let mut guard = match result {
                    Ok(guard) => guard,
                    Err(err) => {
                        tracing::warn!(error = %err, "error reading from ring buffer");
                        return;
                    }
                };

                let rb = guard.get_inner_mut();
                while let Some(item) = rb.next() {
                    if handle_record(&item, &new_hops).is_break() {
                        return;
                    }
                }

                guard.clear_ready();
            }
        }
    }
}
