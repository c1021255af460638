//! The I/O loop: pumps bytes between the socket and the protocol client.
use std::sync::{atomic::Ordering, Arc, Weak};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, trace};

use super::Inner;
use crate::amqp::Transport;

const READ_BUFFER_SIZE: usize = 8 * 1024;

pub(super) async fn run(connection: Weak<Inner>, transport: Box<dyn Transport>) {
    let (mut reader, mut writer) = tokio::io::split(transport);
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let Some(inner) = connection.upgrade() else {
            return;
        };
        if inner.stop_io.load(Ordering::SeqCst) {
            break;
        }
        // Completions queued while nobody was looking.
        if inner.has_ready() {
            inner.dispatch_wakeup.notify_one();
        }

        let pending = inner.pending_write();
        let poll_interval = inner.options.poll_interval();
        let wakeup = Arc::clone(&inner.io_wakeup);
        // Only a weak reference is held while waiting on the socket.
        drop(inner);

        tokio::select! {
            read = reader.read(&mut buffer) => {
                let Some(inner) = connection.upgrade() else {
                    return;
                };
                match read {
                    Ok(0) => inner.break_connection("the broker closed the socket".into()),
                    Ok(n) => {
                        trace!(connection = %inner.id, bytes = n, "read");
                        if let Err(e) = inner.on_read(&buffer[..n]) {
                            inner.break_connection(format!("undecodable data from the broker: {e}"));
                        }
                    }
                    Err(e) => inner.break_connection(format!("failed to read from the socket: {e}")),
                }
            }
            written = writer.write(&pending), if !pending.is_empty() => {
                let Some(inner) = connection.upgrade() else {
                    return;
                };
                match written {
                    Ok(0) => inner.break_connection("the socket stopped accepting data".into()),
                    Ok(n) => {
                        trace!(connection = %inner.id, bytes = n, "written");
                        inner.on_write(n);
                    }
                    Err(e) => inner.break_connection(format!("failed to write to the socket: {e}")),
                }
            }
            _ = wakeup.notified() => {}
            _ = tokio::time::sleep(poll_interval) => {}
        }
    }

    // Best effort: nothing tells us whether the broker actually got these bytes.
    let Some(inner) = connection.upgrade() else {
        return;
    };
    let pending = inner.pending_write();
    let flush_timeout = inner.options.poll_interval();
    let id = inner.id;
    drop(inner);
    if pending.is_empty() {
        return;
    }
    let flush = async {
        writer.write_all(&pending).await?;
        writer.flush().await
    };
    match tokio::time::timeout(flush_timeout, flush).await {
        Ok(Ok(())) => {
            if let Some(inner) = connection.upgrade() {
                inner.on_write(pending.len());
            }
        }
        Ok(Err(e)) => debug!(connection = %id, error = %e, "final flush failed"),
        Err(_) => debug!(connection = %id, "final flush timed out"),
    }
}
