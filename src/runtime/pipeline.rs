//! Per-connection receive and send loops.
//!
//! Each connection runs one receive loop and one send loop, so there is never
//! more than one outstanding read, and frames reach the socket in the order
//! they were queued. Both loops stop as soon as the connection starts tearing
//! down.

use crate::error::{NetError, NetResult};
use crate::packet::{Packet, PacketCodec};
use crate::runtime::connection::Connection;
use crate::runtime::context::{AsyncContext, AsyncContextPool};
use crate::runtime::reassembly::ReassemblyState;
use bytes::Bytes;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::trace;

/// Read from `reader` into the context's chunk and deliver every complete
/// message, in order.
///
/// Returns `Ok(())` when the peer closes between frames or the connection is
/// torn down locally. A peer closing in the middle of a frame is a framing
/// error and the partial frame is never delivered.
pub async fn receive_loop<R, F>(
    mut reader: R,
    ctx: &mut AsyncContext,
    conn: &Connection,
    codec: &dyn PacketCodec,
    mut deliver: F,
) -> NetResult<()>
where
    R: AsyncRead + Unpin,
    F: FnMut(Packet),
{
    let mut state = ReassemblyState::new();
    let header_size = codec.header_size();

    loop {
        ctx.begin(conn.id());

        let read = {
            let window = state.receive_window(ctx.buffer_mut());
            if window.is_empty() {
                return Err(NetError::framing("receive buffer has no free space"));
            }
            tokio::select! {
                biased;
                _ = conn.closed() => return Ok(()),
                read = reader.read(window) => read,
            }
        };

        let n = match read {
            Ok(n) => n,
            Err(e) => {
                ctx.fail(&e);
                return Err(e.into());
            }
        };
        ctx.complete(n);

        if n == 0 {
            if state.is_idle() {
                trace!(conn_id = %conn.id(), "Connection closed by peer");
                return Ok(());
            }
            let buffered = state.buffered(header_size);
            return Err(match state.expected(header_size) {
                Some(expected) => NetError::framing(format!(
                    "connection closed after {buffered} of {expected} frame bytes"
                )),
                None => NetError::framing(format!(
                    "connection closed after {buffered} of {header_size} header bytes"
                )),
            });
        }

        let emitted = state.on_received(ctx.buffer_mut(), n, codec, |payload| {
            deliver(codec.make_packet(payload))
        })?;
        if emitted > 0 {
            trace!(conn_id = %conn.id(), bytes = n, messages = emitted, "Framed messages");
        }
    }
}

/// Drain the connection's outbound queue into `writer`.
///
/// Every frame waits for a send context from `pool` before it is written, so
/// at most `pool.capacity()` frames are being written at once across all
/// connections sharing the pool. Teardown interrupts a write that is stuck on
/// a peer that stopped reading, which drops the writer and returns the
/// context. The writer is shut down when the queue closes or the connection
/// starts tearing down.
pub async fn send_loop<W>(
    mut writer: W,
    mut outbound: mpsc::Receiver<Bytes>,
    pool: Arc<AsyncContextPool>,
    conn: &Connection,
) -> NetResult<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let frame = tokio::select! {
            biased;
            _ = conn.closed() => break,
            frame = outbound.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        let mut ctx = tokio::select! {
            biased;
            _ = conn.closed() => break,
            ctx = pool.acquire() => ctx,
        };
        ctx.begin(conn.id());
        let written = tokio::select! {
            biased;
            _ = conn.closed() => break,
            written = write_frame(&mut writer, &mut ctx, &frame) => written,
        };
        written?;
        trace!(conn_id = %conn.id(), bytes = frame.len(), "Sent frame");
    }

    writer.shutdown().await?;
    Ok(())
}

/// Write one frame through the context's chunk, a chunk at a time.
async fn write_frame<W>(writer: &mut W, ctx: &mut AsyncContext, frame: &[u8]) -> NetResult<()>
where
    W: AsyncWrite + Unpin,
{
    let chunk_size = ctx.buffer().len();
    if chunk_size == 0 {
        return Err(NetError::State("send context has no buffer"));
    }

    for piece in frame.chunks(chunk_size) {
        let buf = &mut ctx.buffer_mut()[..piece.len()];
        buf.copy_from_slice(piece);
        if let Err(e) = writer.write_all(buf).await {
            ctx.fail(&e);
            return Err(e.into());
        }
    }
    ctx.complete(frame.len());
    Ok(())
}
