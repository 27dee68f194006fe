use std::sync::Arc;
use std::time::Instant;

use crate::buffer::Buffer;
use crate::connection::TcpConnection;
use crate::event_loop::EventLoop;

pub type TcpConnectionPtr = Arc<TcpConnection>;

/// Invoked on both establish and teardown; distinguish with
/// [`TcpConnection::connected`].
pub type ConnectionCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;

/// Invoked when bytes arrive. The callback may consume any prefix of the
/// buffer; unconsumed bytes persist until the next call.
pub type MessageCallback = Arc<dyn Fn(&TcpConnectionPtr, &mut Buffer, Instant) + Send + Sync>;

/// Invoked once the output buffer has fully drained to the kernel.
pub type WriteCompleteCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;

/// Invoked when the output buffer crosses the high-water mark upward; the
/// second argument is the buffered size at that point.
pub type HighWaterMarkCallback = Arc<dyn Fn(&TcpConnectionPtr, usize) + Send + Sync>;

pub type CloseCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;

pub type ThreadInitCallback = Arc<dyn Fn(&Arc<EventLoop>) + Send + Sync>;

/// Installed by the server when the user registers no connection callback.
pub fn default_connection_callback(conn: &TcpConnectionPtr) {
    debug!(
        "{} -> {} is {}",
        conn.local_addr(),
        conn.peer_addr(),
        if conn.connected() { "UP" } else { "DOWN" }
    );
}

/// Installed by the server when the user registers no message callback;
/// drops incoming bytes so the input buffer cannot grow without bound.
pub fn default_message_callback(
    _conn: &TcpConnectionPtr,
    buffer: &mut Buffer,
    _receive_time: Instant,
) {
    buffer.retrieve_all();
}
