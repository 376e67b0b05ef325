//! Per-connection entry point: dial the backend, build a session, run it
//! under a handshake timeout.

use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::warn;

use crate::config::{Config, SinkMode};
use crate::session::ProxySession;
use crate::sink::{LoggingSink, NullSink, ObservationSink};

pub async fn handle_connection(client_socket: TcpStream, config: Arc<Config>, conn_id: u64) {
    let peer = client_socket
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".into());

    let upstream_addr = format!("{}:{}", config.upstream_host, config.upstream_port);
    let backend_socket = match TcpStream::connect(&upstream_addr).await {
        Ok(s) => s,
        Err(e) => {
            warn!(conn_id, peer, upstream = %upstream_addr, error = %e, "failed to connect upstream");
            return;
        }
    };

    let sink: Arc<dyn ObservationSink> = match config.sink_mode {
        SinkMode::None => Arc::new(NullSink),
        SinkMode::Log => LoggingSink::new(),
    };

    let session = ProxySession::new(client_socket, backend_socket, Arc::clone(&config), sink, conn_id);
    let timeout = Duration::from_secs(config.handshake_timeout_secs);

    if let Err(e) = session.run(timeout).await {
        warn!(conn_id, peer, error = %e, "session failed");
    }
}
