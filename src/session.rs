//! `ProxySession` — owns both legs of one proxied connection and drives it
//! from first byte to teardown: reverse handshake, then forward handshake,
//! then the spliced pipe.

use crate::config::Config;
use crate::error::ProxyError;
use crate::leg::{ForwardLeg, ReverseLeg};
use crate::protocol;
use crate::sink::{Direction, ObservationSink, Tee};
use crate::stream::{ClientStream, ServerStream};
use crate::tls;
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// The fixed `ParameterStatus` keys this proxy reports to every client,
/// in order. `server_version` slots in between `is_superuser` and
/// `session_authorization`, filled in from configuration — see
/// `reverse_handshake`.
const SYNTHETIC_PARAMETER_STATUS_HEAD: &[(&str, &str)] = &[
    ("application_name", "psql"),
    ("client_encoding", "UTF8"),
    ("DateStyle", "ISO, MDY"),
    ("integer_datetimes", "on"),
    ("IntervalStyle", "postgres"),
    ("is_superuser", "on"),
];

const SYNTHETIC_PARAMETER_STATUS_TAIL: &[(&str, &str)] = &[
    ("session_authorization", "postgres"),
    ("standard_conforming_strings", "on"),
    ("TimeZone", "Etc/UTC"),
];

pub struct ProxySession {
    conn_id: u64,
    reverse: ReverseLeg,
    forward: ForwardLeg,
    config: Arc<Config>,
    sink: Arc<dyn ObservationSink>,
    teardown: Arc<AtomicBool>,
}

impl ProxySession {
    pub fn new(
        client_socket: tokio::net::TcpStream,
        backend_socket: tokio::net::TcpStream,
        config: Arc<Config>,
        sink: Arc<dyn ObservationSink>,
        conn_id: u64,
    ) -> Self {
        Self {
            conn_id,
            reverse: ReverseLeg {
                stream: ClientStream::Plain(client_socket),
                tls_cert_path: config.tls_cert.clone(),
                tls_key_path: config.tls_key.clone(),
            },
            forward: ForwardLeg {
                stream: ServerStream::Plain(backend_socket),
                host: config.upstream_host.clone(),
                username: config.forward_username.clone(),
                password: config.forward_password.clone(),
                database: config.forward_database.clone(),
                application_name: config.forward_application_name.clone(),
            },
            config,
            sink,
            teardown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Run the full session: reverse handshake, forward handshake, splice.
    /// `handshake_timeout` bounds only the two handshake phases — the
    /// splice runs unbounded so long-lived queries aren't cut off. Tears
    /// both legs down on any handshake error or timeout.
    pub async fn run(mut self, handshake_timeout: std::time::Duration) -> Result<(), ProxyError> {
        let handshake = async {
            self.reverse_handshake().await?;
            self.forward_handshake().await?;
            Ok::<(), ProxyError>(())
        };

        let result = match tokio::time::timeout(handshake_timeout, handshake).await {
            Ok(result) => result,
            Err(_) => Err(ProxyError::Protocol("handshake timed out".into())),
        };

        if let Err(e) = result {
            self.teardown().await;
            return Err(e);
        }

        self.splice().await;
        Ok(())
    }

    /// Impersonate a Postgres backend to the client: offer TLS if asked,
    /// accept any password, then emit the synthetic post-auth burst.
    async fn reverse_handshake(&mut self) -> Result<(), ProxyError> {
        let mut msg = self.reverse.receive().await?;

        if protocol::is_cancel_request(&msg) {
            return Err(ProxyError::Protocol("cancel requests are not supported".into()));
        }

        if protocol::version_of(&msg) == protocol::SSL_REQUEST_CODE {
            self.reverse.send_ssl_response(protocol::SSL_ALLOWED).await?;
            self.reverse.stream = tls::upgrade_reverse_to_server(
                self.reverse.stream,
                &self.reverse.tls_cert_path,
                &self.reverse.tls_key_path,
            )
            .await?;
            msg = self.reverse.receive().await?;
        }

        let attrs = protocol::startup_attributes(&msg);
        debug!(
            conn_id = self.conn_id,
            user = attrs.get("user").map(String::as_str).unwrap_or(""),
            database = attrs.get("database").map(String::as_str).unwrap_or(""),
            "reverse leg startup received"
        );

        self.reverse.send_auth_cleartext_request().await?;
        let _password = self.reverse.receive().await?; // terminated here, never forwarded

        self.reverse.send_auth_ok().await?;
        for (key, value) in SYNTHETIC_PARAMETER_STATUS_HEAD {
            self.reverse.send_parameter_status(key, value).await?;
        }
        self.reverse
            .send_parameter_status("server_version", &self.config.server_version)
            .await?;
        for (key, value) in SYNTHETIC_PARAMETER_STATUS_TAIL {
            self.reverse.send_parameter_status(key, value).await?;
        }

        let (pid, key) = random_backend_key();
        self.reverse.send_backend_key_data(pid, key).await?;
        self.reverse.send_ready_for_query().await?;

        info!(conn_id = self.conn_id, "reverse handshake complete");
        Ok(())
    }

    /// Impersonate a Postgres client to the backend: optionally negotiate
    /// TLS, send the startup message, and complete cleartext auth.
    async fn forward_handshake(&mut self) -> Result<(), ProxyError> {
        if self.config.forward_tls_required() {
            self.forward.send_ssl_request().await?;
            let resp = self.forward.receive().await?;
            match resp.first() {
                Some(&protocol::SSL_ALLOWED) => {
                    self.forward.stream = tls::upgrade_forward_to_client(
                        self.forward.stream,
                        &self.forward.host,
                        self.config.upstream_tls_verify,
                        self.config.upstream_tls_ca.as_deref(),
                    )
                    .await?;
                }
                Some(&protocol::SSL_DENIED) => return Err(ProxyError::SslRefused),
                _ => return Err(ProxyError::Protocol("malformed SSL response from backend".into())),
            }
        }

        self.forward.send_startup_message().await?;
        let msg = self.forward.receive().await?;

        match protocol::auth_code_of(&msg) {
            Some(protocol::auth::CLEARTEXT) => {
                self.forward.send_password_response().await?;
                let msg = self.forward.receive().await?;
                if protocol::is_authentication_ok(&msg) {
                    info!(conn_id = self.conn_id, "forward handshake complete");
                    Ok(())
                } else {
                    Err(ProxyError::AuthRejected)
                }
            }
            Some(code) => Err(ProxyError::UnsupportedAuth(code)),
            None => Err(ProxyError::Protocol("expected Authentication message from backend".into())),
        }
    }

    /// Splice both legs full-duplex until either side closes, then cancel
    /// the other direction within a bounded time.
    async fn splice(self) {
        let (client_read, client_write) = io::split(self.reverse.stream);
        let (server_read, server_write) = io::split(self.forward.stream);

        let cancel = CancellationToken::new();
        let conn_id = self.conn_id;

        let c2s_cancel = cancel.clone();
        let mut c2s_dst = Tee::new(server_write, self.sink.clone(), Direction::ClientToServer);
        let c2s = tokio::spawn(async move {
            let mut src = client_read;
            let result = tokio::select! {
                result = tokio::io::copy(&mut src, &mut c2s_dst) => result,
                _ = c2s_cancel.cancelled() => Ok(0),
            };
            let _ = io::AsyncWriteExt::shutdown(&mut c2s_dst).await;
            result
        });

        let s2c_cancel = cancel.clone();
        let mut s2c_dst = Tee::new(client_write, self.sink.clone(), Direction::ServerToClient);
        let s2c = tokio::spawn(async move {
            let mut src = server_read;
            let result = tokio::select! {
                result = tokio::io::copy(&mut src, &mut s2c_dst) => result,
                _ = s2c_cancel.cancelled() => Ok(0),
            };
            let _ = io::AsyncWriteExt::shutdown(&mut s2c_dst).await;
            result
        });

        tokio::select! {
            _ = c2s => {},
            _ = s2c => {},
        }
        cancel.cancel();

        debug!(conn_id, "splice terminated");
        self.sink.close();
    }

    /// Idempotent: safe to call from multiple paths without double-closing.
    async fn teardown(&mut self) {
        if self.teardown.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_err() {
            return;
        }
        self.reverse.close().await;
        self.forward.close().await;
        self.sink.close();
        warn!(conn_id = self.conn_id, "session torn down before splice");
    }
}

fn random_backend_key() -> (i32, i32) {
    let mut rng = rand::thread_rng();
    (rng.gen_range(1..i32::MAX), rng.gen_range(1..i32::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::NullSink;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    /// Drives a fake Postgres backend through the cleartext forward
    /// handshake this proxy performs, then echoes whatever it receives
    /// until the socket closes — enough to exercise the splice phase too.
    async fn run_fake_backend(listener: TcpListener) {
        let (mut sock, _) = listener.accept().await.unwrap();

        let mut buf = vec![0u8; 4096];
        let n = sock.read(&mut buf).await.unwrap();
        assert_eq!(protocol::version_of(&buf[..n]), protocol::PROTOCOL_VERSION_30);

        sock.write_all(&protocol::authentication_cleartext_password())
            .await
            .unwrap();

        let n = sock.read(&mut buf).await.unwrap();
        assert!(protocol::password_of(&buf[..n]).is_some());

        sock.write_all(&protocol::authentication_ok()).await.unwrap();

        let mut echo = vec![0u8; 4096];
        while let Ok(n) = sock.read(&mut echo).await {
            if n == 0 {
                break;
            }
            if sock.write_all(&echo[..n]).await.is_err() {
                break;
            }
        }
    }

    /// Drives a fake Postgres client through the cleartext reverse
    /// handshake this proxy performs, then sends one probe message and
    /// checks it comes back (splice round-trip), then disconnects.
    async fn run_fake_client(addr: std::net::SocketAddr) {
        let mut sock = TcpStream::connect(addr).await.unwrap();

        sock.write_all(&protocol::startup_message("alice", "appdb", &[]))
            .await
            .unwrap();

        let mut buf = vec![0u8; 4096];
        let n = sock.read(&mut buf).await.unwrap();
        assert_eq!(protocol::auth_code_of(&buf[..n]), Some(protocol::auth::CLEARTEXT));

        sock.write_all(&protocol::password_message("hunter2")).await.unwrap();

        let n = sock.read(&mut buf).await.unwrap();
        assert!(protocol::is_authentication_ok(&buf[..n]));

        // Drain the ParameterStatus / BackendKeyData / ReadyForQuery burst.
        // The proxy writes it in one shot via several small sends; a
        // generous read captures it all for this loopback test.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let _ = sock.read(&mut buf).await.unwrap();

        sock.write_all(b"Q\x00\x00\x00\x09SELECT 1").await.unwrap();
        let n = sock.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"Q\x00\x00\x00\x09SELECT 1");
    }

    #[tokio::test]
    async fn full_session_happy_path() {
        let backend_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = backend_listener.local_addr().unwrap();
        let backend_task = tokio::spawn(run_fake_backend(backend_listener));

        let client_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client_addr = client_listener.local_addr().unwrap();
        let client_task = tokio::spawn(run_fake_client(client_addr));

        let (proxy_client_socket, _) = client_listener.accept().await.unwrap();
        let backend_socket = TcpStream::connect(backend_addr).await.unwrap();

        let mut config = Config::default();
        config.upstream_host = backend_addr.ip().to_string();
        config.upstream_port = backend_addr.port();

        let session = ProxySession::new(
            proxy_client_socket,
            backend_socket,
            Arc::new(config),
            Arc::new(NullSink),
            1,
        );

        session.run(Duration::from_secs(5)).await.unwrap();

        client_task.await.unwrap();
        backend_task.await.unwrap();
    }
}
