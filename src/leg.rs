//! `LegConnection` — one side of a proxied session (client-facing or
//! backend-facing), bundling its stream with the credentials/paths it
//! needs to drive its half of the handshake.
//!
//! `receive()` is a single raw read, not a framed read: handshake messages
//! are small and, in practice, arrive in one TCP segment per logical
//! message, so there is no buffering or reassembly loop here. Anything
//! larger than `READ_CHUNK` during the handshake phase is a protocol
//! violation from this proxy's point of view.

use crate::error::ProxyError;
use crate::protocol;
use crate::stream::{ClientStream, ServerStream};
use bytes::Bytes;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const READ_CHUNK: usize = 4096;

/// The client-facing leg. The proxy impersonates a Postgres backend here.
pub struct ReverseLeg {
    pub stream: ClientStream,
    pub tls_cert_path: String,
    pub tls_key_path: String,
}

impl ReverseLeg {
    pub fn peer_addr(&self) -> std::io::Result<SocketAddr> {
        self.stream.peer_addr()
    }

    pub async fn receive(&mut self) -> Result<Bytes, ProxyError> {
        receive(&mut self.stream).await
    }

    pub async fn send(&mut self, msg: Bytes) -> Result<(), ProxyError> {
        send(&mut self.stream, &msg).await
    }

    pub async fn send_ssl_response(&mut self, code: u8) -> Result<(), ProxyError> {
        self.send(protocol::ssl_response(code)).await
    }

    pub async fn send_auth_cleartext_request(&mut self) -> Result<(), ProxyError> {
        self.send(protocol::authentication_cleartext_password()).await
    }

    pub async fn send_auth_ok(&mut self) -> Result<(), ProxyError> {
        self.send(protocol::authentication_ok()).await
    }

    pub async fn send_parameter_status(&mut self, key: &str, value: &str) -> Result<(), ProxyError> {
        self.send(protocol::parameter_status(key, value)).await
    }

    pub async fn send_backend_key_data(&mut self, pid: i32, key: i32) -> Result<(), ProxyError> {
        self.send(protocol::backend_key_data(pid, key)).await
    }

    pub async fn send_ready_for_query(&mut self) -> Result<(), ProxyError> {
        self.send(protocol::ready_for_query()).await
    }

    pub async fn close(&mut self) {
        let _ = self.stream.shutdown().await;
    }
}

/// The backend-facing leg. The proxy impersonates a Postgres client here.
pub struct ForwardLeg {
    pub stream: ServerStream,
    pub host: String,
    pub username: String,
    pub password: String,
    pub database: String,
    pub application_name: String,
}

impl ForwardLeg {
    pub async fn receive(&mut self) -> Result<Bytes, ProxyError> {
        receive(&mut self.stream).await
    }

    pub async fn send(&mut self, msg: Bytes) -> Result<(), ProxyError> {
        send(&mut self.stream, &msg).await
    }

    pub async fn send_ssl_request(&mut self) -> Result<(), ProxyError> {
        self.send(protocol::ssl_request()).await
    }

    pub async fn send_startup_message(&mut self) -> Result<(), ProxyError> {
        let opts = [("application_name", self.application_name.as_str())];
        self.send(protocol::startup_message(&self.username, &self.database, &opts))
            .await
    }

    pub async fn send_password_response(&mut self) -> Result<(), ProxyError> {
        self.send(protocol::password_message(&self.password)).await
    }

    pub async fn close(&mut self) {
        let _ = self.stream.shutdown().await;
    }
}

async fn receive<S: AsyncReadExt + Unpin>(stream: &mut S) -> Result<Bytes, ProxyError> {
    let mut buf = vec![0u8; READ_CHUNK];
    let n = stream.read(&mut buf).await?;
    if n == 0 {
        return Err(ProxyError::Protocol("peer closed connection during handshake".into()));
    }
    buf.truncate(n);
    Ok(Bytes::from(buf))
}

async fn send<S: AsyncWriteExt + Unpin>(stream: &mut S, msg: &[u8]) -> Result<(), ProxyError> {
    stream.write_all(msg).await?;
    stream.flush().await?;
    Ok(())
}
