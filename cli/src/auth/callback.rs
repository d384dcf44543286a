//! One-shot localhost listener for the authorization code redirect.
//!
//! The listener accepts connections until the first request arrives at the
//! redirect path. That request's query is handed to the waiting login flow
//! through a oneshot channel; later requests (browser retries, reloads) get an
//! acknowledgement page and are otherwise ignored. Anything at another path is
//! answered with 404.
//!
//! The redirect URI names `localhost`, which browsers may resolve to either
//! loopback family, so the listener binds `127.0.0.1` and, where the host
//! has IPv6, `[::1]` on the same port.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::{OrbitError, Result};

const MAX_REQUEST_HEAD: usize = 8192;
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(5);

const SUCCESS_HTML: &str = "<html><body><h1>Login complete</h1><p>You can close this window and return to the terminal.</p></body></html>";
const ERROR_HTML: &str = "<html><body><h1>Login failed</h1><p>Return to the terminal for details.</p></body></html>";
const ALREADY_HTML: &str = "<html><body><h1>Already received</h1><p>This login was already handled. You can close this window.</p></body></html>";
const NOT_FOUND_HTML: &str = "<html><body><h1>Not found</h1></body></html>";

/// Query parameters carried by the authorization redirect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackResult {
    /// Authorization code. Empty when the provider reported an error.
    pub code: String,
    /// The anti-CSRF value echoed by the provider.
    pub state: String,
    /// Provider error (`error`, plus `error_description` when present).
    pub error: Option<String>,
}

/// Parses a request target such as `/callback?code=..&state=..`.
///
/// Returns `None` when the target is not the redirect path.
pub fn parse_callback_target(target: &str, path: &str) -> Option<CallbackResult> {
    if !target.starts_with('/') {
        return None;
    }
    let url = Url::parse(&format!("http://localhost{target}")).ok()?;
    if url.path() != path {
        return None;
    }

    let mut code = String::new();
    let mut state = String::new();
    let mut error = None;
    let mut description = None;
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "code" => code = value.into_owned(),
            "state" => state = value.into_owned(),
            "error" => error = Some(value.into_owned()),
            "error_description" => description = Some(value.into_owned()),
            _ => {},
        }
    }

    let error = match (error, description) {
        (Some(e), Some(d)) if !d.is_empty() => Some(format!("{e}: {d}")),
        (Some(e), _) => Some(e),
        (None, _) if code.is_empty() => Some("redirect carried no authorization code".to_string()),
        (None, _) => None,
    };

    Some(CallbackResult { code, state, error })
}

/// A bound callback listener serving in a background task.
///
/// Dropping the server aborts the task; [`shutdown`](Self::shutdown) also waits
/// until the socket is released.
pub struct CallbackServer {
    local_addr: SocketAddr,
    ipv6_addr: Option<SocketAddr>,
    receiver: Option<oneshot::Receiver<CallbackResult>>,
    task: Option<JoinHandle<()>>,
}

impl CallbackServer {
    /// Binds the loopback addresses on `port` and starts accepting. Port 0
    /// picks a free port.
    ///
    /// Fails with [`OrbitError::CallbackPortInUse`] when the port is taken.
    pub async fn start(port: u16, path: &str) -> Result<Self> {
        let v4 = TcpListener::bind((Ipv4Addr::LOCALHOST, port))
            .await
            .map_err(|e| bind_error(e, port))?;
        let local_addr = v4.local_addr()?;

        let v6 = match TcpListener::bind((Ipv6Addr::LOCALHOST, local_addr.port())).await {
            Ok(listener) => Some(listener),
            Err(e) if e.kind() == io::ErrorKind::AddrInUse && port != 0 => {
                return Err(OrbitError::CallbackPortInUse { port });
            },
            Err(e) => {
                tracing::debug!(error = %e, "IPv6 loopback unavailable; listening on IPv4 only");
                None
            },
        };
        let ipv6_addr = v6.as_ref().map(TcpListener::local_addr).transpose()?;
        tracing::debug!(%local_addr, ?ipv6_addr, path, "callback listener bound");

        let (sender, receiver) = oneshot::channel();
        let task = tokio::spawn(serve(v4, v6, path.to_string(), sender));

        Ok(Self {
            local_addr,
            ipv6_addr,
            receiver: Some(receiver),
            task: Some(task),
        })
    }

    /// IPv4 address the listener is bound to.
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// IPv6 loopback address, when the host has one.
    pub const fn ipv6_addr(&self) -> Option<SocketAddr> {
        self.ipv6_addr
    }

    /// Waits for the redirect, the timeout, or cancellation, whichever comes
    /// first. A server delivers at most one result.
    pub async fn wait_for_callback(
        &mut self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<CallbackResult> {
        let receiver = self.receiver.take().ok_or_else(|| {
            OrbitError::Io(io::Error::other("callback result was already consumed"))
        })?;

        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(OrbitError::Cancelled),
            outcome = tokio::time::timeout(timeout, receiver) => match outcome {
                Ok(Ok(result)) => Ok(result),
                Ok(Err(_)) => Err(OrbitError::Io(io::Error::other("callback listener stopped"))),
                Err(_) => Err(OrbitError::CallbackTimeout),
            },
        }
    }

    /// Stops serving and releases the socket. Calling it again is a no-op.
    pub async fn shutdown(&mut self) -> Result<()> {
        let Some(task) = self.task.take() else {
            return Ok(());
        };
        task.abort();
        match task.await {
            Ok(()) => {},
            Err(e) if e.is_cancelled() => {},
            Err(e) => return Err(OrbitError::Io(io::Error::other(e.to_string()))),
        }
        tracing::debug!(local_addr = %self.local_addr, "callback listener closed");
        Ok(())
    }
}

impl Drop for CallbackServer {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

fn bind_error(err: io::Error, port: u16) -> OrbitError {
    if err.kind() == io::ErrorKind::AddrInUse {
        OrbitError::CallbackPortInUse { port }
    } else {
        OrbitError::Io(err)
    }
}

async fn accept(v4: &TcpListener, v6: Option<&TcpListener>) -> io::Result<(TcpStream, SocketAddr)> {
    match v6 {
        Some(v6) => tokio::select! {
            conn = v4.accept() => conn,
            conn = v6.accept() => conn,
        },
        None => v4.accept().await,
    }
}

async fn serve(
    v4: TcpListener,
    v6: Option<TcpListener>,
    path: String,
    sender: oneshot::Sender<CallbackResult>,
) {
    let mut sender = Some(sender);
    loop {
        let (stream, peer) = match accept(&v4, v6.as_ref()).await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!(error = %e, "callback listener accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            },
        };

        match tokio::time::timeout(CONNECTION_TIMEOUT, handle(stream, &path, &mut sender)).await {
            Ok(Ok(())) => {},
            Ok(Err(e)) => tracing::debug!(%peer, error = %e, "callback connection failed"),
            Err(_) => tracing::debug!(%peer, "callback connection timed out"),
        }
    }
}

async fn handle(
    mut stream: TcpStream,
    path: &str,
    sender: &mut Option<oneshot::Sender<CallbackResult>>,
) -> io::Result<()> {
    let head = read_request_head(&mut stream).await?;
    let result = request_target(&head).and_then(|target| parse_callback_target(target, path));

    let (status, body) = match result {
        None => ("404 Not Found", NOT_FOUND_HTML),
        Some(result) => match sender.take() {
            Some(tx) => {
                let failed = result.error.is_some();
                // The waiter may have given up already; the page is still useful.
                let _ = tx.send(result);
                if failed {
                    ("400 Bad Request", ERROR_HTML)
                } else {
                    ("200 OK", SUCCESS_HTML)
                }
            },
            None => ("200 OK", ALREADY_HTML),
        },
    };

    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}

async fn read_request_head(stream: &mut TcpStream) -> io::Result<String> {
    let mut buffer = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buffer.extend_from_slice(&chunk[..n]);
        if buffer.len() >= MAX_REQUEST_HEAD || buffer.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

fn request_target(head: &str) -> Option<&str> {
    let mut parts = head.lines().next()?.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some("GET"), Some(target)) => Some(target),
        _ => None,
    }
}
