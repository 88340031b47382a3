// Copyright 2023 Dropflow Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! TCP reachability helpers.

use std::io;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Instant};
use tracing::debug;

/// Backoff between connection attempts while the port is still refusing.
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Checks whether `host:port` accepts TCP connections within `deadline`.
///
/// A deadline of `Some(Duration::ZERO)` performs exactly one connection
/// attempt; `None` keeps trying with no deadline at all.
pub async fn port_is_open(host: &str, port: u16, deadline: Option<Duration>) -> io::Result<bool> {
    write_to_port(host, port, None, deadline).await
}

/// Connects to `host:port` within `deadline` and, if `data` is given, writes
/// it into the connection.
///
/// Returns `Ok(true)` once the connection (and the optional write) succeeded.
/// A refused connection is retried every 100 ms until the deadline expires; a
/// reset means the peer is actively closing on us and yields `Ok(false)`
/// right away, as does running out of time. Any other I/O error is
/// propagated.
pub async fn write_to_port(
    host: &str,
    port: u16,
    data: Option<&[u8]>,
    deadline: Option<Duration>,
) -> io::Result<bool> {
    let start = Instant::now();
    loop {
        let connected = match deadline {
            Some(d) if !d.is_zero() => {
                let Some(remaining) = d.checked_sub(start.elapsed()) else {
                    debug!(host, port, "connection attempts exhausted the deadline");
                    return Ok(false);
                };
                match timeout(remaining, TcpStream::connect((host, port))).await {
                    Ok(res) => res,
                    Err(_) => {
                        debug!(host, port, ?deadline, "timed out while connecting");
                        return Ok(false);
                    }
                }
            }
            _ => TcpStream::connect((host, port)).await,
        };

        match connected {
            Ok(mut stream) => {
                if let Some(data) = data {
                    stream.write_all(data).await?;
                }
                return Ok(true);
            }
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {
                // The peer closed on us; assume it will stay closed.
                debug!(host, port, "connection closed by peer");
                return Ok(false);
            }
            Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                if let Some(d) = deadline {
                    if start.elapsed() >= d {
                        debug!(host, port, ?deadline, "connection refused until the deadline");
                        return Ok(false);
                    }
                }
                sleep(CONNECT_RETRY_DELAY).await;
            }
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                debug!(host, port, "connection attempt timed out");
                return Ok(false);
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    use super::*;

    /// Binds and immediately releases a local port, so a probe against it is
    /// refused.
    async fn free_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_open_port_is_detected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(
            port_is_open("127.0.0.1", port, Some(Duration::from_secs(5)))
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_zero_deadline_is_a_single_attempt() {
        let port = free_port().await;
        let start = std::time::Instant::now();
        assert!(!port_is_open("127.0.0.1", port, Some(Duration::ZERO))
            .await
            .unwrap());
        // One refusal, no retry loop.
        assert!(start.elapsed() < CONNECT_RETRY_DELAY);
    }

    #[tokio::test]
    async fn test_refused_port_retries_until_deadline() {
        let port = free_port().await;
        let deadline = Duration::from_millis(300);
        let start = std::time::Instant::now();
        assert!(!port_is_open("127.0.0.1", port, Some(deadline))
            .await
            .unwrap());
        assert!(start.elapsed() >= Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_payload_is_written() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            stream.read_to_end(&mut buf).await.unwrap();
            buf
        });

        assert!(write_to_port(
            "127.0.0.1",
            port,
            Some(b"ping"),
            Some(Duration::from_secs(5))
        )
        .await
        .unwrap());
        assert_eq!(server.await.unwrap(), b"ping");
    }
}
