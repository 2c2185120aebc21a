//! HTTP/1.1 upgrade handshake.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::BytesMut;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::TransportError;

/// Upper bound on the response header block.
const MAX_RESPONSE_HEADER: usize = 8 * 1024;

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Fixed suffix hashed with the request key to form the accept key.
const ACCEPT_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Returns a fresh opaque key: 16 random bytes, base64.
pub(crate) fn generate_key() -> String {
    STANDARD.encode(rand::random::<[u8; 16]>())
}

/// Computes the `Sec-WebSocket-Accept` value a server must answer `key` with.
///
/// ```
/// assert_eq!(
///     echo_link::transport::accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
///     "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=",
/// );
/// ```
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(ACCEPT_GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

/// Builds the upgrade request.
pub(crate) fn build_request(host: &str, port: u16, path: &str, key: &str) -> String {
    format!(
        "GET {path} HTTP/1.1\r\n\
         Host: {host}:{port}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {key}\r\n\
         Sec-WebSocket-Version: 13\r\n\
         \r\n"
    )
}

fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(HEADER_TERMINATOR.len())
        .position(|w| w == HEADER_TERMINATOR)
}

/// Checks the status line for `101` and the accept header against `key`.
fn check_response(header: &[u8], key: &str) -> Result<(), TransportError> {
    let text = String::from_utf8_lossy(header);
    let mut lines = text.lines();
    let status_line = lines.next().unwrap_or_default().trim().to_string();
    let code = status_line.split_whitespace().nth(1);
    if !status_line.starts_with("HTTP/1.1") || code != Some("101") {
        return Err(TransportError::HandshakeRejected { status_line });
    }

    let accept = lines
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("sec-websocket-accept"))
        .map(|(_, value)| value.trim());
    if accept == Some(accept_key(key).as_str()) {
        Ok(())
    } else {
        Err(TransportError::AcceptMismatch)
    }
}

/// Writes the request and reads up to the end of the response header block.
async fn exchange<S>(
    stream: &mut S,
    request: &str,
    key: &str,
) -> Result<BytesMut, TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    let mut buf = BytesMut::with_capacity(1024);
    loop {
        if let Some(pos) = find_terminator(&buf) {
            let header = buf.split_to(pos + HEADER_TERMINATOR.len());
            check_response(&header, key)?;
            return Ok(buf);
        }
        if buf.len() > MAX_RESPONSE_HEADER {
            return Err(TransportError::HandshakeRejected {
                status_line: "response header too large".to_string(),
            });
        }
        if stream.read_buf(&mut buf).await? == 0 {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed during handshake",
            )));
        }
    }
}

/// Sends the upgrade request and waits for `101 Switching Protocols` with a
/// matching accept key.
///
/// Returns any bytes the server sent after the header block; they belong to
/// the first frames and must be fed to the decoder.
pub(crate) async fn perform<S>(
    stream: &mut S,
    host: &str,
    port: u16,
    path: &str,
    timeout: Duration,
) -> Result<BytesMut, TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let key = generate_key();
    let request = build_request(host, port, path, &key);

    match tokio::time::timeout(timeout, exchange(stream, &request, &key)).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::HandshakeTimeout(timeout)),
    }
}

/// Answers an upgrade request the way a conforming server does.
#[cfg(test)]
pub(crate) fn switching_response(request: &[u8]) -> Vec<u8> {
    let text = String::from_utf8_lossy(request);
    let key = text
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.eq_ignore_ascii_case("sec-websocket-key"))
        .map(|(_, value)| value.trim().to_string())
        .unwrap_or_default();
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\r\n",
        accept_key(&key)
    )
    .into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    const SAMPLE_KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";

    #[test]
    fn test_key_is_16_bytes_base64() {
        let key = generate_key();
        assert_eq!(STANDARD.decode(&key).unwrap().len(), 16);
        assert_ne!(key, generate_key());
    }

    #[test]
    fn test_request_shape() {
        let request = build_request("example.com", 1234, "/", "abc==");
        assert!(request.starts_with("GET / HTTP/1.1\r\n"));
        assert!(request.contains("Host: example.com:1234\r\n"));
        assert!(request.contains("Upgrade: websocket\r\n"));
        assert!(request.contains("Connection: Upgrade\r\n"));
        assert!(request.contains("Sec-WebSocket-Key: abc==\r\n"));
        assert!(request.contains("Sec-WebSocket-Version: 13\r\n"));
        assert!(request.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_accept_key_sample() {
        assert_eq!(accept_key(SAMPLE_KEY), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn test_check_response_status() {
        let ok = b"HTTP/1.1 101 Switching Protocols\r\n\
            sec-websocket-accept:  s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n\r\n";
        assert!(check_response(ok, SAMPLE_KEY).is_ok());

        let err = check_response(b"HTTP/1.1 403 Forbidden\r\n\r\n", SAMPLE_KEY).unwrap_err();
        assert!(matches!(
            err,
            TransportError::HandshakeRejected { status_line } if status_line == "HTTP/1.1 403 Forbidden"
        ));
    }

    #[test]
    fn test_check_response_accept_key() {
        let missing = b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\n\r\n";
        assert!(matches!(
            check_response(missing, SAMPLE_KEY),
            Err(TransportError::AcceptMismatch)
        ));

        let wrong = b"HTTP/1.1 101 Switching Protocols\r\n\
            Sec-WebSocket-Accept: AAAAAAAAAAAAAAAAAAAAAAAAAAA=\r\n\r\n";
        assert!(matches!(
            check_response(wrong, SAMPLE_KEY),
            Err(TransportError::AcceptMismatch)
        ));
    }

    #[tokio::test]
    async fn test_perform_keeps_leftover_bytes() {
        let (mut client, mut server) = duplex(4096);

        let server_task = tokio::spawn(async move {
            let mut buf = vec![0u8; 1024];
            let n = server.read(&mut buf).await.unwrap();
            let request = String::from_utf8_lossy(&buf[..n]).to_string();
            let mut response = switching_response(&buf[..n]);
            response.extend_from_slice(&[0x81, 0x02, b'h', b'i']);
            server.write_all(&response).await.unwrap();
            (request, server)
        });

        let leftover = perform(&mut client, "host", 1234, "/", Duration::from_secs(5))
            .await
            .unwrap();
        let (request, _server) = server_task.await.unwrap();

        assert!(request.contains("Host: host:1234"));
        assert_eq!(&leftover[..], &[0x81, 0x02, b'h', b'i']);
    }

    #[tokio::test]
    async fn test_perform_rejected() {
        let (mut client, mut server) = duplex(4096);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1024];
            let _ = server.read(&mut buf).await;
            let _ = server
                .write_all(b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\n\r\n")
                .await;
            // Hold the stream open until the client is done
            let _ = server.read(&mut buf).await;
        });

        let err = perform(&mut client, "host", 1, "/", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::HandshakeRejected { .. }));
    }

    #[tokio::test]
    async fn test_perform_rejects_stale_accept() {
        let (mut client, mut server) = duplex(4096);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1024];
            let _ = server.read(&mut buf).await;
            // Answers for a key the client never sent
            let _ = server
                .write_all(&switching_response(b"Sec-WebSocket-Key: AAAAAAAAAAAAAAAAAAAAAA==\r\n"))
                .await;
            let _ = server.read(&mut buf).await;
        });

        let err = perform(&mut client, "host", 1, "/", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::AcceptMismatch));
    }

    #[tokio::test(start_paused = true)]
    async fn test_perform_times_out() {
        let (mut client, _server) = duplex(4096);
        let err = perform(&mut client, "host", 1, "/", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::HandshakeTimeout(d) if d == Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn test_perform_eof() {
        let (mut client, server) = duplex(4096);
        drop(server);
        let err = perform(&mut client, "host", 1, "/", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Io(_)));
    }
}
