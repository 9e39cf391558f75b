use super::IdentifyQueue;
use crate::config::ConfigError;
use crate::error::Error;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

/// Identify arbitration delegated to an external queue service.
///
/// The service holds the request open until the shard may identify. A
/// client-side timeout just means "ask again"; any other outcome, including
/// an error status, counts as permission.
#[derive(Debug, Clone)]
pub struct RemoteQueue {
    client: reqwest::Client,
    url: Url,
}

impl RemoteQueue {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, Error> {
        let url = Url::parse(url)
            .map_err(|e| ConfigError::InvalidUrl(format!("identify queue: {}", e)))?;
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, url })
    }
}

impl IdentifyQueue for RemoteQueue {
    async fn await_turn(&self, shard_id: u32) {
        info!("[SHARD-{}] Waiting for identify turn from {}", shard_id, self.url);
        loop {
            let result = self
                .client
                .get(self.url.clone())
                .query(&[("shard", shard_id)])
                .send()
                .await;

            match result {
                Ok(response) => {
                    debug!(
                        "[SHARD-{}] Identify queue answered {}",
                        shard_id,
                        response.status()
                    );
                    return;
                }
                Err(e) if e.is_timeout() => {
                    debug!("[SHARD-{}] Identify queue timed out, asking again", shard_id);
                }
                Err(e) => {
                    warn!(
                        "[SHARD-{}] Identify queue request failed, proceeding: {}",
                        shard_id, e
                    );
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    async fn read_request(stream: &mut TcpStream) -> String {
        let mut buf = vec![0u8; 4096];
        let n = stream.read(&mut buf).await.unwrap();
        String::from_utf8_lossy(&buf[..n]).into_owned()
    }

    async fn respond_ok(stream: &mut TcpStream) {
        stream
            .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_granted_on_response() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let request = read_request(&mut stream).await;
            respond_ok(&mut stream).await;
            request
        });

        let queue = RemoteQueue::new(&format!("http://{}/identify", addr), Duration::from_secs(5)).unwrap();
        queue.await_turn(3).await;

        let request = server.await.unwrap();
        assert!(request.starts_with("GET /identify?shard=3 "));
    }

    #[tokio::test]
    async fn test_timeout_is_retried() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            // First request is left hanging past the client timeout
            let (mut stalled, _) = listener.accept().await.unwrap();
            read_request(&mut stalled).await;

            let (mut stream, _) = listener.accept().await.unwrap();
            read_request(&mut stream).await;
            respond_ok(&mut stream).await;
            drop(stalled);
        });

        let queue = RemoteQueue::new(&format!("http://{}/", addr), Duration::from_millis(200)).unwrap();
        queue.await_turn(0).await;
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_connection_error_counts_as_granted() {
        // Bind then drop to get a port nothing listens on
        let addr = TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap()
            .local_addr()
            .unwrap();

        let queue = RemoteQueue::new(&format!("http://{}/", addr), Duration::from_secs(5)).unwrap();
        queue.await_turn(0).await;
    }

    #[test]
    fn test_invalid_url() {
        assert!(matches!(
            RemoteQueue::new("not a url", Duration::from_secs(1)),
            Err(Error::Config(ConfigError::InvalidUrl(_)))
        ));
    }
}
