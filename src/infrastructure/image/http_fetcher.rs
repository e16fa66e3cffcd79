//! HTTP implementation of the image fetch port.

use std::time::Duration;

use bytes::Bytes;
use tracing::debug;

use crate::domain::errors::{LoadError, LoadResult};
use crate::domain::ports::{ImageBody, ImageFetchPort};

/// Maximum number of redirects followed per request.
const MAX_REDIRECTS: usize = 10;

/// Fetches images over HTTP(S) with reqwest.
#[derive(Debug, Clone)]
pub struct HttpImageFetcher {
    client: reqwest::Client,
}

impl HttpImageFetcher {
    /// Creates a fetcher whose connections must be established within `connect_timeout`.
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be created.
    pub fn new(connect_timeout: Duration) -> LoadResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .user_agent(concat!("lazytile/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| LoadError::network(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

fn map_reqwest_error(err: &reqwest::Error) -> LoadError {
    if err.is_timeout() {
        LoadError::NetworkTimeout
    } else {
        LoadError::network(err.to_string())
    }
}

/// Response body whose reads each fail once `read_timeout` passes without data.
struct ResponseBody {
    response: reqwest::Response,
    read_timeout: Duration,
}

#[async_trait::async_trait]
impl ImageBody for ResponseBody {
    async fn next_chunk(&mut self) -> LoadResult<Option<Bytes>> {
        tokio::time::timeout(self.read_timeout, self.response.chunk())
            .await
            .map_err(|_| LoadError::NetworkTimeout)?
            .map_err(|e| map_reqwest_error(&e))
    }
}

#[async_trait::async_trait]
impl ImageFetchPort for HttpImageFetcher {
    async fn fetch(&self, url: &str, timeout: Duration) -> LoadResult<Box<dyn ImageBody>> {
        debug!(url, "Downloading image from network");

        // The deadline covers the wait for headers; each body read gets its own.
        let response = tokio::time::timeout(timeout, self.client.get(url).send())
            .await
            .map_err(|_| LoadError::NetworkTimeout)?
            .map_err(|e| map_reqwest_error(&e))?;

        if !response.status().is_success() {
            return Err(LoadError::network(format!(
                "HTTP {}: {}",
                response.status().as_u16(),
                response.status().canonical_reason().unwrap_or("Unknown")
            )));
        }

        Ok(Box::new(ResponseBody {
            response,
            read_timeout: timeout,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::read_to_end;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    enum Reply {
        Full(String),
        /// Sends the head, then the body one byte at a time with `gap` between bytes.
        Trickle {
            head: String,
            body: &'static [u8],
            gap: Duration,
        },
        Hang,
    }

    /// Minimal HTTP/1.1 server answering each request from `route(path)`.
    async fn serve(route: fn(&str) -> Reply) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 4096];
                    let mut read = 0;
                    while !buf[..read].windows(4).any(|w| w == b"\r\n\r\n") {
                        match socket.read(&mut buf[read..]).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => read += n,
                        }
                    }
                    let request = String::from_utf8_lossy(&buf[..read]).to_string();
                    let path = request.split_whitespace().nth(1).unwrap_or("/").to_string();
                    match route(&path) {
                        Reply::Full(response) => {
                            let _ = socket.write_all(response.as_bytes()).await;
                            let _ = socket.shutdown().await;
                        }
                        Reply::Trickle { head, body, gap } => {
                            let _ = socket.set_nodelay(true);
                            if socket.write_all(head.as_bytes()).await.is_err() {
                                return;
                            }
                            for byte in body {
                                if socket.write_all(std::slice::from_ref(byte)).await.is_err() {
                                    return;
                                }
                                tokio::time::sleep(gap).await;
                            }
                            let _ = socket.shutdown().await;
                        }
                        Reply::Hang => {
                            tokio::time::sleep(Duration::from_secs(30)).await;
                        }
                    }
                });
            }
        });
        format!("http://{addr}")
    }

    const TRICKLE_HEAD: &str = "HTTP/1.1 200 OK\r\nContent-Length: 10\r\nConnection: close\r\n\r\n";

    fn routes(path: &str) -> Reply {
        match path {
            "/a.jpg" => Reply::Full(
                "HTTP/1.1 200 OK\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello".into(),
            ),
            "/moved.jpg" => Reply::Full(
                "HTTP/1.1 302 Found\r\nLocation: /a.jpg\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                    .into(),
            ),
            "/slow.jpg" => Reply::Hang,
            "/trickle.jpg" => Reply::Trickle {
                head: TRICKLE_HEAD.into(),
                body: b"0123456789",
                gap: Duration::from_millis(100),
            },
            "/stuck.jpg" => Reply::Trickle {
                head: TRICKLE_HEAD.into(),
                body: b"0123456789",
                gap: Duration::from_secs(30),
            },
            _ => Reply::Full(
                "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".into(),
            ),
        }
    }

    fn fetcher() -> HttpImageFetcher {
        HttpImageFetcher::new(Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_fetch_body() {
        let base = serve(routes).await;
        let mut body = fetcher()
            .fetch(&format!("{base}/a.jpg"), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(read_to_end(body.as_mut()).await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_follows_redirects() {
        let base = serve(routes).await;
        let mut body = fetcher()
            .fetch(&format!("{base}/moved.jpg"), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(read_to_end(body.as_mut()).await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_http_error_status() {
        let base = serve(routes).await;
        let err = fetcher()
            .fetch(&format!("{base}/missing.jpg"), Duration::from_secs(5))
            .await
            .err()
            .unwrap();
        assert_eq!(err, LoadError::network("HTTP 404: Not Found"));
    }

    #[tokio::test]
    async fn test_timeout() {
        let base = serve(routes).await;
        let err = fetcher()
            .fetch(&format!("{base}/slow.jpg"), Duration::from_millis(200))
            .await
            .err()
            .unwrap();
        assert_eq!(err, LoadError::NetworkTimeout);
    }

    #[tokio::test]
    async fn test_steady_slow_body_outlasts_timeout() {
        let base = serve(routes).await;
        let mut body = fetcher()
            .fetch(&format!("{base}/trickle.jpg"), Duration::from_millis(400))
            .await
            .unwrap();
        assert_eq!(read_to_end(body.as_mut()).await.unwrap(), b"0123456789");
    }

    #[tokio::test]
    async fn test_body_stall_times_out() {
        let base = serve(routes).await;
        let mut body = fetcher()
            .fetch(&format!("{base}/stuck.jpg"), Duration::from_millis(300))
            .await
            .unwrap();
        let err = read_to_end(body.as_mut()).await.err().unwrap();
        assert_eq!(err, LoadError::NetworkTimeout);
    }

    #[tokio::test]
    async fn test_connection_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = fetcher()
            .fetch(&format!("http://{addr}/a.jpg"), Duration::from_secs(5))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, LoadError::Network { .. }));
    }
}
