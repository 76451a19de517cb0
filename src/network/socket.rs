//! TCP connect probing

use futures::stream::{self, StreamExt};
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Connect-only port tester; no banner grab, no handshake beyond TCP
#[derive(Debug, Clone)]
pub struct ConnectProber {
    timeout: Duration,
    parallelism: usize,
}

impl ConnectProber {
    pub fn new(timeout: Duration, parallelism: usize) -> Self {
        Self {
            timeout,
            parallelism: parallelism.max(1),
        }
    }

    /// True when a TCP connection to `target:port` completes in time
    pub async fn is_open(&self, target: Ipv4Addr, port: u16) -> bool {
        let addr = SocketAddr::from((target, port));
        match timeout(self.timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                drop(stream);
                true
            }
            Ok(Err(e)) => {
                log::trace!("{}:{} closed: {}", target, port, e);
                false
            }
            Err(_) => false,
        }
    }

    /// Open ports among `ports`, sorted ascending
    pub async fn open_ports(&self, target: Ipv4Addr, ports: &[u16]) -> Vec<u16> {
        let mut open: Vec<u16> = stream::iter(ports.iter().copied())
            .map(|port| async move { self.is_open(target, port).await.then_some(port) })
            .buffer_unordered(self.parallelism)
            .filter_map(|port| async move { port })
            .collect()
            .await;
        open.sort_unstable();
        open
    }

    /// First port among `ports` that accepts a connection
    pub async fn first_open(&self, target: Ipv4Addr, ports: &[u16]) -> Option<u16> {
        let mut attempts = stream::iter(ports.iter().copied())
            .map(|port| async move { self.is_open(target, port).await.then_some(port) })
            .buffer_unordered(self.parallelism);
        while let Some(result) = attempts.next().await {
            if result.is_some() {
                return result;
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_open_and_closed_ports() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open_port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((_stream, _)) = listener.accept().await {}
        });

        // Bind then drop to find a port that is very likely closed
        let closed_port = {
            let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
            probe.local_addr().unwrap().port()
        };

        let prober = ConnectProber::new(Duration::from_millis(500), 4);
        let open = prober
            .open_ports(Ipv4Addr::LOCALHOST, &[closed_port, open_port])
            .await;
        assert_eq!(open, vec![open_port]);
        assert_eq!(
            prober
                .first_open(Ipv4Addr::LOCALHOST, &[closed_port, open_port])
                .await,
            Some(open_port)
        );
    }
}
