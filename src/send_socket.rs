use anyhow::bail;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::trace;

/// This is an abstraction for sending a datagram to the device, introduced to
///  facilitate mocking the I/O part away for testing
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SendSocket: Send + Sync + 'static {
    async fn send_datagram(&self, buf: &[u8]) -> anyhow::Result<()>;
}

/// the socket is connected to the device's address
#[async_trait]
impl SendSocket for Arc<UdpSocket> {
    async fn send_datagram(&self, buf: &[u8]) -> anyhow::Result<()> {
        trace!("UDP socket: sending {} bytes", buf.len());

        let sent = self.send(buf).await?;
        if sent != buf.len() {
            bail!("short send: {} of {} bytes", sent, buf.len());
        }
        Ok(())
    }
}
