//! Proxy connections to other brokers.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tracing::debug;

use crate::broker::{BrokerEvent, BrokerHandle};
use crate::protocol::{BlobMode, Msg};

/// Connects in the background and reports the outcome to the broker.
pub(crate) fn connect(
    handle: BrokerHandle,
    name: String,
    generation: u64,
    host: String,
    port: u16,
    timeout: Duration,
) {
    tokio::spawn(async move {
        debug!(driver = %name, %host, port, "Connecting to remote broker");
        let connect = TcpStream::connect((host.as_str(), port));
        let event = match tokio::time::timeout(timeout, connect).await {
            Ok(Ok(stream)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!(driver = %name, error = %e, "set_nodelay failed");
                }
                BrokerEvent::RemoteConnected {
                    name,
                    generation,
                    stream,
                }
            }
            Ok(Err(e)) => BrokerEvent::RemoteFailed {
                name,
                generation,
                reason: e.to_string(),
            },
            Err(_) => BrokerEvent::RemoteFailed {
                name,
                generation,
                reason: format!("connect timed out after {timeout:?}"),
            },
        };
        handle.post(event).await;
    });
}

/// Messages sent to a remote broker right after connecting: ask for the
/// selected device's definitions and accept its blobs.
pub(crate) fn greeting(device: Option<&str>) -> [Arc<Msg>; 2] {
    [
        Msg::get_properties(device, None),
        Msg::enable_blob(device, BlobMode::Also),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MsgKind;

    #[test]
    fn test_greeting() {
        let [get, enable] = greeting(Some("Telescope"));
        assert_eq!(get.kind(), MsgKind::GetProperties);
        assert_eq!(get.device(), Some("Telescope"));
        assert_eq!(get.root().attr("version"), Some("1.7"));
        assert_eq!(enable.kind(), MsgKind::EnableBlob);
        assert_eq!(enable.blob_mode(), Some(BlobMode::Also));
    }

    #[tokio::test]
    async fn test_connect_reports_failure() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let (handle, mut events) = BrokerHandle::channel();
        connect(
            handle,
            "Cam@127.0.0.1".into(),
            7,
            "127.0.0.1".into(),
            port,
            Duration::from_secs(5),
        );
        match events.recv().await.unwrap() {
            BrokerEvent::RemoteFailed { generation, .. } => assert_eq!(generation, 7),
            _ => panic!("expected a connect failure"),
        }
    }
}
