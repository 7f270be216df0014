//! TCP connect probe

use tokio::net::TcpStream;

use crate::actors::messages::CheckStatus;

/// A successful connect is a healthy target; the connection is dropped
/// immediately afterwards.
pub(super) async fn probe(addr: &str) -> (CheckStatus, Option<String>) {
    match TcpStream::connect(addr).await {
        Ok(stream) => {
            let diagnostic = stream
                .peer_addr()
                .ok()
                .map(|peer| format!("connected to {peer}"));
            (CheckStatus::Success, diagnostic)
        }
        Err(e) => (CheckStatus::Failure(e.to_string()), None),
    }
}
