/// TCP connectability. Refused connections mean "not yet"; every other dial
/// error is fatal. No dial timeout is imposed here.
use super::ConditionError;
use crate::context::ExecutionContext;
use std::io::ErrorKind;
use tokio::net::TcpStream;

#[derive(Debug, Clone)]
pub struct SocketConnectCondition {
    address: String,
    connected: bool,
}

impl SocketConnectCondition {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            connected: false,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub async fn check(mut self, ctx: &ExecutionContext) -> Result<(Self, bool), ConditionError> {
        if self.connected {
            return Ok((self, true));
        }

        match TcpStream::connect(self.address.as_str()).await {
            Ok(stream) => {
                tracing::debug!(address = %self.address, peer = ?stream.peer_addr().ok(), "connected");
                drop(stream);
                self.connected = true;
                Ok((self, true))
            }
            Err(e) if e.kind() == ErrorKind::ConnectionRefused => {
                if ctx.verbose {
                    tracing::debug!(address = %self.address, "connection refused");
                }
                Ok((self, false))
            }
            Err(e) => Err(ConditionError::Connect {
                address: self.address,
                source: e,
            }),
        }
    }
}
