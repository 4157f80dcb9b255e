//! The client half: a fresh TCP connection per outbound message.

use super::{Comm, TransportError};
use crate::proto::{EnvelopeCodec, Message};
use futures_util::{SinkExt, StreamExt};
use std::net::IpAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

impl Comm {
    /// Sends `msg` to the control port of `dst` and waits for exactly one
    /// response record within `timeout`. Errors and timeouts leave the retry
    /// decision to the caller.
    pub(crate) async fn request(&self, dst: IpAddr, msg: Message, timeout: Duration) -> Result<Message, TransportError> {
        let exchange = async {
            let stream = TcpStream::connect((dst, self.control_port))
                .await
                .map_err(|source| TransportError::Io { peer: dst, source })?;
            let mut framed = Framed::new(stream, EnvelopeCodec::new());
            framed.send(msg).await?;
            match framed.next().await {
                Some(Ok(response)) => Ok(response),
                Some(Err(err)) => Err(err.into()),
                None => Err(TransportError::NoResponse { peer: dst }),
            }
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout { peer: dst }),
        }
    }

    /// Fire-and-forget: write the envelope and close.
    pub(crate) async fn notify(&self, dst: IpAddr, msg: Message) -> Result<(), TransportError> {
        let send = async {
            let stream = TcpStream::connect((dst, self.control_port))
                .await
                .map_err(|source| TransportError::Io { peer: dst, source })?;
            let mut framed = Framed::new(stream, EnvelopeCodec::new());
            framed.send(msg).await?;
            Ok(())
        };

        match tokio::time::timeout(crate::options::REQUEST_TIMEOUT, send).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout { peer: dst }),
        }
    }
}
