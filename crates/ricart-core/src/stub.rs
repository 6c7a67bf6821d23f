//! Client-side proxy for a remote object.
//!
//! A [`Stub`] turns a method invocation into a network round trip to a fixed
//! address: connect, write one request record, read one response record,
//! close. There is no pooling and no retry. A failure before the request is
//! fully written surfaces as [`OrbError::Communication`]; once it is out, a
//! missing or broken response surfaces as [`OrbError::ResponseLost`].

use crate::config::OrbConfig;
use crate::wire::{decode_response, encode_request, read_record, write_record, Request};
use crate::{OrbError, Result};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::io::ErrorKind;
use std::net::SocketAddr;
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tracing::debug;

/// Image of a remote object on the local machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stub {
    addr: SocketAddr,
}

impl Stub {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }

    /// Address of the remote object.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Invoke `method` on the remote object and return its result.
    ///
    /// The method name is forwarded verbatim; whether the remote owner
    /// exposes it is only known once the response arrives.
    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        let record = encode_request(&Request::new(method, args))?;

        let stream = tokio::time::timeout(OrbConfig::CONNECT_TIMEOUT, TcpStream::connect(self.addr))
            .await
            .map_err(|_| self.unreachable(ErrorKind::TimedOut, "connect timed out"))?
            .map_err(|e| OrbError::communication(self.addr, e))?;

        debug!("RPC {} -> {}", method, self.addr);

        let response = self.round_trip(stream, &record).await?;
        decode_response(&response)
    }

    /// Invoke `method` and deserialize its result.
    pub async fn call_as<T: DeserializeOwned>(&self, method: &str, args: Vec<Value>) -> Result<T> {
        let value = self.call(method, args).await?;
        serde_json::from_value(value).map_err(|e| {
            OrbError::protocol(format!("unexpected result type for '{}': {}", method, e))
        })
    }

    async fn round_trip(&self, mut stream: TcpStream, record: &str) -> Result<String> {
        let (reader, mut writer) = stream.split();
        let mut reader = BufReader::new(reader);

        // An interrupted write never delivers the trailing boundary, so the
        // remote cannot have decoded the request.
        tokio::time::timeout(OrbConfig::CALL_TIMEOUT, write_record(&mut writer, record))
            .await
            .map_err(|_| self.unreachable(ErrorKind::TimedOut, "send timed out"))?
            .map_err(|e| self.send_error(e))?;

        tokio::time::timeout(OrbConfig::CALL_TIMEOUT, read_record(&mut reader))
            .await
            .map_err(|_| self.lost(ErrorKind::TimedOut, "response timed out"))?
            .map_err(|e| self.receive_error(e))?
            .ok_or_else(|| self.lost(ErrorKind::UnexpectedEof, "connection closed without a response"))
    }

    fn send_error(&self, err: OrbError) -> OrbError {
        match err {
            OrbError::Io {
                source: Some(source),
                ..
            } => OrbError::communication(self.addr, source),
            other => other,
        }
    }

    fn receive_error(&self, err: OrbError) -> OrbError {
        match err {
            OrbError::Io {
                source: Some(source),
                ..
            } => OrbError::response_lost(self.addr, source),
            OrbError::Protocol { message } => self.lost(ErrorKind::InvalidData, &message),
            other => other,
        }
    }

    fn lost(&self, kind: ErrorKind, message: &str) -> OrbError {
        OrbError::response_lost(self.addr, std::io::Error::new(kind, message.to_string()))
    }

    fn unreachable(&self, kind: ErrorKind, message: &str) -> OrbError {
        OrbError::communication(self.addr, std::io::Error::new(kind, message.to_string()))
    }
}
