//! STOMP transport adapter
//!
//! STOMP 1.2 client frames over TCP: CONNECT/CONNECTED handshake, SEND with
//! a `receipt` header and RECEIPT confirmation, DISCONNECT with receipt.
//! Frames are `COMMAND CRLF headers CRLF CRLF body NUL`; header values of
//! every frame except CONNECT/CONNECTED are escaped per the 1.2 rules.
//!
//! Deadlines are owned by the callers, same as the MQTT adapter.

use std::fmt;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use super::{Connection, Transport, TransportError, TransportResult};

const EOL: &str = "\r\n";
const NUL: u8 = 0x00;

/// One STOMP frame: command, headers, optional body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StompFrame {
    pub command: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl StompFrame {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    pub fn get_header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// CONNECT and CONNECTED never escape header values; every other frame
    /// does.
    fn escapes_headers(&self) -> bool {
        self.command != "CONNECT" && self.command != "CONNECTED"
    }

    pub fn encode(&self) -> Vec<u8> {
        let escape = self.escapes_headers();

        let mut out = Vec::new();
        out.extend_from_slice(self.command.as_bytes());
        out.extend_from_slice(EOL.as_bytes());

        for (key, value) in &self.headers {
            out.extend_from_slice(key.as_bytes());
            out.push(b':');
            let value = if escape {
                escape_header(value)
            } else {
                value.clone()
            };
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(EOL.as_bytes());
        }

        out.extend_from_slice(EOL.as_bytes());
        out.extend_from_slice(&self.body);
        out.push(NUL);
        out
    }
}

impl fmt::Display for StompFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.command)?;
        for (key, value) in &self.headers {
            // never leak credentials into logs
            if key == "passcode" {
                write!(f, " {key}:*****")?;
            } else {
                write!(f, " {key}:{value}")?;
            }
        }
        Ok(())
    }
}

fn escape_header(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\r' => out.push_str("\\r"),
            '\n' => out.push_str("\\n"),
            ':' => out.push_str("\\c"),
            c => out.push(c),
        }
    }
    out
}

fn unescape_header(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some('c') => out.push(':'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

/// Adapter for a STOMP 1.2 broker
pub struct StompTransport {
    name: String,
    host: String,
    port: u16,
    login: Option<String>,
    passcode: Option<String>,
    virtual_host: Option<String>,
}

impl StompTransport {
    pub fn new(
        name: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        login: Option<String>,
        passcode: Option<String>,
        virtual_host: Option<String>,
    ) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            login,
            passcode,
            virtual_host,
        }
    }
}

#[async_trait]
impl Transport for StompTransport {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> TransportResult<Box<dyn Connection>> {
        let stream = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;
        stream.set_nodelay(true)?;

        let mut stream = BufStream::new(stream);

        let vhost = self.virtual_host.clone().unwrap_or_else(|| self.host.clone());
        let mut connect = StompFrame::new("CONNECT")
            .header("accept-version", "1.2")
            .header("host", vhost)
            .header("heart-beat", "0,0");
        if let Some(login) = &self.login {
            connect = connect.header("login", login.clone());
        }
        if let Some(passcode) = &self.passcode {
            connect = connect.header("passcode", passcode.clone());
        }

        trace!("sending {connect}");
        stream.write_all(&connect.encode()).await?;
        stream.flush().await?;

        let reply = read_frame(&mut stream).await?;
        match reply.command.as_str() {
            "CONNECTED" => {}
            "ERROR" => {
                let message = reply
                    .get_header("message")
                    .map(str::to_string)
                    .unwrap_or_else(|| String::from_utf8_lossy(&reply.body).into_owned());
                return Err(TransportError::Rejected(message));
            }
            other => {
                return Err(TransportError::Protocol(format!(
                    "expected CONNECTED, got {other}"
                )));
            }
        }

        debug!("connected to stomp broker {}:{}", self.host, self.port);

        Ok(Box::new(StompConnection {
            stream,
            next_receipt: 1,
        }))
    }
}

struct StompConnection {
    stream: BufStream<TcpStream>,
    next_receipt: u64,
}

impl StompConnection {
    fn take_receipt_id(&mut self) -> String {
        let id = self.next_receipt;
        self.next_receipt += 1;
        format!("titan-{id}")
    }

    async fn await_receipt(&mut self, receipt_id: &str) -> TransportResult<()> {
        let frame = read_frame(&mut self.stream).await?;
        match frame.command.as_str() {
            "RECEIPT" => match frame.get_header("receipt-id") {
                Some(id) if id == receipt_id => Ok(()),
                Some(id) => Err(TransportError::Protocol(format!(
                    "receipt for unexpected id '{id}' (expected '{receipt_id}')"
                ))),
                None => Err(TransportError::Protocol("RECEIPT without receipt-id".into())),
            },
            "ERROR" => {
                let message = frame
                    .get_header("message")
                    .map(str::to_string)
                    .unwrap_or_else(|| String::from_utf8_lossy(&frame.body).into_owned());
                Err(TransportError::Rejected(message))
            }
            other => Err(TransportError::Protocol(format!(
                "expected RECEIPT, got {other}"
            ))),
        }
    }
}

#[async_trait]
impl Connection for StompConnection {
    async fn publish(&mut self, destination: &str, payload: &[u8]) -> TransportResult<()> {
        let receipt_id = self.take_receipt_id();

        let frame = StompFrame::new("SEND")
            .header("destination", destination)
            .header("content-type", "application/json")
            .header("content-length", payload.len().to_string())
            .header("receipt", receipt_id.clone())
            .body(payload.to_vec());

        trace!("sending {frame}");
        self.stream.write_all(&frame.encode()).await?;
        self.stream.flush().await?;

        self.await_receipt(&receipt_id).await
    }

    async fn close(&mut self) -> TransportResult<()> {
        let receipt_id = self.take_receipt_id();
        let frame = StompFrame::new("DISCONNECT").header("receipt", receipt_id.clone());

        self.stream.write_all(&frame.encode()).await?;
        self.stream.flush().await?;

        // best effort: the broker may close the socket before the receipt
        let _ = self.await_receipt(&receipt_id).await;
        self.stream.get_mut().shutdown().await?;
        Ok(())
    }
}

async fn read_line(stream: &mut BufStream<TcpStream>) -> TransportResult<String> {
    let mut line = Vec::new();
    loop {
        let byte = stream.read_u8().await?;
        if byte == b'\n' {
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            return String::from_utf8(line)
                .map_err(|_| TransportError::Protocol("non-UTF-8 frame line".into()));
        }
        line.push(byte);
    }
}

async fn read_frame(stream: &mut BufStream<TcpStream>) -> TransportResult<StompFrame> {
    // skip heartbeat newlines between frames
    let command = loop {
        let line = read_line(stream).await?;
        if !line.is_empty() {
            break line;
        }
    };

    let mut frame = StompFrame::new(command);
    let escape = frame.escapes_headers();

    loop {
        let line = read_line(stream).await?;
        if line.is_empty() {
            break;
        }
        let Some((key, value)) = line.split_once(':') else {
            return Err(TransportError::Protocol(format!(
                "malformed header line '{line}'"
            )));
        };
        let value = if escape {
            unescape_header(value)
        } else {
            value.to_string()
        };
        frame.headers.push((key.to_string(), value));
    }

    let body = match frame.get_header("content-length") {
        Some(len) => {
            let len: usize = len
                .parse()
                .map_err(|_| TransportError::Protocol("bad content-length".into()))?;
            let mut body = vec![0u8; len];
            stream.read_exact(&mut body).await?;
            let terminator = stream.read_u8().await?;
            if terminator != NUL {
                return Err(TransportError::Protocol("missing NUL terminator".into()));
            }
            body
        }
        None => {
            let mut body = Vec::new();
            loop {
                let byte = stream.read_u8().await?;
                if byte == NUL {
                    break;
                }
                body.push(byte);
            }
            body
        }
    };

    frame.body = body;
    Ok(frame)
}
