//! MQTT transport adapter
//!
//! A deliberately small MQTT 3.1.1 client: CONNECT with clean session,
//! QoS 1 PUBLISH with PUBACK confirmation, DISCONNECT. The agent never
//! subscribes, so the inbound side only has to understand CONNACK and
//! PUBACK.
//!
//! Deadlines are owned by the callers: the pool bounds `connect` via its
//! borrow timeout, the dispatcher bounds `publish` via its per-attempt
//! timeout.

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use super::{Connection, Transport, TransportError, TransportResult};

const PROTOCOL_NAME: &str = "MQTT";
const PROTOCOL_LEVEL: u8 = 4;

const PACKET_CONNECT: u8 = 0x10;
const PACKET_CONNACK: u8 = 0x20;
const PACKET_PUBLISH_QOS1: u8 = 0x32;
const PACKET_PUBACK: u8 = 0x40;
const PACKET_PINGRESP: u8 = 0xD0;
const PACKET_DISCONNECT: u8 = 0xE0;

/// Adapter for an MQTT 3.1.1 broker
pub struct MqttTransport {
    name: String,
    host: String,
    port: u16,
    client_id: String,
    username: Option<String>,
    password: Option<String>,
    keep_alive_secs: u16,
}

impl MqttTransport {
    pub fn new(
        name: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        client_id: impl Into<String>,
        username: Option<String>,
        password: Option<String>,
        keep_alive_secs: u16,
    ) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            client_id: client_id.into(),
            username,
            password,
            keep_alive_secs,
        }
    }
}

#[async_trait]
impl Transport for MqttTransport {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> TransportResult<Box<dyn Connection>> {
        let stream = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;
        stream.set_nodelay(true)?;

        let mut stream = BufStream::new(stream);

        let connect = encode_connect(
            &self.client_id,
            self.username.as_deref(),
            self.password.as_deref(),
            self.keep_alive_secs,
        );
        stream.write_all(&connect).await?;
        stream.flush().await?;

        let (packet_type, body) = read_packet(&mut stream).await?;
        if packet_type != PACKET_CONNACK {
            return Err(TransportError::Protocol(format!(
                "expected CONNACK, got packet type 0x{packet_type:02x}"
            )));
        }

        match body.get(1) {
            Some(0) => {}
            Some(code) => {
                return Err(TransportError::Rejected(format!(
                    "broker refused connection (CONNACK code {code})"
                )));
            }
            None => {
                return Err(TransportError::Protocol("truncated CONNACK".into()));
            }
        }

        debug!("connected to mqtt broker {}:{}", self.host, self.port);

        Ok(Box::new(MqttConnection {
            stream,
            next_packet_id: 1,
        }))
    }
}

struct MqttConnection {
    stream: BufStream<TcpStream>,
    next_packet_id: u16,
}

impl MqttConnection {
    fn take_packet_id(&mut self) -> u16 {
        let id = self.next_packet_id;
        // packet id 0 is not allowed by the protocol
        self.next_packet_id = self.next_packet_id.checked_add(1).unwrap_or(1);
        id
    }
}

#[async_trait]
impl Connection for MqttConnection {
    async fn publish(&mut self, destination: &str, payload: &[u8]) -> TransportResult<()> {
        let packet_id = self.take_packet_id();

        let publish = encode_publish(destination, packet_id, payload);
        self.stream.write_all(&publish).await?;
        self.stream.flush().await?;

        trace!("published {} bytes to '{destination}' (pid {packet_id})", payload.len());

        // QoS 1: the broker must confirm with a PUBACK carrying our packet id
        loop {
            let (packet_type, body) = read_packet(&mut self.stream).await?;
            match packet_type {
                PACKET_PUBACK => {
                    if body.len() < 2 {
                        return Err(TransportError::Protocol("truncated PUBACK".into()));
                    }
                    let acked = u16::from_be_bytes([body[0], body[1]]);
                    if acked != packet_id {
                        return Err(TransportError::Protocol(format!(
                            "PUBACK for unexpected packet id {acked} (sent {packet_id})"
                        )));
                    }
                    return Ok(());
                }
                PACKET_PINGRESP => continue,
                other => {
                    return Err(TransportError::Protocol(format!(
                        "unexpected packet type 0x{other:02x} while awaiting PUBACK"
                    )));
                }
            }
        }
    }

    async fn close(&mut self) -> TransportResult<()> {
        self.stream.write_all(&[PACKET_DISCONNECT, 0x00]).await?;
        self.stream.flush().await?;
        self.stream.get_mut().shutdown().await?;
        Ok(())
    }
}

fn encode_connect(
    client_id: &str,
    username: Option<&str>,
    password: Option<&str>,
    keep_alive_secs: u16,
) -> Vec<u8> {
    let mut body = Vec::new();
    encode_string(PROTOCOL_NAME, &mut body);
    body.push(PROTOCOL_LEVEL);

    // clean session, plus credential flags when configured
    let mut flags = 0x02;
    if username.is_some() {
        flags |= 0x80;
    }
    if password.is_some() {
        flags |= 0x40;
    }
    body.push(flags);

    body.extend_from_slice(&keep_alive_secs.to_be_bytes());

    encode_string(client_id, &mut body);
    if let Some(user) = username {
        encode_string(user, &mut body);
    }
    if let Some(pass) = password {
        encode_string(pass, &mut body);
    }

    frame(PACKET_CONNECT, &body)
}

fn encode_publish(topic: &str, packet_id: u16, payload: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    encode_string(topic, &mut body);
    body.extend_from_slice(&packet_id.to_be_bytes());
    body.extend_from_slice(payload);

    frame(PACKET_PUBLISH_QOS1, &body)
}

fn frame(packet_type: u8, body: &[u8]) -> Vec<u8> {
    let mut packet = vec![packet_type];
    encode_remaining_length(body.len(), &mut packet);
    packet.extend_from_slice(body);
    packet
}

fn encode_string(value: &str, out: &mut Vec<u8>) {
    out.extend_from_slice(&(value.len() as u16).to_be_bytes());
    out.extend_from_slice(value.as_bytes());
}

fn encode_remaining_length(mut len: usize, out: &mut Vec<u8>) {
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if len == 0 {
            break;
        }
    }
}

async fn read_packet(
    stream: &mut BufStream<TcpStream>,
) -> TransportResult<(u8, Vec<u8>)> {
    let packet_type = stream.read_u8().await?;

    // remaining length: up to four continuation bytes
    let mut len: usize = 0;
    let mut shift = 0;
    loop {
        let byte = stream.read_u8().await?;
        len += ((byte & 0x7F) as usize) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
        if shift > 21 {
            return Err(TransportError::Protocol("remaining length overflow".into()));
        }
    }

    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;

    Ok((packet_type, body))
}
