//! Control RPC protocol
//!
//! Strict request/response lock-step over the control stream: one request
//! in flight, each request kind has exactly one response kind (request kind
//! with the high bit set), no pipelining. Frames are a 16-bit big-endian
//! length followed by the body; the first body byte is the kind.
//!
//! A response whose kind does not match the outstanding request, or a body
//! that does not decode, is a protocol desync and fatal to the connection.

use super::ControlError;
use crate::session::{FlowTuple, Proto};
use crate::stack::ControlStream;
use async_trait::async_trait;
use bytes::BufMut;
use std::net::{IpAddr, SocketAddr};
use tracing::{debug, trace, warn};

const KIND_INIT_CONFIG: u8 = 0x01;
const KIND_ADD_SESSION: u8 = 0x02;
const KIND_DEL_SESSION: u8 = 0x03;
const KIND_PING: u8 = 0x04;
const KIND_PACK_LOSS: u8 = 0x05;
const RESPONSE_BIT: u8 = 0x80;

/// Largest accepted frame body. Control messages are tiny; anything larger
/// means the stream is desynced.
const MAX_FRAME: usize = 1024;

/// Requests the client sends to the server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Request {
    /// Push tunnel parameters the server must adopt.
    InitConfig { mtu: u16, keepalive_secs: u16 },
    /// Open a session for this flow; the server assigns the ID.
    AddSession(FlowTuple),
    DelSession(u16),
    Ping(u32),
    /// Ask for the server's observed inbound loss ratio.
    PackLoss,
}

/// Result of an AddSession request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddOutcome {
    Granted(u16),
    /// The 16-bit session space is full.
    Exhausted,
    /// Policy refused the flow.
    Denied,
}

/// Responses, one per request kind.
#[derive(Clone, Debug, PartialEq)]
pub enum Response {
    InitConfigOk,
    AddSessionOk(AddOutcome),
    DelSessionOk,
    Pong(u32),
    PackLossVal(f32),
}

impl Request {
    fn kind(&self) -> u8 {
        match self {
            Request::InitConfig { .. } => KIND_INIT_CONFIG,
            Request::AddSession(_) => KIND_ADD_SESSION,
            Request::DelSession(_) => KIND_DEL_SESSION,
            Request::Ping(_) => KIND_PING,
            Request::PackLoss => KIND_PACK_LOSS,
        }
    }

    fn encode(&self, out: &mut Vec<u8>) -> Result<(), ControlError> {
        out.push(self.kind());
        match self {
            Request::InitConfig {
                mtu,
                keepalive_secs,
            } => {
                out.put_u16(*mtu);
                out.put_u16(*keepalive_secs);
            }
            Request::AddSession(tuple) => encode_tuple(tuple, out)?,
            Request::DelSession(id) => out.put_u16(*id),
            Request::Ping(token) => out.put_u32(*token),
            Request::PackLoss => {}
        }
        Ok(())
    }

    fn decode(body: &[u8]) -> Result<Self, ControlError> {
        let (&kind, rest) = body.split_first().ok_or(ControlError::Truncated)?;
        match kind {
            KIND_INIT_CONFIG => {
                let f = fixed::<4>(rest)?;
                Ok(Request::InitConfig {
                    mtu: u16::from_be_bytes([f[0], f[1]]),
                    keepalive_secs: u16::from_be_bytes([f[2], f[3]]),
                })
            }
            KIND_ADD_SESSION => Ok(Request::AddSession(decode_tuple(rest)?)),
            KIND_DEL_SESSION => {
                let f = fixed::<2>(rest)?;
                Ok(Request::DelSession(u16::from_be_bytes(f)))
            }
            KIND_PING => {
                let f = fixed::<4>(rest)?;
                Ok(Request::Ping(u32::from_be_bytes(f)))
            }
            KIND_PACK_LOSS => Ok(Request::PackLoss),
            other => Err(ControlError::UnknownKind(other)),
        }
    }
}

impl Response {
    fn kind(&self) -> u8 {
        RESPONSE_BIT
            | match self {
                Response::InitConfigOk => KIND_INIT_CONFIG,
                Response::AddSessionOk(_) => KIND_ADD_SESSION,
                Response::DelSessionOk => KIND_DEL_SESSION,
                Response::Pong(_) => KIND_PING,
                Response::PackLossVal(_) => KIND_PACK_LOSS,
            }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.kind());
        match self {
            Response::InitConfigOk | Response::DelSessionOk => {}
            Response::AddSessionOk(outcome) => match outcome {
                AddOutcome::Granted(id) => {
                    out.put_u8(0);
                    out.put_u16(*id);
                }
                AddOutcome::Exhausted => out.put_u8(1),
                AddOutcome::Denied => out.put_u8(2),
            },
            Response::Pong(token) => out.put_u32(*token),
            Response::PackLossVal(loss) => out.put_f32(*loss),
        }
    }

    fn decode(body: &[u8]) -> Result<Self, ControlError> {
        let (&kind, rest) = body.split_first().ok_or(ControlError::Truncated)?;
        match kind {
            k if k == RESPONSE_BIT | KIND_INIT_CONFIG => Ok(Response::InitConfigOk),
            k if k == RESPONSE_BIT | KIND_ADD_SESSION => {
                let (&status, rest) = rest.split_first().ok_or(ControlError::Truncated)?;
                match status {
                    0 => {
                        let f = fixed::<2>(rest)?;
                        Ok(Response::AddSessionOk(AddOutcome::Granted(
                            u16::from_be_bytes(f),
                        )))
                    }
                    1 => Ok(Response::AddSessionOk(AddOutcome::Exhausted)),
                    2 => Ok(Response::AddSessionOk(AddOutcome::Denied)),
                    other => Err(ControlError::Desync(format!(
                        "bad add-session status {other}"
                    ))),
                }
            }
            k if k == RESPONSE_BIT | KIND_DEL_SESSION => Ok(Response::DelSessionOk),
            k if k == RESPONSE_BIT | KIND_PING => {
                let f = fixed::<4>(rest)?;
                Ok(Response::Pong(u32::from_be_bytes(f)))
            }
            k if k == RESPONSE_BIT | KIND_PACK_LOSS => {
                let f = fixed::<4>(rest)?;
                Ok(Response::PackLossVal(f32::from_bits(u32::from_be_bytes(f))))
            }
            other => Err(ControlError::UnknownKind(other)),
        }
    }
}

fn fixed<const N: usize>(bytes: &[u8]) -> Result<[u8; N], ControlError> {
    bytes.try_into().map_err(|_| ControlError::Truncated)
}

fn encode_tuple(tuple: &FlowTuple, out: &mut Vec<u8>) -> Result<(), ControlError> {
    out.put_u8(tuple.proto.number());
    for addr in [&tuple.src, &tuple.dst] {
        match addr.ip() {
            IpAddr::V4(ip) => {
                out.put_slice(&ip.octets());
                out.put_u16(addr.port());
            }
            IpAddr::V6(_) => return Err(ControlError::UnsupportedAddr),
        }
    }
    Ok(())
}

fn decode_tuple(bytes: &[u8]) -> Result<FlowTuple, ControlError> {
    let f = fixed::<13>(bytes)?;
    let proto = Proto::try_from(f[0]).map_err(ControlError::UnknownKind)?;
    let addr = |b: &[u8]| -> SocketAddr {
        let ip = std::net::Ipv4Addr::new(b[0], b[1], b[2], b[3]);
        SocketAddr::new(IpAddr::V4(ip), u16::from_be_bytes([b[4], b[5]]))
    };
    Ok(FlowTuple {
        src: addr(&f[1..7]),
        proto,
        dst: addr(&f[7..13]),
    })
}

async fn write_frame(stream: &mut dyn ControlStream, body: &[u8]) -> Result<(), ControlError> {
    let mut frame = Vec::with_capacity(2 + body.len());
    frame.put_u16(body.len() as u16);
    frame.put_slice(body);
    stream.write_all(&frame).await?;
    Ok(())
}

async fn read_exact(stream: &mut dyn ControlStream, buf: &mut [u8]) -> Result<(), ControlError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = stream.read(&mut buf[filled..]).await?;
        if n == 0 {
            return Err(ControlError::Closed);
        }
        filled += n;
    }
    Ok(())
}

async fn read_frame(stream: &mut dyn ControlStream) -> Result<Vec<u8>, ControlError> {
    let mut len = [0u8; 2];
    read_exact(stream, &mut len).await?;
    let len = usize::from(u16::from_be_bytes(len));
    if len == 0 || len > MAX_FRAME {
        return Err(ControlError::Desync(format!("frame length {len}")));
    }
    let mut body = vec![0u8; len];
    read_exact(stream, &mut body).await?;
    Ok(body)
}

/// Client half of the RPC protocol. The internal lock enforces the
/// one-in-flight rule.
pub struct ControlClient {
    stream: tokio::sync::Mutex<Box<dyn ControlStream>>,
}

impl ControlClient {
    pub fn new(stream: Box<dyn ControlStream>) -> Self {
        Self {
            stream: tokio::sync::Mutex::new(stream),
        }
    }

    async fn call(&self, req: Request) -> Result<Response, ControlError> {
        let expect = req.kind() | RESPONSE_BIT;
        let mut body = Vec::with_capacity(16);
        req.encode(&mut body)?;

        let mut stream = self.stream.lock().await;
        write_frame(stream.as_mut(), &body).await?;
        let reply = read_frame(stream.as_mut()).await?;
        drop(stream);

        let resp = Response::decode(&reply)?;
        if resp.kind() != expect {
            return Err(ControlError::Desync(format!(
                "expected kind {expect:#04x}, got {:#04x}",
                resp.kind()
            )));
        }
        trace!(?req, ?resp, "control rpc");
        Ok(resp)
    }

    pub async fn init_config(&self, mtu: u16, keepalive_secs: u16) -> Result<(), ControlError> {
        self.call(Request::InitConfig {
            mtu,
            keepalive_secs,
        })
        .await
        .map(|_| ())
    }

    pub async fn add_session(&self, tuple: FlowTuple) -> Result<AddOutcome, ControlError> {
        match self.call(Request::AddSession(tuple)).await? {
            Response::AddSessionOk(outcome) => Ok(outcome),
            _ => unreachable!("kind checked in call"),
        }
    }

    pub async fn del_session(&self, id: u16) -> Result<(), ControlError> {
        self.call(Request::DelSession(id)).await.map(|_| ())
    }

    pub async fn ping(&self, token: u32) -> Result<(), ControlError> {
        match self.call(Request::Ping(token)).await? {
            Response::Pong(echoed) if echoed == token => Ok(()),
            Response::Pong(echoed) => Err(ControlError::Desync(format!(
                "pong token {echoed} != {token}"
            ))),
            _ => unreachable!("kind checked in call"),
        }
    }

    pub async fn pack_loss(&self) -> Result<f32, ControlError> {
        match self.call(Request::PackLoss).await? {
            Response::PackLossVal(loss) => Ok(loss),
            _ => unreachable!("kind checked in call"),
        }
    }

    /// Flush a FIN on the underlying stream.
    pub async fn shutdown(&self) -> Result<(), ControlError> {
        self.stream.lock().await.shutdown().await?;
        Ok(())
    }
}

/// What the server does with each request.
#[async_trait]
pub trait ControlHandler: Send + Sync {
    async fn init_config(&self, mtu: u16, keepalive_secs: u16);
    async fn add_session(&self, tuple: FlowTuple) -> AddOutcome;
    async fn del_session(&self, id: u16);
    async fn pack_loss(&self) -> f32;
}

/// Server half: answers requests until the stream ends, the handler's
/// owner cancels, or the protocol desyncs.
pub struct ControlServer;

impl ControlServer {
    pub async fn serve(
        mut stream: Box<dyn ControlStream>,
        handler: std::sync::Arc<dyn ControlHandler>,
        cancel: tokio_util::sync::CancellationToken,
    ) -> Result<(), ControlError> {
        loop {
            let body = tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = stream.shutdown().await;
                    return Ok(());
                }
                body = read_frame(stream.as_mut()) => match body {
                    Ok(body) => body,
                    Err(ControlError::Closed) => {
                        debug!("control stream ended");
                        return Ok(());
                    }
                    Err(e) => {
                        warn!(error = %e, "control stream failed");
                        return Err(e);
                    }
                },
            };

            let req = Request::decode(&body)?;
            let resp = match req {
                Request::InitConfig {
                    mtu,
                    keepalive_secs,
                } => {
                    handler.init_config(mtu, keepalive_secs).await;
                    Response::InitConfigOk
                }
                Request::AddSession(tuple) => {
                    Response::AddSessionOk(handler.add_session(tuple).await)
                }
                Request::DelSession(id) => {
                    handler.del_session(id).await;
                    Response::DelSessionOk
                }
                Request::Ping(token) => Response::Pong(token),
                Request::PackLoss => Response::PackLossVal(handler.pack_loss().await),
            };

            let mut body = Vec::with_capacity(16);
            resp.encode(&mut body);
            write_frame(stream.as_mut(), &body).await?;
        }
    }
}
