//! Local control channel: newline-delimited JSON envelopes behind an
//! HMAC-SHA256 challenge/response handshake.

use crate::engine::EngineStatus;
use anyhow::{anyhow, bail, Result};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub const IPC_PROTOCOL_VERSION: u32 = 1;

/// Client id presented by control clients.
pub const CONTROL_CLIENT_ID: &str = "control";
/// Client id presented by the event consumer.
pub const CONSUMER_CLIENT_ID: &str = "consumer";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientHello {
    pub protocol_version: u32,
    pub client_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerChallenge {
    pub session_id: String,
    pub server_nonce: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientAuth {
    pub session_id: String,
    pub client_nonce: String,
    pub proof: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthOk {
    pub session_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum IpcEnvelope {
    ClientHello(ClientHello),
    ServerChallenge(ServerChallenge),
    ClientAuth(ClientAuth),
    AuthOk(AuthOk),
    Error { message: String },
    Request(RequestEnvelope),
    Response(ResponseEnvelope),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub session_id: String,
    pub nonce: u64,
    pub request: IpcRequest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub session_id: String,
    pub nonce: u64,
    pub response: IpcResponse,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "request", content = "data")]
pub enum IpcRequest {
    Ping,
    Status,
    /// One control command; `payload` is the base64 of its LBVS blob.
    Control { code: u32, payload: String },
}

impl IpcRequest {
    pub fn control(code: u32, payload: &[u8]) -> Self {
        Self::Control {
            code,
            payload: B64.encode(payload),
        }
    }
}

/// Decodes the LBVS blob carried by a `Control` request.
pub fn decode_payload(payload: &str) -> Result<Vec<u8>> {
    B64.decode(payload).map_err(|e| anyhow!("payload is not base64: {e}"))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "response", content = "data")]
pub enum IpcResponse {
    Pong,
    Status { status: EngineStatus },
    Done,
    Rejected { error: String },
}

/// Who is on the other end of an accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller {
    pub pid: u32,
}

/// Reads the peer pid from the socket credentials.
pub fn peer_pid(stream: &UnixStream) -> Result<u32> {
    let cred = stream.peer_cred()?;
    let pid = cred.pid().ok_or_else(|| anyhow!("peer pid unavailable"))?;
    u32::try_from(pid).map_err(|_| anyhow!("invalid peer pid {pid}"))
}

pub(crate) fn compute_proof(secret: &[u8], server_nonce: &str, client_nonce: &str) -> Result<String> {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret).map_err(|e| anyhow!("mac init: {e}"))?;
    mac.update(server_nonce.as_bytes());
    mac.update(client_nonce.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

pub(crate) fn random_hex(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub(crate) async fn write_envelope<W>(writer: &mut W, envelope: &IpcEnvelope) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer
        .write_all(serde_json::to_string(envelope)?.as_bytes())
        .await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one envelope; `None` at end of stream.
pub(crate) async fn read_envelope<R>(reader: &mut R) -> Result<Option<IpcEnvelope>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(line.trim_end())?))
}

#[derive(Debug, Clone)]
pub struct SessionState {
    pub last_nonce: u64,
}

pub struct IpcAuthContext {
    shared_secret: Vec<u8>,
    sessions: Mutex<HashMap<String, SessionState>>,
}

impl IpcAuthContext {
    pub fn new(shared_secret: Vec<u8>) -> Self {
        Self {
            shared_secret,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub async fn register_session(&self, session_id: String) {
        self.sessions
            .lock()
            .await
            .insert(session_id, SessionState { last_nonce: 0 });
    }

    pub async fn end_session(&self, session_id: &str) {
        self.sessions.lock().await.remove(session_id);
    }

    pub async fn verify_and_update_nonce(&self, session_id: &str, nonce: u64) -> Result<()> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| anyhow!("unknown session"))?;
        if nonce <= session.last_nonce {
            bail!("replay detected: nonce not increasing");
        }
        session.last_nonce = nonce;
        Ok(())
    }

    /// Server side of the handshake. Returns the new session id.
    pub async fn accept<R, W>(&self, reader: &mut R, writer: &mut W, client_id: &str) -> Result<String>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let hello = match read_envelope(reader).await? {
            Some(IpcEnvelope::ClientHello(h)) => h,
            Some(_) => bail!("expected ClientHello"),
            None => bail!("empty hello"),
        };
        if hello.protocol_version != IPC_PROTOCOL_VERSION {
            write_envelope(
                writer,
                &IpcEnvelope::Error {
                    message: "protocol version mismatch".to_string(),
                },
            )
            .await?;
            bail!("protocol version mismatch");
        }
        if hello.client_id != client_id {
            bail!("unauthorized client {}", hello.client_id);
        }

        let session_id = uuid::Uuid::new_v4().to_string();
        let server_nonce = random_hex(32);
        write_envelope(
            writer,
            &IpcEnvelope::ServerChallenge(ServerChallenge {
                session_id: session_id.clone(),
                server_nonce: server_nonce.clone(),
            }),
        )
        .await?;

        let auth = match read_envelope(reader).await? {
            Some(IpcEnvelope::ClientAuth(m)) => m,
            Some(_) => bail!("expected ClientAuth"),
            None => bail!("missing client auth"),
        };
        if auth.session_id != session_id {
            bail!("session id mismatch");
        }
        let expected = compute_proof(&self.shared_secret, &server_nonce, &auth.client_nonce)?;
        if expected != auth.proof {
            write_envelope(
                writer,
                &IpcEnvelope::Error {
                    message: "invalid proof".to_string(),
                },
            )
            .await?;
            bail!("invalid proof");
        }

        self.register_session(session_id.clone()).await;
        write_envelope(
            writer,
            &IpcEnvelope::AuthOk(AuthOk {
                session_id: session_id.clone(),
            }),
        )
        .await?;
        Ok(session_id)
    }
}

#[async_trait::async_trait]
pub trait IpcHandler {
    async fn handle(&self, caller: Caller, req: IpcRequest) -> Result<IpcResponse>;
}

pub struct IpcServer {
    auth: Arc<IpcAuthContext>,
    socket_path: PathBuf,
}

impl IpcServer {
    pub fn new(auth_secret: Vec<u8>, socket_path: PathBuf) -> Self {
        Self {
            auth: Arc::new(IpcAuthContext::new(auth_secret)),
            socket_path,
        }
    }

    /// Binds the socket, replacing a stale one.
    pub fn bind(&self) -> Result<UnixListener> {
        if self.socket_path.exists() {
            let _ = std::fs::remove_file(&self.socket_path);
        }
        Ok(UnixListener::bind(&self.socket_path)?)
    }

    pub async fn start(self: Arc<Self>, handler: Arc<dyn IpcHandler + Send + Sync>) -> Result<()> {
        let listener = self.bind()?;
        self.serve(listener, handler).await
    }

    pub async fn serve(
        self: Arc<Self>,
        listener: UnixListener,
        handler: Arc<dyn IpcHandler + Send + Sync>,
    ) -> Result<()> {
        loop {
            let (stream, _addr) = listener.accept().await?;
            let auth = self.auth.clone();
            let handler = handler.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, auth, handler).await {
                    warn!(error = %e, "control connection error");
                }
            });
        }
    }
}

async fn handle_connection(
    stream: UnixStream,
    auth: Arc<IpcAuthContext>,
    handler: Arc<dyn IpcHandler + Send + Sync>,
) -> Result<()> {
    let caller = Caller {
        pid: peer_pid(&stream)?,
    };
    let (read_half, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);
    let session_id = auth.accept(&mut reader, &mut writer, CONTROL_CLIENT_ID).await?;
    debug!(pid = caller.pid, session = %session_id, "control session opened");

    let result = serve_requests(&mut reader, &mut writer, &auth, &session_id, caller, handler).await;
    auth.end_session(&session_id).await;
    result
}

async fn serve_requests<R, W>(
    reader: &mut R,
    writer: &mut W,
    auth: &IpcAuthContext,
    session_id: &str,
    caller: Caller,
    handler: Arc<dyn IpcHandler + Send + Sync>,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    while let Some(env) = read_envelope(reader).await? {
        let req_env = match env {
            IpcEnvelope::Request(r) => r,
            _ => bail!("expected Request envelope"),
        };
        if req_env.session_id != session_id {
            bail!("session mismatch");
        }
        auth.verify_and_update_nonce(session_id, req_env.nonce).await?;
        let response = match req_env.request {
            IpcRequest::Ping => IpcResponse::Pong,
            other => handler.handle(caller, other).await?,
        };
        write_envelope(
            writer,
            &IpcEnvelope::Response(ResponseEnvelope {
                session_id: session_id.to_string(),
                nonce: req_env.nonce,
                response,
            }),
        )
        .await?;
    }
    Ok(())
}
