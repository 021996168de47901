use crate::ipc::{
    compute_proof, random_hex, read_envelope, write_envelope, AuthOk, ClientAuth, ClientHello,
    IpcEnvelope, IpcRequest, IpcResponse, RequestEnvelope, ServerChallenge, CONSUMER_CLIENT_ID,
    CONTROL_CLIENT_ID, IPC_PROTOCOL_VERSION,
};
use crate::lbvs::{LbvsReader, HEADER_SIZE};
use anyhow::{anyhow, bail, Result};
use std::path::Path;
use tokio::io::{AsyncBufRead, AsyncReadExt, AsyncWrite, BufReader, ReadHalf, WriteHalf};
use tokio::net::UnixStream;

async fn authenticate<R, W>(reader: &mut R, writer: &mut W, secret: &[u8], client_id: &str) -> Result<String>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    write_envelope(
        writer,
        &IpcEnvelope::ClientHello(ClientHello {
            protocol_version: IPC_PROTOCOL_VERSION,
            client_id: client_id.to_string(),
        }),
    )
    .await?;

    let ServerChallenge {
        session_id,
        server_nonce,
    } = match read_envelope(reader).await? {
        Some(IpcEnvelope::ServerChallenge(c)) => c,
        Some(IpcEnvelope::Error { message }) => return Err(anyhow!(message)),
        _ => bail!("expected ServerChallenge"),
    };

    let client_nonce = random_hex(16);
    let proof = compute_proof(secret, &server_nonce, &client_nonce)?;
    write_envelope(
        writer,
        &IpcEnvelope::ClientAuth(ClientAuth {
            session_id,
            client_nonce,
            proof,
        }),
    )
    .await?;

    match read_envelope(reader).await? {
        Some(IpcEnvelope::AuthOk(AuthOk { session_id })) => Ok(session_id),
        Some(IpcEnvelope::Error { message }) => Err(anyhow!(message)),
        _ => bail!("expected AuthOk"),
    }
}

/// An authenticated control session. Each request carries the next nonce.
pub struct ControlSession {
    reader: BufReader<ReadHalf<UnixStream>>,
    writer: WriteHalf<UnixStream>,
    session_id: String,
    nonce: u64,
}

impl ControlSession {
    pub async fn connect(socket_path: &Path, secret: &[u8]) -> Result<Self> {
        let stream = UnixStream::connect(socket_path).await?;
        let (read_half, mut writer) = tokio::io::split(stream);
        let mut reader = BufReader::new(read_half);
        let session_id = authenticate(&mut reader, &mut writer, secret, CONTROL_CLIENT_ID).await?;
        Ok(Self {
            reader,
            writer,
            session_id,
            nonce: 0,
        })
    }

    pub async fn request(&mut self, request: IpcRequest) -> Result<IpcResponse> {
        self.nonce += 1;
        write_envelope(
            &mut self.writer,
            &IpcEnvelope::Request(RequestEnvelope {
                session_id: self.session_id.clone(),
                nonce: self.nonce,
                request,
            }),
        )
        .await?;
        match read_envelope(&mut self.reader).await? {
            Some(IpcEnvelope::Response(envelope)) => Ok(envelope.response),
            Some(IpcEnvelope::Error { message }) => Err(anyhow!(message)),
            Some(_) => bail!("unexpected response"),
            None => bail!("connection closed"),
        }
    }
}

pub async fn send_request(socket_path: &Path, secret: &[u8], request: IpcRequest) -> Result<IpcResponse> {
    ControlSession::connect(socket_path, secret)
        .await?
        .request(request)
        .await
}

/// Authenticated consumer end of the event socket.
pub struct EventStream {
    reader: BufReader<ReadHalf<UnixStream>>,
    _writer: WriteHalf<UnixStream>,
}

impl EventStream {
    pub async fn connect(socket_path: &Path, secret: &[u8]) -> Result<Self> {
        let stream = UnixStream::connect(socket_path).await?;
        let (read_half, mut writer) = tokio::io::split(stream);
        let mut reader = BufReader::new(read_half);
        authenticate(&mut reader, &mut writer, secret, CONSUMER_CLIENT_ID).await?;
        Ok(Self {
            reader,
            _writer: writer,
        })
    }

    /// Next raw event record; `None` once the service closes the stream.
    pub async fn next_record(&mut self) -> Result<Option<Vec<u8>>> {
        let mut header = [0u8; HEADER_SIZE];
        match self.reader.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let size = LbvsReader::peek_size(&header)?;
        if size < HEADER_SIZE {
            bail!("record declares {size} bytes, shorter than its header");
        }
        let mut record = vec![0u8; size];
        record[..HEADER_SIZE].copy_from_slice(&header);
        self.reader.read_exact(&mut record[HEADER_SIZE..]).await?;
        Ok(Some(record))
    }
}
