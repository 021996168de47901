//! Event channel: after the handshake the socket carries raw LBVS records
//! back to back, written by the delivery worker.

use anyhow::Result;
use parking_lot::Mutex;
use std::io::{ErrorKind, Read, Write};
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};
use warden_core::delivery::{ChannelError, EventChannel};
use warden_core::ipc::{peer_pid, IpcAuthContext, CONSUMER_CLIENT_ID};
use warden_core::Engine;

/// Blocking writer over the consumer's socket.
pub struct SocketChannel {
    stream: Mutex<StdUnixStream>,
}

impl SocketChannel {
    pub fn new(stream: StdUnixStream) -> Self {
        Self {
            stream: Mutex::new(stream),
        }
    }
}

fn is_timeout(kind: ErrorKind) -> bool {
    matches!(kind, ErrorKind::WouldBlock | ErrorKind::TimedOut)
}

impl EventChannel for SocketChannel {
    fn send(&self, record: &[u8], timeout: Duration) -> Result<(), ChannelError> {
        let mut stream = self.stream.lock();
        stream
            .set_write_timeout(Some(timeout.max(Duration::from_millis(1))))
            .map_err(|e| ChannelError::Failed(e.to_string()))?;

        let mut written = 0;
        while written < record.len() {
            match stream.write(&record[written..]) {
                Ok(0) => return Err(ChannelError::Disconnected),
                Ok(n) => written += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) if is_timeout(e.kind()) && written == 0 => return Err(ChannelError::Timeout),
                Err(e) if is_timeout(e.kind()) => {
                    // framing is lost once part of a record went out
                    warn!(written, size = record.len(), "event send timed out mid-record");
                    let _ = stream.shutdown(std::net::Shutdown::Both);
                    return Err(ChannelError::Disconnected);
                }
                Err(e) => {
                    return Err(match e.kind() {
                        ErrorKind::BrokenPipe
                        | ErrorKind::ConnectionReset
                        | ErrorKind::ConnectionAborted
                        | ErrorKind::NotConnected => ChannelError::Disconnected,
                        _ => ChannelError::Failed(e.to_string()),
                    })
                }
            }
        }
        Ok(())
    }
}

pub struct EventServer {
    auth: Arc<IpcAuthContext>,
    socket_path: PathBuf,
    engine: Arc<Engine>,
}

impl EventServer {
    pub fn new(secret: Vec<u8>, socket_path: PathBuf, engine: Arc<Engine>) -> Self {
        Self {
            auth: Arc::new(IpcAuthContext::new(secret)),
            socket_path,
            engine,
        }
    }

    pub fn bind(&self) -> Result<UnixListener> {
        if self.socket_path.exists() {
            let _ = std::fs::remove_file(&self.socket_path);
        }
        Ok(UnixListener::bind(&self.socket_path)?)
    }

    pub async fn serve(self: Arc<Self>, listener: UnixListener) -> Result<()> {
        loop {
            let (stream, _addr) = listener.accept().await?;
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.attach(stream).await {
                    warn!(error = %e, "event consumer rejected");
                }
            });
        }
    }

    async fn attach(&self, stream: UnixStream) -> Result<()> {
        let pid = peer_pid(&stream)?;
        let (read_half, mut writer) = tokio::io::split(stream);
        let mut reader = BufReader::new(read_half);
        self.auth.accept(&mut reader, &mut writer, CONSUMER_CLIENT_ID).await?;

        let stream = reader.into_inner().unsplit(writer).into_std()?;
        stream.set_nonblocking(false)?;
        let watch = stream.try_clone()?;
        self.engine
            .connect_consumer(pid, Arc::new(SocketChannel::new(stream)))?;
        info!(pid, "event consumer attached");

        let engine = self.engine.clone();
        tokio::task::spawn_blocking(move || watch_consumer(watch, pid, &engine));
        Ok(())
    }
}

/// Blocks until the consumer closes its end, then detaches it.
fn watch_consumer(mut stream: StdUnixStream, pid: u32, engine: &Engine) {
    let mut buf = [0u8; 64];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(_) => continue,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!(pid, error = %e, "consumer socket read failed");
                break;
            }
        }
    }
    if engine.pipeline().consumer_pid() == Some(pid) {
        if let Err(e) = engine.disconnect_consumer() {
            debug!(pid, error = %e, "consumer already detached");
        }
    }
}
