use crate::config::Settings;
use crate::protocol::{self, Command, ProtocolError};
use crate::rewrite::RewriteEngine;
use crate::session::Session;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, UnixListener};

/// The milter server: accepts MTA connections and runs one isolated
/// [`Session`] per connection. A failing session only ever takes down its
/// own connection.
pub struct Milter {
    settings: Arc<Settings>,
    engine: Arc<RewriteEngine>,
}

impl Milter {
    pub fn new(settings: Settings) -> Self {
        let settings = Arc::new(settings);
        let engine = Arc::new(RewriteEngine::new(settings.clone()));
        Milter { settings, engine }
    }

    /// Listen and serve until ctrl-c. Binds a unix socket when
    /// `socket_path` is configured, a TCP port otherwise.
    pub async fn run(&self) -> anyhow::Result<()> {
        if let Some(path) = self.settings.socket_path.clone() {
            // Remove existing socket if it exists
            if std::path::Path::new(&path).exists() {
                std::fs::remove_file(&path)?;
            }
            let listener = UnixListener::bind(&path)?;
            log::info!("Starting milter on: {}", path);
            self.serve_unix(listener).await
        } else {
            let addr = format!(
                "{}:{}",
                self.settings.listen_address, self.settings.milter_port
            );
            let listener = TcpListener::bind(&addr).await?;
            log::info!("Starting milter on: {}", addr);
            self.serve_tcp(listener).await
        }
    }

    async fn serve_tcp(&self, listener: TcpListener) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    log::info!("Shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => self.spawn_session(stream, addr.to_string()),
                        Err(e) => log::warn!("Failed to accept connection: {}", e),
                    }
                }
            }
        }
    }

    async fn serve_unix(&self, listener: UnixListener) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    log::info!("Shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _)) => self.spawn_session(stream, "unix".to_string()),
                        Err(e) => log::warn!("Failed to accept connection: {}", e),
                    }
                }
            }
        }
    }

    fn spawn_session<S>(&self, stream: S, peer: String)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let engine = self.engine.clone();
        let timeout = Duration::from_secs(self.settings.client_timeout);
        tokio::spawn(async move {
            log::debug!("Connection from: {}", peer);
            match handle_connection(stream, peer.clone(), engine, timeout).await {
                Ok(()) => log::debug!("{}: disconnected", peer),
                Err(e) => log::error!("{}: closing connection: {}", peer, e),
            }
        });
    }
}

/// Drive one connection: read frames, feed the session, write its replies.
/// Errors here are fatal to this connection only.
async fn handle_connection<S>(
    mut stream: S,
    peer: String,
    engine: Arc<RewriteEngine>,
    timeout: Duration,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut session = Session::new(engine, peer.clone());
    loop {
        let (code, payload) = match read_frame(&mut stream, timeout).await? {
            Some(frame) => frame,
            None => return Ok(()),
        };
        let command =
            Command::from_byte(code).ok_or(ProtocolError::UnknownCommand { code })?;
        log::debug!("{}: {} ({} bytes)", peer, command.as_str(), payload.len());

        for reply in session.dispatch(command, &payload)? {
            stream.write_all(&reply.to_bytes()).await?;
        }
        if session.is_closed() {
            return Ok(());
        }
    }
}

/// Read one length-prefixed frame. `None` means the peer disconnected.
async fn read_frame<S>(
    stream: &mut S,
    timeout: Duration,
) -> anyhow::Result<Option<(u8, Vec<u8>)>>
where
    S: AsyncRead + Unpin,
{
    let size = match tokio::time::timeout(timeout, stream.read_u32()).await {
        Ok(Ok(size)) => size,
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Ok(Err(e)) => return Err(e.into()),
        Err(_) => anyhow::bail!("no event within {}s, closing stalled session", timeout.as_secs()),
    };
    protocol::check_frame_size(size)?;

    let mut frame = vec![0u8; size as usize];
    match tokio::time::timeout(timeout, stream.read_exact(&mut frame)).await {
        Ok(result) => {
            result?;
        }
        Err(_) => anyhow::bail!("no event within {}s, closing stalled session", timeout.as_secs()),
    }
    let payload = frame.split_off(1);
    Ok(Some((frame[0], payload)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FileConfig;
    use crate::protocol::{SMFIF_ADDHDRS, SMFIF_CHGHDRS};

    fn test_engine() -> Arc<RewriteEngine> {
        let settings = FileConfig {
            domain: Some("dmarc.example.com".to_string()),
            ..Default::default()
        }
        .resolve()
        .unwrap();
        Arc::new(RewriteEngine::new(Arc::new(settings)))
    }

    fn frame(code: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(payload.len() as u32 + 1).to_be_bytes());
        out.push(code);
        out.extend_from_slice(payload);
        out
    }

    #[tokio::test]
    async fn test_connection_negotiates_and_quits() {
        let (mut client, server) = tokio::io::duplex(4096);
        let task = tokio::spawn(handle_connection(
            server,
            "test".to_string(),
            test_engine(),
            Duration::from_secs(5),
        ));

        let mut optneg = Vec::new();
        optneg.extend_from_slice(&6u32.to_be_bytes());
        optneg.extend_from_slice(&0x1FFu32.to_be_bytes());
        optneg.extend_from_slice(&0u32.to_be_bytes());
        client.write_all(&frame(b'O', &optneg)).await.unwrap();

        let mut reply = [0u8; 17];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply[..4], &[0, 0, 0, 13]);
        assert_eq!(reply[4], b'O');
        assert_eq!(
            &reply[9..13],
            &(SMFIF_ADDHDRS | SMFIF_CHGHDRS).to_be_bytes()
        );

        client.write_all(&frame(b'Q', b"")).await.unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_connection_closes_on_protocol_error() {
        let (mut client, server) = tokio::io::duplex(4096);
        let task = tokio::spawn(handle_connection(
            server,
            "test".to_string(),
            test_engine(),
            Duration::from_secs(5),
        ));

        // A header frame before negotiation is out of sequence.
        client
            .write_all(&frame(b'L', b"From\0a@b\0"))
            .await
            .unwrap();
        assert!(task.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_zero_length_frame_is_rejected() {
        let (mut client, server) = tokio::io::duplex(4096);
        let task = tokio::spawn(handle_connection(
            server,
            "test".to_string(),
            test_engine(),
            Duration::from_secs(5),
        ));

        client.write_all(&0u32.to_be_bytes()).await.unwrap();
        assert!(task.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_clean_disconnect_is_not_an_error() {
        let (client, server) = tokio::io::duplex(4096);
        let task = tokio::spawn(handle_connection(
            server,
            "test".to_string(),
            test_engine(),
            Duration::from_secs(5),
        ));
        drop(client);
        assert!(task.await.unwrap().is_ok());
    }
}
