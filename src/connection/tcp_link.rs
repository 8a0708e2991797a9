use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use log::{info, warn};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::{ConnectionLink, ConnectionState, LinkError};

/// A [`ConnectionLink`] over a plain TCP socket.
///
/// The link only tracks whether the socket is open, whatever is spoken over
/// it belongs to the protocol engine.
pub struct TcpLink {
    name: String,
    address: String,
    state: Arc<watch::Sender<ConnectionState>>,
    session: Mutex<Option<CancellationToken>>,
}

impl TcpLink {
    pub fn new(name: &str, address: &str) -> TcpLink {
        let (state, _) = watch::channel(ConnectionState::Closed);
        TcpLink {
            name: name.to_string(),
            address: address.to_string(),
            state: Arc::new(state),
            session: Mutex::new(None),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    fn close_session(&self) {
        let session = match self.session.lock() {
            Ok(mut session) => session.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(token) = session {
            token.cancel();
        }
    }

    fn open_session(&self) -> CancellationToken {
        let token = CancellationToken::new();
        match self.session.lock() {
            Ok(mut session) => *session = Some(token.clone()),
            Err(poisoned) => *poisoned.into_inner() = Some(token.clone()),
        }
        token
    }
}

#[async_trait]
impl ConnectionLink for TcpLink {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    async fn connect(&self, attempt: u32) -> Result<(), LinkError> {
        self.close_session();
        self.state.send_replace(ConnectionState::Establishing);
        match TcpStream::connect(&self.address).await {
            Ok(stream) => {
                info!(
                    "Connected to {} at {} (attempt #{attempt})",
                    self.name, self.address
                );
                let token = self.open_session();
                self.state.send_replace(ConnectionState::Established);
                tokio::spawn(watch_stream(
                    self.name.clone(),
                    stream,
                    token,
                    self.state.clone(),
                ));
                Ok(())
            }
            Err(source) => {
                self.state.send_replace(ConnectionState::Closed);
                Err(LinkError::Io {
                    name: self.name.clone(),
                    address: self.address.clone(),
                    source,
                })
            }
        }
    }

    async fn disconnect(&self) {
        self.close_session();
        self.state.send_replace(ConnectionState::Closed);
    }
}

async fn watch_stream(
    name: String,
    mut stream: TcpStream,
    token: CancellationToken,
    state: Arc<watch::Sender<ConnectionState>>,
) {
    let mut buffer = [0u8; 1024];
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            read = stream.read(&mut buffer) => match read {
                Ok(0) => {
                    info!("{name} closed the connection");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("{name} connection error: {e}");
                    break;
                }
            },
        }
    }
    if !token.is_cancelled() {
        state.send_replace(ConnectionState::Closed);
    }
}
