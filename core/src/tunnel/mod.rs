use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{BackupError, Result};

/// Everything needed to open a local forward through a jump host. Secrets
/// arrive already decrypted; when both are present the private key wins.
pub struct TunnelParams {
    pub ssh_host: String,
    pub ssh_port: u16,
    pub ssh_username: String,
    pub password: Option<String>,
    pub private_key: Option<String>,
    pub target_host: String,
    pub target_port: u16,
}

/// A live forward from `127.0.0.1:<local_port>` to the target endpoint.
/// Lives for a single dump or restore; dropping the handle tears the
/// tunnel down on every exit path, including panics.
#[derive(Debug)]
pub struct TunnelHandle {
    local_port: u16,
    shutdown: Arc<AtomicBool>,
}

impl TunnelHandle {
    pub fn local_host(&self) -> &'static str {
        "127.0.0.1"
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }
}

impl Drop for TunnelHandle {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

fn validate(params: &TunnelParams) -> Result<()> {
    let has_key = params.private_key.as_deref().is_some_and(|k| !k.is_empty());
    let has_password = params.password.as_deref().is_some_and(|p| !p.is_empty());
    if !has_key && !has_password {
        return Err(BackupError::Tunnel(
            "no ssh credential available: set a password or a private key".into(),
        ));
    }
    Ok(())
}

#[cfg(feature = "ssh")]
mod forward {
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream, ToSocketAddrs};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use log::{debug, warn};
    use ssh2::Session;

    use crate::error::{BackupError, Result};

    use super::{validate, TunnelHandle, TunnelParams};

    const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
    const IDLE_SLEEP: Duration = Duration::from_millis(10);

    /// Opens the tunnel: TCP to the jump host, handshake, auth, then an
    /// ephemeral loopback listener pumped on a background thread.
    pub fn open(params: TunnelParams) -> Result<TunnelHandle> {
        validate(&params)?;

        let addr = (params.ssh_host.as_str(), params.ssh_port)
            .to_socket_addrs()
            .map_err(|e| BackupError::Tunnel(format!("cannot resolve jump host: {e}")))?
            .next()
            .ok_or_else(|| BackupError::Tunnel("jump host resolved to no address".into()))?;

        let tcp = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)
            .map_err(|e| BackupError::Tunnel(format!("cannot reach jump host: {e}")))?;

        let mut session = Session::new()
            .map_err(|e| BackupError::Tunnel(format!("session init failed: {e}")))?;
        session.set_tcp_stream(tcp);
        session
            .handshake()
            .map_err(|e| BackupError::Tunnel(format!("handshake failed: {e}")))?;

        match (&params.private_key, &params.password) {
            (Some(key), _) if !key.is_empty() => session
                .userauth_pubkey_memory(&params.ssh_username, None, key, None)
                .map_err(|e| BackupError::Tunnel(format!("key authentication failed: {e}")))?,
            (_, Some(password)) => session
                .userauth_password(&params.ssh_username, password)
                .map_err(|e| BackupError::Tunnel(format!("password authentication failed: {e}")))?,
            _ => unreachable!("validate() requires a credential"),
        }
        if !session.authenticated() {
            return Err(BackupError::Tunnel("authentication rejected".into()));
        }

        let listener = TcpListener::bind("127.0.0.1:0")
            .map_err(|e| BackupError::Tunnel(format!("cannot bind local port: {e}")))?;
        let local_port = listener
            .local_addr()
            .map_err(|e| BackupError::Tunnel(e.to_string()))?
            .port();
        listener
            .set_nonblocking(true)
            .map_err(|e| BackupError::Tunnel(e.to_string()))?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = shutdown.clone();
        let target_host = params.target_host.clone();
        let target_port = params.target_port;

        std::thread::spawn(move || {
            forward_loop(session, listener, &target_host, target_port, &flag);
            debug!("ssh tunnel on local port {local_port} closed");
        });

        debug!(
            "ssh tunnel open: 127.0.0.1:{} -> {}:{} via {}:{}",
            local_port, params.target_host, params.target_port, params.ssh_host, params.ssh_port
        );

        Ok(TunnelHandle {
            local_port,
            shutdown,
        })
    }

    /// Single-threaded pump: accepts local connections and shuttles bytes
    /// between each one and its direct-tcpip channel. The session is
    /// non-blocking except during channel setup.
    fn forward_loop(
        session: Session,
        listener: TcpListener,
        target_host: &str,
        target_port: u16,
        shutdown: &AtomicBool,
    ) {
        let mut pairs: Vec<(TcpStream, ssh2::Channel)> = Vec::new();
        session.set_blocking(false);

        while !shutdown.load(Ordering::SeqCst) {
            match listener.accept() {
                Ok((stream, _)) => {
                    session.set_blocking(true);
                    match session.channel_direct_tcpip(target_host, target_port, None) {
                        Ok(channel) => {
                            session.set_blocking(false);
                            if stream.set_nonblocking(true).is_ok() {
                                pairs.push((stream, channel));
                            }
                        }
                        Err(e) => {
                            session.set_blocking(false);
                            warn!("direct-tcpip channel failed: {e}");
                        }
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    warn!("tunnel listener error: {e}");
                    break;
                }
            }

            let mut moved = false;
            pairs.retain_mut(|(stream, channel)| match pump(stream, channel) {
                Ok(active) => {
                    moved |= active;
                    true
                }
                Err(_) => false,
            });

            if !moved {
                std::thread::sleep(IDLE_SLEEP);
            }
        }
    }

    /// One bidirectional transfer round. `Err` means the pair is done
    /// (either side closed) and should be dropped.
    fn pump(stream: &mut TcpStream, channel: &mut ssh2::Channel) -> std::io::Result<bool> {
        let mut buf = [0u8; 16384];
        let mut moved = false;

        match stream.read(&mut buf) {
            Ok(0) => return Err(std::io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => {
                write_fully(channel, &buf[..n])?;
                moved = true;
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(e),
        }

        match channel.read(&mut buf) {
            Ok(0) => {
                if channel.eof() {
                    return Err(std::io::ErrorKind::UnexpectedEof.into());
                }
            }
            Ok(n) => {
                write_fully(stream, &buf[..n])?;
                moved = true;
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(e),
        }

        Ok(moved)
    }

    /// write_all over a non-blocking sink, retrying short writes.
    fn write_fully(sink: &mut impl Write, mut data: &[u8]) -> std::io::Result<()> {
        while !data.is_empty() {
            match sink.write(data) {
                Ok(0) => return Err(std::io::ErrorKind::WriteZero.into()),
                Ok(n) => data = &data[n..],
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// Opens a tunnel for one dump or restore. Never reused across calls.
#[cfg(feature = "ssh")]
pub fn open(params: TunnelParams) -> Result<TunnelHandle> {
    forward::open(params)
}

#[cfg(not(feature = "ssh"))]
pub fn open(params: TunnelParams) -> Result<TunnelHandle> {
    validate(&params)?;
    Err(BackupError::Tunnel(
        "this build does not include ssh support (enable the `ssh` feature)".into(),
    ))
}
