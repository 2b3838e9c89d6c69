//! Per-connection FTP control session (RFC 959 subset).
//!
//! Line-based command loop with passive-mode data connections. Every
//! filesystem verb goes through the shared sandboxed adapter; adapter
//! errors map onto permanent 5xx replies, local I/O trouble onto 4xx.

use mft_target_core::{
    Authenticator, DirEntry, Error, OpenRequest, Result, SandboxFs, StaticCredentials,
    TargetConfig, VirtualFs, normalize_virtual,
};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{Duration, timeout};
use tracing::{debug, info, warn};

const DATA_ACCEPT_TIMEOUT: Duration = Duration::from_secs(30);
const TRANSFER_CHUNK: usize = 64 * 1024;

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Quit,
}

/// One FTP control connection.
pub struct FtpSession {
    config: Arc<TargetConfig>,
    fs: Arc<SandboxFs>,
    auth: Arc<StaticCredentials>,
    peer: SocketAddr,
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    user: Option<String>,
    authenticated: bool,
    cwd: String,
    data_listener: Option<TcpListener>,
    rename_from: Option<String>,
}

impl FtpSession {
    pub fn new(
        stream: TcpStream,
        peer: SocketAddr,
        config: Arc<TargetConfig>,
        fs: Arc<SandboxFs>,
        auth: Arc<StaticCredentials>,
    ) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self {
            config,
            fs,
            auth,
            peer,
            reader: BufReader::new(read_half),
            writer: write_half,
            user: None,
            authenticated: false,
            cwd: "/".to_string(),
            data_listener: None,
            rename_from: None,
        }
    }

    /// Serve the control connection until QUIT, timeout, or disconnect.
    pub async fn run(mut self) -> Result<()> {
        let banner = self.config.banner.clone();
        self.reply(220, &banner).await?;

        let read_timeout = Duration::from_secs(self.config.session_timeout_secs);

        loop {
            let mut line = String::new();
            let read = timeout(read_timeout, self.reader.read_line(&mut line)).await;

            let n = match read {
                Ok(Ok(n)) => n,
                Ok(Err(e)) => return Err(Error::from_io(e, "control channel")),
                Err(_) => {
                    debug!(peer = %self.peer, "control connection timed out");
                    let _ = self.reply(421, "Timeout").await;
                    return Ok(());
                }
            };
            if n == 0 {
                debug!(peer = %self.peer, "peer closed control connection");
                return Ok(());
            }

            let line = line.trim_end_matches(['\r', '\n']);
            if line.is_empty() {
                continue;
            }

            let (verb, arg) = split_command(line);
            debug!(peer = %self.peer, verb, "command");

            if self.dispatch(&verb, arg).await? == Flow::Quit {
                return Ok(());
            }
        }
    }

    async fn dispatch(&mut self, verb: &str, arg: &str) -> Result<Flow> {
        match verb {
            "USER" => {
                self.user = Some(arg.to_string());
                self.authenticated = false;
                self.reply(331, "Password required").await?;
            }
            "PASS" => {
                let user = self.user.clone().unwrap_or_default();
                if self.auth.check_password(&user, arg) {
                    info!(peer = %self.peer, user, "ftp login successful");
                    self.authenticated = true;
                    self.reply(230, "Login successful").await?;
                } else {
                    self.reply(530, "Login incorrect").await?;
                }
            }
            "QUIT" => {
                self.reply(221, "Goodbye").await?;
                return Ok(Flow::Quit);
            }
            "SYST" => self.reply(215, "UNIX Type: L8").await?,
            "NOOP" => self.reply(200, "NOOP ok").await?,
            "FEAT" => {
                self.write_raw("211-Features:\r\n EPSV\r\n PASV\r\n SIZE\r\n211 End\r\n")
                    .await?;
            }
            "TYPE" => match arg.to_ascii_uppercase().as_str() {
                "I" | "L 8" => self.reply(200, "Type set to I").await?,
                "A" | "A N" => self.reply(200, "Type set to A").await?,
                _ => self.reply(504, "Unsupported type").await?,
            },
            _ if !self.authenticated => self.reply(530, "Not logged in").await?,
            "PWD" | "XPWD" => {
                let line = format!("\"{}\" is the current directory", self.cwd);
                self.reply(257, &line).await?;
            }
            "CWD" => self.cmd_cwd(arg).await?,
            "CDUP" => {
                self.cwd = normalize_virtual(&format!("{}/..", self.cwd));
                self.reply(250, "Directory changed").await?;
            }
            "PASV" => self.cmd_pasv().await?,
            "EPSV" => self.cmd_epsv().await?,
            "LIST" => self.cmd_list(arg, true).await?,
            "NLST" => self.cmd_list(arg, false).await?,
            "STOR" => self.cmd_store(arg, false).await?,
            "APPE" => self.cmd_store(arg, true).await?,
            "RETR" => self.cmd_retrieve(arg).await?,
            "DELE" => {
                let vpath = self.vpath(arg);
                match self.fs.remove(&vpath).await {
                    Ok(()) => self.reply(250, "File deleted").await?,
                    Err(e) => self.reply_error(&e).await?,
                }
            }
            "MKD" | "XMKD" => {
                let vpath = normalize_virtual(&self.vpath(arg));
                match self.fs.mkdir(&vpath, Default::default()).await {
                    Ok(()) => {
                        let line = format!("\"{vpath}\" created");
                        self.reply(257, &line).await?;
                    }
                    Err(e) => self.reply_error(&e).await?,
                }
            }
            "RMD" | "XRMD" => {
                let vpath = self.vpath(arg);
                match self.fs.rmdir(&vpath).await {
                    Ok(()) => self.reply(250, "Directory removed").await?,
                    Err(e) => self.reply_error(&e).await?,
                }
            }
            "SIZE" => {
                let vpath = self.vpath(arg);
                match self.fs.stat(&vpath).await {
                    Ok(attrs) if attrs.is_dir => {
                        self.reply(550, "Not a regular file").await?;
                    }
                    Ok(attrs) => {
                        let line = attrs.size.to_string();
                        self.reply(213, &line).await?;
                    }
                    Err(e) => self.reply_error(&e).await?,
                }
            }
            "RNFR" => {
                let vpath = self.vpath(arg);
                match self.fs.stat(&vpath).await {
                    Ok(_) => {
                        self.rename_from = Some(vpath);
                        self.reply(350, "Ready for destination name").await?;
                    }
                    Err(e) => self.reply_error(&e).await?,
                }
            }
            "RNTO" => {
                let Some(from) = self.rename_from.take() else {
                    self.reply(503, "RNFR required first").await?;
                    return Ok(Flow::Continue);
                };
                let to = self.vpath(arg);
                match self.fs.rename(&from, &to).await {
                    Ok(()) => self.reply(250, "Rename successful").await?,
                    Err(e) => self.reply_error(&e).await?,
                }
            }
            _ => self.reply(502, "Command not implemented").await?,
        }

        Ok(Flow::Continue)
    }

    async fn cmd_cwd(&mut self, arg: &str) -> Result<()> {
        let target = normalize_virtual(&self.vpath(arg));
        match self.fs.stat(&target).await {
            Ok(attrs) if attrs.is_dir => {
                self.cwd = target;
                self.reply(250, "Directory changed").await
            }
            Ok(_) => self.reply(550, "Not a directory").await,
            Err(e) => self.reply_error(&e).await,
        }
    }

    async fn cmd_pasv(&mut self) -> Result<()> {
        let listener = match self.bind_data_listener().await {
            Ok(listener) => listener,
            Err(e) => {
                warn!(peer = %self.peer, error = %e, "failed to enter passive mode");
                return self.reply(425, "Cannot open data connection").await;
            }
        };
        let port = listener
            .local_addr()
            .map_err(|e| Error::from_io(e, "data listener"))?
            .port();

        let ip = match self.config.bind_address {
            IpAddr::V4(v4) => v4,
            IpAddr::V6(_) => Ipv4Addr::LOCALHOST,
        };
        let [a, b, c, d] = ip.octets();
        let line = format!(
            "Entering Passive Mode ({a},{b},{c},{d},{},{})",
            port / 256,
            port % 256
        );
        self.data_listener = Some(listener);
        self.reply(227, &line).await
    }

    async fn cmd_epsv(&mut self) -> Result<()> {
        let listener = match self.bind_data_listener().await {
            Ok(listener) => listener,
            Err(e) => {
                warn!(peer = %self.peer, error = %e, "failed to enter passive mode");
                return self.reply(425, "Cannot open data connection").await;
            }
        };
        let port = listener
            .local_addr()
            .map_err(|e| Error::from_io(e, "data listener"))?
            .port();

        let line = format!("Entering Extended Passive Mode (|||{port}|)");
        self.data_listener = Some(listener);
        self.reply(229, &line).await
    }

    async fn bind_data_listener(&self) -> Result<TcpListener> {
        TcpListener::bind((self.config.bind_address, 0))
            .await
            .map_err(|e| Error::from_io(e, "data listener"))
    }

    async fn cmd_store(&mut self, arg: &str, append: bool) -> Result<()> {
        if arg.is_empty() {
            return self.reply(501, "Missing file name").await;
        }
        let vpath = self.vpath(arg);

        let request = if append {
            OpenRequest::append()
        } else {
            OpenRequest::create_truncate()
        };
        let handle = match self.fs.open(&vpath, request).await {
            Ok(handle) => handle,
            Err(e) => return self.reply_error(&e).await,
        };

        let Some(mut data) = self.accept_data_connection().await? else {
            return Ok(());
        };
        self.reply(150, "Ok to send data").await?;

        let mut offset = 0u64;
        let mut buf = vec![0u8; TRANSFER_CHUNK];
        loop {
            let n = match data.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    warn!(peer = %self.peer, error = %e, "data connection failed during upload");
                    return self.reply(426, "Transfer aborted").await;
                }
            };
            if let Err(e) = handle.write_at(offset, &buf[..n]).await {
                warn!(peer = %self.peer, error = %e, "write failed during upload");
                return self.reply(451, "Local error writing file").await;
            }
            offset += n as u64;
        }

        if let Err(e) = handle.close().await {
            warn!(peer = %self.peer, error = %e, "close failed after upload");
            return self.reply(451, "Local error writing file").await;
        }

        info!(peer = %self.peer, path = vpath, bytes = offset, "upload complete");
        self.reply(226, "Transfer complete").await
    }

    async fn cmd_retrieve(&mut self, arg: &str) -> Result<()> {
        if arg.is_empty() {
            return self.reply(501, "Missing file name").await;
        }
        let vpath = self.vpath(arg);

        let handle = match self.fs.open(&vpath, OpenRequest::read_only()).await {
            Ok(handle) => handle,
            Err(e) => return self.reply_error(&e).await,
        };

        let Some(mut data) = self.accept_data_connection().await? else {
            return Ok(());
        };
        self.reply(150, "Opening data connection").await?;

        let mut offset = 0u64;
        loop {
            let chunk = match handle.read_at(offset, TRANSFER_CHUNK as u32).await {
                Ok(chunk) => chunk,
                Err(e) => {
                    warn!(peer = %self.peer, error = %e, "read failed during download");
                    return self.reply(451, "Local error reading file").await;
                }
            };
            if chunk.is_empty() {
                break;
            }
            offset += chunk.len() as u64;
            if let Err(e) = data.write_all(&chunk).await {
                warn!(peer = %self.peer, error = %e, "data connection failed during download");
                return self.reply(426, "Transfer aborted").await;
            }
        }

        drop(data);
        info!(peer = %self.peer, path = vpath, bytes = offset, "download complete");
        self.reply(226, "Transfer complete").await
    }

    async fn cmd_list(&mut self, arg: &str, long: bool) -> Result<()> {
        // Clients pass ls-style flags; treat them as the current directory.
        let target = if arg.is_empty() || arg.starts_with('-') {
            self.cwd.clone()
        } else {
            self.vpath(arg)
        };

        let entries = match self.fs.list(&target).await {
            Ok(entries) => entries,
            Err(e) => return self.reply_error(&e).await,
        };

        let Some(mut data) = self.accept_data_connection().await? else {
            return Ok(());
        };
        self.reply(150, "Here comes the directory listing").await?;

        for entry in &entries {
            let line = if long {
                format_list_entry(entry)
            } else {
                format!("{}\r\n", entry.name)
            };
            if let Err(e) = data.write_all(line.as_bytes()).await {
                warn!(peer = %self.peer, error = %e, "data connection failed during listing");
                return self.reply(426, "Transfer aborted").await;
            }
        }

        drop(data);
        self.reply(226, "Directory send OK").await
    }

    /// Accept the peer's connection on the armed passive listener. A `None`
    /// means the failure reply has already been sent.
    async fn accept_data_connection(&mut self) -> Result<Option<TcpStream>> {
        let Some(listener) = self.data_listener.take() else {
            self.reply(425, "Use PASV or EPSV first").await?;
            return Ok(None);
        };

        match timeout(DATA_ACCEPT_TIMEOUT, listener.accept()).await {
            Ok(Ok((stream, _))) => Ok(Some(stream)),
            Ok(Err(e)) => {
                warn!(peer = %self.peer, error = %e, "data accept failed");
                self.reply(425, "Cannot open data connection").await?;
                Ok(None)
            }
            Err(_) => {
                self.reply(425, "Data connection timed out").await?;
                Ok(None)
            }
        }
    }

    /// Join a command argument onto the session's working directory.
    fn vpath(&self, arg: &str) -> String {
        if arg.starts_with('/') {
            arg.to_string()
        } else if self.cwd == "/" {
            format!("/{arg}")
        } else {
            format!("{}/{arg}", self.cwd)
        }
    }

    async fn reply(&mut self, code: u16, text: &str) -> Result<()> {
        let line = format!("{code} {text}\r\n");
        self.write_raw(&line).await
    }

    async fn write_raw(&mut self, raw: &str) -> Result<()> {
        self.writer
            .write_all(raw.as_bytes())
            .await
            .map_err(|e| Error::from_io(e, "control channel"))
    }

    async fn reply_error(&mut self, err: &Error) -> Result<()> {
        if err.is_security_event() {
            warn!(peer = %self.peer, error = %err, "request denied");
        }
        let (code, text) = reply_for(err);
        self.reply(code, text).await
    }
}

/// Split a control line into uppercased verb and argument.
fn split_command(line: &str) -> (String, &str) {
    match line.split_once(' ') {
        Some((verb, arg)) => (verb.to_ascii_uppercase(), arg.trim()),
        None => (line.to_ascii_uppercase(), ""),
    }
}

/// Map a domain error onto its FTP reply.
fn reply_for(err: &Error) -> (u16, &'static str) {
    match err {
        Error::NotFound(_) => (550, "File or directory not found"),
        Error::AccessDenied(_) | Error::PermissionDenied(_) => (550, "Permission denied"),
        Error::DirectoryNotEmpty(_) => (550, "Directory not empty"),
        Error::AlreadyExists(_) => (550, "Already exists"),
        Error::InvalidPath(_) => (553, "Invalid file name"),
        Error::Unsupported(_) => (502, "Command not implemented"),
        _ => (451, "Local error in processing"),
    }
}

/// One `LIST` line, ls -l style.
fn format_list_entry(entry: &DirEntry) -> String {
    let attrs = &entry.attrs;
    let kind = if attrs.is_dir { 'd' } else { '-' };
    let perms = permission_string(attrs.mode);
    let date = chrono::DateTime::from_timestamp(i64::from(attrs.mtime), 0)
        .map(|t| t.format("%b %e %H:%M").to_string())
        .unwrap_or_else(|| "Jan  1 00:00".to_string());

    format!(
        "{kind}{perms} 1 ftp ftp {size:>12} {date} {name}\r\n",
        size = attrs.size,
        name = entry.name
    )
}

fn permission_string(mode: u32) -> String {
    let mut out = String::with_capacity(9);
    for shift in [6u32, 3, 0] {
        let bits = (mode >> shift) & 0o7;
        out.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        out.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        out.push(if bits & 0o1 != 0 { 'x' } else { '-' });
    }
    out
}
