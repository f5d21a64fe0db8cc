use std::io;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use sha2::{Digest, Sha256};
use ssh2::Session;
use thiserror::Error;
use tracing::debug;

use crate::config::{normalize_fingerprint, Config};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const SESSION_TIMEOUT_MS: u32 = 20_000;

#[derive(Debug, Error)]
pub enum TransportError {
	#[error("connection failed: {0}")]
	Connect(String),

	#[error("host key mismatch: expected {expected}, got {actual}")]
	HostKeyMismatch { expected: String, actual: String },

	#[error("authentication failed: {0}")]
	Auth(String),

	#[error("remote I/O error: {0}")]
	Remote(String),

	#[error("local I/O error: {0}")]
	Local(#[from] io::Error),
}

/// The narrow surface the upload path needs from a transfer session.
/// Calls are blocking; exactly one task owns an implementation at a time.
pub trait RemoteFs: Send {
	/// Upload the local file's bytes to `remote`.
	fn put(&mut self, local: &Path, remote: &str) -> Result<(), TransportError>;

	/// Create one remote directory (not its parents).
	fn mkdir(&mut self, remote: &str) -> Result<(), TransportError>;

	/// Whether a remote path exists.
	fn exists(&mut self, remote: &str) -> Result<bool, TransportError>;
}

/// Session factory. The pool calls this lazily whenever it has a free
/// slot and no idle session.
pub trait Connect: Send + Sync {
	fn connect(&self) -> Result<Box<dyn RemoteFs>, TransportError>;
}

/// SFTP connector: TCP, SSH handshake, host key verification against the
/// configured fingerprint, then pubkey authentication.
pub struct SftpConnector {
	server: String,
	port: u16,
	username: String,
	private_key_path: PathBuf,
	fingerprint: String,
}

impl SftpConnector {
	pub fn new(config: &Config) -> SftpConnector {
		SftpConnector {
			server: config.server.clone(),
			port: config.port,
			username: config.username.clone(),
			private_key_path: config.private_key_path.clone(),
			fingerprint: normalize_fingerprint(&config.host_key_fingerprint),
		}
	}
}

impl Connect for SftpConnector {
	fn connect(&self) -> Result<Box<dyn RemoteFs>, TransportError> {
		let addr = format!("{}:{}", self.server, self.port);
		let sock = addr
			.to_socket_addrs()
			.map_err(|e| TransportError::Connect(format!("{addr}: {e}")))?
			.next()
			.ok_or_else(|| TransportError::Connect(format!("{addr}: no usable address")))?;

		let tcp = TcpStream::connect_timeout(&sock, CONNECT_TIMEOUT)
			.map_err(|e| TransportError::Connect(format!("{addr}: {e}")))?;

		let mut sess =
			Session::new().map_err(|e| TransportError::Connect(format!("session init: {e}")))?;
		sess.set_tcp_stream(tcp);
		sess.set_timeout(SESSION_TIMEOUT_MS);
		sess.handshake()
			.map_err(|e| TransportError::Connect(format!("handshake with {addr}: {e}")))?;

		// Verify who we are talking to before offering credentials.
		verify_host_key(&sess, &self.fingerprint)?;

		sess.userauth_pubkey_file(&self.username, None, &self.private_key_path, None)
			.map_err(|e| TransportError::Auth(e.to_string()))?;
		if !sess.authenticated() {
			return Err(TransportError::Auth("server rejected credentials".into()));
		}

		let sftp = sess
			.sftp()
			.map_err(|e| TransportError::Connect(format!("sftp channel: {e}")))?;

		debug!(server = %self.server, "transfer session established");
		Ok(Box::new(SftpSession { _session: sess, sftp }))
	}
}

fn verify_host_key(sess: &Session, expected: &str) -> Result<(), TransportError> {
	let (key, _type) = sess
		.host_key()
		.ok_or_else(|| TransportError::Connect("remote offered no host key".into()))?;
	let actual = hex::encode(Sha256::digest(key));
	if actual != expected {
		return Err(TransportError::HostKeyMismatch {
			expected: expected.to_string(),
			actual,
		});
	}
	Ok(())
}

/// The session handle must outlive the sftp channel.
struct SftpSession {
	_session: Session,
	sftp: ssh2::Sftp,
}

impl RemoteFs for SftpSession {
	fn put(&mut self, local: &Path, remote: &str) -> Result<(), TransportError> {
		let mut src = std::fs::File::open(local)?;
		let mut dst = self
			.sftp
			.create(Path::new(remote))
			.map_err(|e| TransportError::Remote(format!("create {remote}: {e}")))?;
		io::copy(&mut src, &mut dst)
			.map_err(|e| TransportError::Remote(format!("write {remote}: {e}")))?;
		Ok(())
	}

	fn mkdir(&mut self, remote: &str) -> Result<(), TransportError> {
		self.sftp
			.mkdir(Path::new(remote), 0o755)
			.map_err(|e| TransportError::Remote(format!("mkdir {remote}: {e}")))
	}

	fn exists(&mut self, remote: &str) -> Result<bool, TransportError> {
		Ok(self.sftp.stat(Path::new(remote)).is_ok())
	}
}
