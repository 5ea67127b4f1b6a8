// packages/proxy/src/interception/hosts_file.rs
//! Hosts file editing for DNS-level redirection
//!
//! Redirection entries are tagged with a trailing marker so the proxy only
//! ever removes lines it wrote itself:
//!
//! ```text
//! 127.0.0.2 sls.example.com # game-proxy
//! ```

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

const ENTRY_MARKER: &str = "# game-proxy";

/// Hosts file failure category
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostsErrorKind {
    /// File is flagged read-only (EACCES)
    ReadOnly,

    /// File is locked by another process (EBUSY)
    Busy,

    /// Not enough privileges (EPERM)
    PermissionDenied,

    /// File or directory missing (ENOENT)
    NotFound,

    Other,
}

impl HostsErrorKind {
    /// Classify an I/O error from a hosts file operation
    pub fn classify(err: &io::Error) -> Self {
        #[cfg(unix)]
        {
            match err.raw_os_error() {
                Some(libc::EACCES | libc::EROFS) => return HostsErrorKind::ReadOnly,
                Some(libc::EBUSY) => return HostsErrorKind::Busy,
                Some(libc::EPERM) => return HostsErrorKind::PermissionDenied,
                Some(libc::ENOENT) => return HostsErrorKind::NotFound,
                _ => {}
            }
        }

        match err.kind() {
            io::ErrorKind::PermissionDenied => HostsErrorKind::PermissionDenied,
            io::ErrorKind::NotFound => HostsErrorKind::NotFound,
            _ => HostsErrorKind::Other,
        }
    }
}

impl fmt::Display for HostsErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            HostsErrorKind::ReadOnly => "Hosts file is set to read-only",
            HostsErrorKind::Busy => "Hosts file is busy and cannot be written to",
            HostsErrorKind::PermissionDenied => "Insufficient permission to modify hosts file",
            HostsErrorKind::NotFound => "Unable to write to hosts file",
            HostsErrorKind::Other => "Unexpected hosts file error",
        };
        f.write_str(text)
    }
}

/// Categorised hosts file error
#[derive(Error, Debug)]
#[error("{kind} ({path}): {source}")]
pub struct HostsError {
    pub kind: HostsErrorKind,
    pub path: String,
    #[source]
    pub source: io::Error,
}

impl HostsError {
    pub fn new(path: &Path, source: io::Error) -> Self {
        Self {
            kind: HostsErrorKind::classify(&source),
            path: path.display().to_string(),
            source,
        }
    }

    /// User-facing remediation steps
    pub fn remediation(&self) -> Vec<String> {
        let antivirus = "Make sure no anti-virus software is running.".to_string();
        match self.kind {
            HostsErrorKind::ReadOnly => vec![
                antivirus,
                format!("Locate \"{}\" and clear its read-only attribute.", self.path),
            ],
            HostsErrorKind::Busy => vec![
                antivirus,
                format!("Try deleting \"{}\".", self.path),
            ],
            HostsErrorKind::PermissionDenied | HostsErrorKind::NotFound => vec![
                antivirus,
                "Run the proxy as administrator (or root).".to_string(),
            ],
            HostsErrorKind::Other => Vec::new(),
        }
    }
}

/// Store of hostname → address overrides
///
/// Both operations are idempotent.
pub trait HostsStore: Send {
    /// Make `hostname` resolve to `listen_hostname`
    fn set(&mut self, listen_hostname: &str, hostname: &str) -> Result<(), HostsError>;

    /// Remove a redirection previously made by `set`
    fn remove(&mut self, listen_hostname: &str, hostname: &str) -> Result<(), HostsError>;
}

/// OS hosts file
pub struct HostsFile {
    path: PathBuf,
}

impl HostsFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Hosts file of the running OS
    pub fn system() -> Self {
        Self::new(Self::default_path())
    }

    pub fn default_path() -> PathBuf {
        #[cfg(windows)]
        {
            let root = std::env::var("SystemRoot").unwrap_or_else(|_| "C:\\Windows".to_string());
            PathBuf::from(root).join("System32\\drivers\\etc\\hosts")
        }

        #[cfg(not(windows))]
        {
            PathBuf::from("/etc/hosts")
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<String, HostsError> {
        std::fs::read_to_string(&self.path).map_err(|e| HostsError::new(&self.path, e))
    }

    fn write(&self, content: &str) -> Result<(), HostsError> {
        std::fs::write(&self.path, content).map_err(|e| HostsError::new(&self.path, e))
    }

    /// Terminator the file already uses
    fn line_ending(content: &str) -> &'static str {
        if content.contains("\r\n") {
            "\r\n"
        } else {
            "\n"
        }
    }

    /// Whether `line` is one of our entries for the given pair
    fn is_entry(line: &str, listen_hostname: &str, hostname: &str) -> bool {
        let Some(body) = line.strip_suffix(ENTRY_MARKER) else {
            return false;
        };
        let mut fields = body.split_whitespace();
        fields.next() == Some(listen_hostname) && fields.next() == Some(hostname) && fields.next().is_none()
    }
}

impl HostsStore for HostsFile {
    fn set(&mut self, listen_hostname: &str, hostname: &str) -> Result<(), HostsError> {
        let mut content = self.read()?;

        if content
            .lines()
            .any(|line| Self::is_entry(line.trim_end(), listen_hostname, hostname))
        {
            debug!("Hosts entry for {} already present", hostname);
            return Ok(());
        }

        let eol = Self::line_ending(&content);
        if !content.is_empty() && !content.ends_with('\n') {
            content.push_str(eol);
        }
        content.push_str(&format!("{} {} {}{}", listen_hostname, hostname, ENTRY_MARKER, eol));

        debug!("Adding hosts entry {} -> {}", hostname, listen_hostname);
        self.write(&content)
    }

    fn remove(&mut self, listen_hostname: &str, hostname: &str) -> Result<(), HostsError> {
        let content = self.read()?;

        let mut removed = false;
        let mut kept = String::with_capacity(content.len());
        for line in content.split_inclusive('\n') {
            if Self::is_entry(line.trim_end(), listen_hostname, hostname) {
                removed = true;
                continue;
            }
            kept.push_str(line);
        }

        if !removed {
            return Ok(());
        }

        debug!("Removing hosts entry {} -> {}", hostname, listen_hostname);
        self.write(&kept)
    }
}
