//! SSH protocol version exchange (RFC 4253 Section 4.2).
//!
//! The SSH protocol begins with a version exchange where both client and server
//! send an identification string:
//!
//! ```text
//! SSH-protoversion-softwareversion SP comments CR LF
//! ```
//!
//! The server may send other lines before its identification string; they
//! are skipped.
//!
//! # Security
//!
//! - Maximum line length: 255 characters including CR LF (DoS prevention)
//! - At most [`MAX_PREAMBLE_LINES`] lines before the identification string
//! - Must start with "SSH-2.0-" or "SSH-1.99-"
//! - No null bytes allowed in version string
//!
//! # Example
//!
//! ```rust
//! use conduit_proto::ssh::version::Version;
//!
//! let version = Version::new("Conduit_0.1.0", Some("engine"));
//! assert_eq!(version.to_string(), "SSH-2.0-Conduit_0.1.0 engine");
//!
//! let parsed = Version::parse("SSH-2.0-OpenSSH_8.9").unwrap();
//! assert_eq!(parsed.software(), "OpenSSH_8.9");
//! ```

use conduit_platform::{ConduitError, ConduitResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Maximum length of SSH version string (RFC 4253 Section 4.2).
pub const MAX_VERSION_LENGTH: usize = 255;

/// Maximum number of lines accepted before the identification string.
pub const MAX_PREAMBLE_LINES: usize = 32;

/// SSH protocol version string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    proto_version: String,
    software_version: String,
    comments: Option<String>,
}

impl Version {
    /// Creates a version string with protocol version "2.0".
    pub fn new(software: &str, comments: Option<&str>) -> Self {
        Self {
            proto_version: "2.0".to_string(),
            software_version: software.to_string(),
            comments: comments.map(String::from),
        }
    }

    /// Returns the default version string of this crate.
    ///
    /// ```rust
    /// use conduit_proto::ssh::version::Version;
    ///
    /// let version = Version::default_conduit();
    /// assert!(version.to_string().starts_with("SSH-2.0-Conduit_"));
    /// ```
    pub fn default_conduit() -> Self {
        Self::new(&format!("Conduit_{}", env!("CARGO_PKG_VERSION")), None)
    }

    /// Parses an SSH version string, with or without CR LF.
    ///
    /// # Errors
    ///
    /// - [`ConduitError::InvalidFormat`] if the line is too long, contains a
    ///   null byte or is not an `SSH-` line
    /// - [`ConduitError::Negotiation`] if the protocol version is not "2.0"
    ///   or "1.99"
    pub fn parse(line: &str) -> ConduitResult<Self> {
        let line = line.trim_end_matches("\r\n").trim_end_matches('\n');

        if line.len() + 2 > MAX_VERSION_LENGTH {
            return Err(ConduitError::InvalidFormat(format!(
                "Version string too long: {} bytes (max {})",
                line.len() + 2,
                MAX_VERSION_LENGTH
            )));
        }

        if line.contains('\0') {
            return Err(ConduitError::InvalidFormat(
                "Version string contains null byte".to_string(),
            ));
        }

        if !line.starts_with("SSH-") {
            return Err(ConduitError::InvalidFormat(format!(
                "Invalid version string: must start with 'SSH-', got '{}'",
                line
            )));
        }

        let parts: Vec<&str> = line.splitn(3, '-').collect();
        if parts.len() < 3 {
            return Err(ConduitError::InvalidFormat(format!(
                "Invalid version string format: '{}'",
                line
            )));
        }

        let proto_version = parts[1];
        let rest = parts[2];

        if proto_version != "2.0" && proto_version != "1.99" {
            return Err(ConduitError::Negotiation(format!(
                "Unsupported protocol version: '{}' (expected '2.0' or '1.99')",
                proto_version
            )));
        }

        let (software_version, comments) = match rest.find(' ') {
            Some(space_pos) => (
                rest[..space_pos].to_string(),
                Some(rest[space_pos + 1..].to_string()),
            ),
            None => (rest.to_string(), None),
        };

        Ok(Self {
            proto_version: proto_version.to_string(),
            software_version,
            comments,
        })
    }

    /// Returns the protocol version (e.g., "2.0").
    pub fn proto_version(&self) -> &str {
        &self.proto_version
    }

    /// Returns the software version.
    pub fn software(&self) -> &str {
        &self.software_version
    }

    /// Returns the comments, if any.
    pub fn comments(&self) -> Option<&str> {
        self.comments.as_deref()
    }

    /// Converts to wire format (with CR LF).
    ///
    /// ```rust
    /// use conduit_proto::ssh::version::Version;
    ///
    /// let version = Version::new("Conduit_0.1.0", None);
    /// assert_eq!(version.to_wire_format(), b"SSH-2.0-Conduit_0.1.0\r\n");
    /// ```
    pub fn to_wire_format(&self) -> Vec<u8> {
        format!("{}\r\n", self).into_bytes()
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SSH-{}-{}", self.proto_version, self.software_version)?;
        if let Some(comments) = &self.comments {
            write!(f, " {}", comments)?;
        }
        Ok(())
    }
}

/// The peer's identification as received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerVersion {
    /// Parsed version
    pub version: Version,
    /// Exact line without CR LF, as hashed into the exchange hash
    pub line: String,
}

/// Writes our identification string.
pub async fn write_version<W>(stream: &mut W, version: &Version) -> ConduitResult<()>
where
    W: AsyncWrite + Unpin,
{
    let wire = version.to_wire_format();
    if wire.len() > MAX_VERSION_LENGTH {
        return Err(ConduitError::invalid_argument(
            "version",
            format!("identification string of {} bytes is too long", wire.len()),
        ));
    }
    stream.write_all(&wire).await?;
    stream.flush().await?;
    Ok(())
}

async fn read_line<R>(stream: &mut R) -> ConduitResult<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut line = Vec::with_capacity(64);
    loop {
        let byte = stream.read_u8().await?;
        if byte == b'\n' {
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            return Ok(line);
        }
        line.push(byte);
        if line.len() + 1 > MAX_VERSION_LENGTH {
            return Err(ConduitError::InvalidFormat(format!(
                "identification line exceeds {} bytes",
                MAX_VERSION_LENGTH
            )));
        }
    }
}

/// Reads the peer's identification string, skipping preamble lines.
///
/// Reads one byte at a time so nothing after the line is consumed.
pub async fn read_version<R>(stream: &mut R) -> ConduitResult<PeerVersion>
where
    R: AsyncRead + Unpin,
{
    for _ in 0..=MAX_PREAMBLE_LINES {
        let raw = read_line(stream).await?;
        if !raw.starts_with(b"SSH-") {
            debug!(len = raw.len(), "skipping line before identification string");
            continue;
        }
        let line = String::from_utf8(raw).map_err(|_| {
            ConduitError::InvalidFormat("identification string is not UTF-8".to_string())
        })?;
        let version = Version::parse(&line)?;
        return Ok(PeerVersion { version, line });
    }

    Err(ConduitError::InvalidFormat(format!(
        "no identification string within {} lines",
        MAX_PREAMBLE_LINES
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_new() {
        let version = Version::new("Conduit_0.1.0", None);
        assert_eq!(version.proto_version(), "2.0");
        assert_eq!(version.software(), "Conduit_0.1.0");
        assert_eq!(version.comments(), None);
    }

    #[test]
    fn test_version_display() {
        let version = Version::new("Conduit_0.1.0", Some("test comment"));
        assert_eq!(version.to_string(), "SSH-2.0-Conduit_0.1.0 test comment");
    }

    #[test]
    fn test_version_parse_with_comments() {
        let version = Version::parse("SSH-2.0-OpenSSH_8.9 Ubuntu-3ubuntu0.1\r\n").unwrap();
        assert_eq!(version.software(), "OpenSSH_8.9");
        assert_eq!(version.comments(), Some("Ubuntu-3ubuntu0.1"));
    }

    #[test]
    fn test_version_parse_accepts_1_99() {
        assert_eq!(
            Version::parse("SSH-1.99-Legacy").unwrap().proto_version(),
            "1.99"
        );
    }

    #[test]
    fn test_version_parse_invalid_prefix() {
        assert!(matches!(
            Version::parse("INVALID-2.0-Test"),
            Err(ConduitError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_version_parse_unsupported_protocol() {
        match Version::parse("SSH-1.5-OldServer") {
            Err(ConduitError::Negotiation(msg)) => {
                assert!(msg.contains("Unsupported protocol version"));
            }
            other => panic!("Expected Negotiation error, got {:?}", other),
        }
    }

    #[test]
    fn test_version_parse_too_long() {
        let long_string = format!("SSH-2.0-{}", "A".repeat(300));
        assert!(Version::parse(&long_string).is_err());
    }

    #[test]
    fn test_version_parse_null_byte() {
        assert!(Version::parse("SSH-2.0-Test\0Bad").is_err());
    }

    #[tokio::test]
    async fn test_read_version_skips_preamble() {
        let mut input: &[u8] = b"Welcome\r\nto the host\r\nSSH-2.0-OpenSSH_9.6 x\r\n\x00\x00";
        let peer = read_version(&mut input).await.unwrap();
        assert_eq!(peer.line, "SSH-2.0-OpenSSH_9.6 x");
        assert_eq!(peer.version.software(), "OpenSSH_9.6");
        // Bytes after the line stay unread
        assert_eq!(input, b"\x00\x00");
    }

    #[tokio::test]
    async fn test_read_version_accepts_bare_lf() {
        let mut input: &[u8] = b"SSH-2.0-dropbear\n";
        let peer = read_version(&mut input).await.unwrap();
        assert_eq!(peer.line, "SSH-2.0-dropbear");
    }

    #[tokio::test]
    async fn test_read_version_rejects_long_line() {
        let long = format!("SSH-2.0-{}\r\n", "A".repeat(400));
        let mut input = long.as_bytes();
        assert!(matches!(
            read_version(&mut input).await,
            Err(ConduitError::InvalidFormat(_))
        ));
    }

    #[tokio::test]
    async fn test_read_version_eof_is_io_error() {
        let mut input: &[u8] = b"SSH-2.0-cut";
        assert!(matches!(
            read_version(&mut input).await,
            Err(ConduitError::Io(_))
        ));
    }

    #[tokio::test]
    async fn test_write_version() {
        let mut out = Vec::new();
        write_version(&mut out, &Version::new("Conduit_0.1.0", None))
            .await
            .unwrap();
        assert_eq!(out, b"SSH-2.0-Conduit_0.1.0\r\n");
    }
}
