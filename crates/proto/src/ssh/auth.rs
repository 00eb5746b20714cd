//! SSH user authentication protocol (RFC 4252).
//!
//! The engine only drives the request/response exchange. Which method to
//! try next is decided by an [`AuthStrategy`]; [`PasswordAuth`] and
//! [`NoneAuth`] are provided.
//!
//! # Security
//!
//! - Passwords are zeroized when dropped and redacted from `Debug` output
//! - Method-specific messages (60-79) are handed to the active strategy
//!
//! # Example
//!
//! ```rust
//! use conduit_proto::ssh::auth::{AuthMethodData, UserauthRequest};
//!
//! let req = UserauthRequest::new("alice", AuthMethodData::None);
//! assert_eq!(req.method.name(), "none");
//! assert_eq!(req.service, "ssh-connection");
//! ```

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use conduit_platform::{ConduitError, ConduitResult};
use zeroize::{Zeroize, Zeroizing};

use super::message::{Message, MessageBody};
use super::wire::{SshBufMut, WireReader};

/// Service requested after successful authentication.
pub const CONNECTION_SERVICE: &str = "ssh-connection";

/// Service carrying the authentication protocol.
pub const USERAUTH_SERVICE: &str = "ssh-userauth";

/// Method-specific part of SSH_MSG_USERAUTH_REQUEST.
#[derive(Clone, PartialEq, Eq)]
pub enum AuthMethodData {
    /// Query the allowed methods, or succeed for accounts without auth.
    None,
    /// Password authentication (RFC 4252 Section 8).
    Password {
        /// Current password
        password: String,
        /// Replacement password for a change request
        new_password: Option<String>,
    },
    /// Public key authentication (RFC 4252 Section 7).
    PublicKey {
        /// Algorithm name (e.g., "ssh-ed25519")
        algorithm: String,
        /// Public key blob
        public_key: Bytes,
        /// Signature, absent when only querying acceptability
        signature: Option<Bytes>,
    },
    /// Keyboard-interactive authentication (RFC 4256).
    KeyboardInteractive {
        /// Language tag
        language: String,
        /// Submethod hints
        submethods: String,
    },
    /// Any other method, with its raw method-specific data.
    Other {
        /// Method name
        method: String,
        /// Raw method-specific fields
        data: Bytes,
    },
}

impl AuthMethodData {
    /// Returns the method name.
    pub fn name(&self) -> &str {
        match self {
            AuthMethodData::None => "none",
            AuthMethodData::Password { .. } => "password",
            AuthMethodData::PublicKey { .. } => "publickey",
            AuthMethodData::KeyboardInteractive { .. } => "keyboard-interactive",
            AuthMethodData::Other { method, .. } => method,
        }
    }
}

impl Drop for AuthMethodData {
    fn drop(&mut self) {
        if let AuthMethodData::Password {
            password,
            new_password,
        } = self
        {
            password.zeroize();
            if let Some(p) = new_password {
                p.zeroize();
            }
        }
    }
}

impl std::fmt::Debug for AuthMethodData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthMethodData::None => write!(f, "None"),
            AuthMethodData::Password { new_password, .. } => f
                .debug_struct("Password")
                .field("password", &"[REDACTED]")
                .field("changing", &new_password.is_some())
                .finish(),
            AuthMethodData::PublicKey {
                algorithm,
                signature,
                ..
            } => f
                .debug_struct("PublicKey")
                .field("algorithm", algorithm)
                .field("signed", &signature.is_some())
                .finish(),
            AuthMethodData::KeyboardInteractive { submethods, .. } => f
                .debug_struct("KeyboardInteractive")
                .field("submethods", submethods)
                .finish(),
            AuthMethodData::Other { method, data } => f
                .debug_struct("Other")
                .field("method", method)
                .field("len", &data.len())
                .finish(),
        }
    }
}

/// SSH_MSG_USERAUTH_REQUEST message (RFC 4252 Section 5).
///
/// ```text
/// byte      SSH_MSG_USERAUTH_REQUEST (50)
/// string    user name in ISO-10646 UTF-8 encoding
/// string    service name in US-ASCII
/// string    method name in US-ASCII
/// ....      method specific fields
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserauthRequest {
    /// User name
    pub user: String,
    /// Service to start after authentication
    pub service: String,
    /// Method and its fields
    pub method: AuthMethodData,
}

impl UserauthRequest {
    /// Creates a request for the `ssh-connection` service.
    pub fn new(user: impl Into<String>, method: AuthMethodData) -> Self {
        Self {
            user: user.into(),
            service: CONNECTION_SERVICE.to_string(),
            method,
        }
    }
}

impl MessageBody for UserauthRequest {
    fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_ssh_utf8(&self.user);
        buf.put_ssh_utf8(&self.service);
        buf.put_ssh_utf8(self.method.name());

        match &self.method {
            AuthMethodData::None => {}
            AuthMethodData::Password {
                password,
                new_password,
            } => {
                buf.put_ssh_bool(new_password.is_some());
                buf.put_ssh_utf8(password);
                if let Some(new_password) = new_password {
                    buf.put_ssh_utf8(new_password);
                }
            }
            AuthMethodData::PublicKey {
                algorithm,
                public_key,
                signature,
            } => {
                buf.put_ssh_bool(signature.is_some());
                buf.put_ssh_utf8(algorithm);
                buf.put_ssh_string(public_key);
                if let Some(signature) = signature {
                    buf.put_ssh_string(signature);
                }
            }
            AuthMethodData::KeyboardInteractive {
                language,
                submethods,
            } => {
                buf.put_ssh_utf8(language);
                buf.put_ssh_utf8(submethods);
            }
            AuthMethodData::Other { data, .. } => buf.put_slice(data),
        }
    }

    fn decode_body(r: &mut WireReader) -> ConduitResult<Self> {
        let user = r.read_utf8()?;
        let service = r.read_utf8()?;
        let method_name = r.read_utf8()?;

        let method = match method_name.as_str() {
            "none" => AuthMethodData::None,
            "password" => {
                let changing = r.read_bool()?;
                let password = r.read_utf8()?;
                let new_password = if changing {
                    Some(r.read_utf8()?)
                } else {
                    None
                };
                AuthMethodData::Password {
                    password,
                    new_password,
                }
            }
            "publickey" => {
                let signed = r.read_bool()?;
                let algorithm = r.read_utf8()?;
                let public_key = r.read_string()?;
                let signature = if signed {
                    Some(r.read_string()?)
                } else {
                    None
                };
                AuthMethodData::PublicKey {
                    algorithm,
                    public_key,
                    signature,
                }
            }
            "keyboard-interactive" => AuthMethodData::KeyboardInteractive {
                language: r.read_utf8()?,
                submethods: r.read_utf8()?,
            },
            _ => AuthMethodData::Other {
                method: method_name,
                data: r.read_remaining(),
            },
        };
        r.finish("SSH_MSG_USERAUTH_REQUEST")?;

        Ok(Self {
            user,
            service,
            method,
        })
    }
}

/// SSH_MSG_USERAUTH_FAILURE message (RFC 4252 Section 5.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserauthFailure {
    /// Methods that may productively continue
    pub methods: Vec<String>,
    /// True if the last request succeeded but more methods are required
    pub partial_success: bool,
}

impl MessageBody for UserauthFailure {
    fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_name_list(&self.methods);
        buf.put_ssh_bool(self.partial_success);
    }

    fn decode_body(r: &mut WireReader) -> ConduitResult<Self> {
        let msg = Self {
            methods: r.read_name_list()?,
            partial_success: r.read_bool()?,
        };
        r.finish("SSH_MSG_USERAUTH_FAILURE")?;
        Ok(msg)
    }
}

/// SSH_MSG_USERAUTH_BANNER message (RFC 4252 Section 5.4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserauthBanner {
    /// Banner text
    pub message: String,
    /// Language tag
    pub language: String,
}

impl MessageBody for UserauthBanner {
    fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_ssh_utf8(&self.message);
        buf.put_ssh_utf8(&self.language);
    }

    fn decode_body(r: &mut WireReader) -> ConduitResult<Self> {
        let msg = Self {
            message: r.read_utf8()?,
            language: r.read_utf8()?,
        };
        r.finish("SSH_MSG_USERAUTH_BANNER")?;
        Ok(msg)
    }
}

/// What a strategy knows when choosing its next request.
#[derive(Debug, Clone, Default)]
pub struct AuthContext {
    /// Session identifier (exchange hash of the first key exchange)
    pub session_id: Bytes,
    /// Methods the server listed in its last failure; empty before the first reply
    pub allowed_methods: Vec<String>,
    /// Whether the last failure reported partial success
    pub partial_success: bool,
    /// Number of requests sent so far
    pub attempts: u32,
}

impl AuthContext {
    /// True if the server has not yet restricted `method`.
    pub fn allows(&self, method: &str) -> bool {
        self.allowed_methods.is_empty() || self.allowed_methods.iter().any(|m| m == method)
    }
}

/// Chooses authentication requests and answers method-specific challenges.
#[async_trait]
pub trait AuthStrategy: Send {
    /// Returns the next request to send, or `None` when every method this
    /// strategy knows has been exhausted.
    async fn next_request(&mut self, ctx: &AuthContext) -> ConduitResult<Option<UserauthRequest>>;

    /// Interprets a method-specific message (tags 60-79).
    ///
    /// Returns a message to send in reply, if any. The default rejects the
    /// message as unexpected.
    async fn on_method_message(
        &mut self,
        _ctx: &AuthContext,
        tag: u8,
        _body: Bytes,
    ) -> ConduitResult<Option<Message>> {
        Err(ConduitError::Protocol(format!(
            "unexpected method-specific authentication message {}",
            tag
        )))
    }
}

/// Authenticates with the "none" method only.
#[derive(Debug, Clone)]
pub struct NoneAuth {
    user: String,
    sent: bool,
}

impl NoneAuth {
    /// Creates the strategy for `user`.
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            sent: false,
        }
    }
}

#[async_trait]
impl AuthStrategy for NoneAuth {
    async fn next_request(&mut self, _ctx: &AuthContext) -> ConduitResult<Option<UserauthRequest>> {
        if self.sent {
            return Ok(None);
        }
        self.sent = true;
        Ok(Some(UserauthRequest::new(&self.user, AuthMethodData::None)))
    }
}

/// Authenticates with a password, once.
pub struct PasswordAuth {
    user: String,
    password: Zeroizing<String>,
    sent: bool,
}

impl PasswordAuth {
    /// Creates the strategy for `user`.
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: Zeroizing::new(password.into()),
            sent: false,
        }
    }
}

impl std::fmt::Debug for PasswordAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PasswordAuth")
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

#[async_trait]
impl AuthStrategy for PasswordAuth {
    async fn next_request(&mut self, ctx: &AuthContext) -> ConduitResult<Option<UserauthRequest>> {
        if self.sent || !ctx.allows("password") {
            return Ok(None);
        }
        self.sent = true;
        Ok(Some(UserauthRequest::new(
            &self.user,
            AuthMethodData::Password {
                password: self.password.to_string(),
                new_password: None,
            },
        )))
    }
}
