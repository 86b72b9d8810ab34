use std::fmt;

use sha2::{Digest, Sha256};

use crate::error::{ForgeError, ForgeResult};

/// Namespace used when the caller only supplies a flag.
pub const DEFAULT_NAMESPACE: &str = "ForgeSingleApplication";

// =========================================================================
// Token
// =========================================================================

/// Identifies a single-instance claim: `<namespace>_<flag>`.
///
/// The rendered string is the OS-visible identity of the claim. Two builds of
/// an application only detect each other if they render the same token, so
/// keep the namespace stable across releases.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Token {
    namespace: String,
    flag: String,
}

impl Token {
    /// Creates a token from an explicit namespace and flag.
    pub fn new(namespace: &str, flag: &str) -> ForgeResult<Self> {
        if namespace.is_empty() {
            return Err(ForgeError::InvalidToken("namespace must not be empty".into()));
        }
        if namespace.contains('\0') || flag.contains('\0') {
            return Err(ForgeError::InvalidToken(
                "token must not contain NUL bytes".into(),
            ));
        }
        Ok(Token {
            namespace: namespace.to_owned(),
            flag: flag.to_owned(),
        })
    }

    /// Creates a token under [`DEFAULT_NAMESPACE`].
    pub fn for_application(flag: &str) -> ForgeResult<Self> {
        Token::new(DEFAULT_NAMESPACE, flag)
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn flag(&self) -> &str {
        &self.flag
    }

    /// Derives the OS-level names for this token.
    pub fn segment_key(&self) -> SegmentKey {
        SegmentKey::from_token(self)
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.namespace, self.flag)
    }
}

// =========================================================================
// SegmentKey
// =========================================================================

/// OS-visible names derived from a [`Token`].
///
/// Derivation hashes the rendered token with SHA-256 so it is independent of
/// the token's characters and stable across compiler versions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentKey {
    token: String,
    digest: [u8; 32],
}

impl SegmentKey {
    pub fn from_token(token: &Token) -> Self {
        let rendered = token.to_string();
        let digest: [u8; 32] = Sha256::digest(rendered.as_bytes()).into();
        SegmentKey {
            token: rendered,
            digest,
        }
    }

    /// The rendered token this key was derived from.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// System V IPC key. Never `IPC_PRIVATE` (zero).
    pub fn sysv_key(&self) -> i32 {
        let raw = i32::from_be_bytes([self.digest[0], self.digest[1], self.digest[2], self.digest[3]])
            & 0x7fff_ffff;
        if raw == 0 { 1 } else { raw }
    }

    /// Name for kernel objects (Windows file mappings).
    pub fn object_name(&self) -> String {
        format!("InstanceForge_{}", self.hex())
    }

    /// File name of the advisory lock that serializes probes of this key.
    pub fn lock_file_name(&self) -> String {
        format!("instance_forge_{}.lock", self.hex())
    }

    fn hex(&self) -> String {
        self.digest[..16].iter().map(|b| format!("{:02x}", b)).collect()
    }
}
