//! Content fingerprints for synthesized audio.
//!
//! A fingerprint is a SHA-256 digest over a block's text and every variant
//! parameter that affects the rendered audio (model, voice, speed, extra
//! model knobs). Two blocks with identical text and variant share a
//! fingerprint, and therefore share one cache entry across users and
//! documents. The digest deliberately excludes user and document identity.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

/// SHA-256 digest identifying one (text, variant) combination.
///
/// Renders as 64 lowercase hex characters, which is also the serde
/// representation and the path segment used by the audio fetch endpoint.
///
/// # Examples
///
/// ```
/// use recital::fingerprint::Fingerprint;
///
/// let a = Fingerprint::compute("Hello", "piper-en", "amy", 1.0, &Default::default());
/// let b = Fingerprint::compute("Hello", "piper-en", "amy", 1.0, &Default::default());
/// let c = Fingerprint::compute("Hello", "piper-en", "ryan", 1.0, &Default::default());
/// assert_eq!(a, b);
/// assert_ne!(a, c);
/// assert_eq!(a.to_string().len(), 64);
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Digests text plus the audio-affecting variant parameters.
    ///
    /// `params` is a sorted map, so the digest is stable regardless of the
    /// order the client supplied the knobs in. Speed is hashed through its
    /// bit pattern to avoid float-formatting drift.
    pub fn compute(
        text: &str,
        model: &str,
        voice: &str,
        speed: f32,
        params: &BTreeMap<String, serde_json::Value>,
    ) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        hasher.update(b"|");
        hasher.update(model.as_bytes());
        hasher.update(b"|");
        hasher.update(voice.as_bytes());
        hasher.update(b"|");
        hasher.update(speed.to_bits().to_le_bytes());
        if !params.is_empty() {
            hasher.update(b"|");
            // BTreeMap iteration is ordered, serde_json output is stable.
            if let Ok(json) = serde_json::to_string(params) {
                hasher.update(json.as_bytes());
            }
        }
        Self(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Parses the 64-char lowercase hex form produced by `Display`.
    pub fn parse_hex(s: &str) -> Option<Self> {
        if s.len() != 64 {
            return None;
        }
        let mut out = [0u8; 32];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let hi = hex_val(chunk[0])?;
            let lo = hex_val(chunk[1])?;
            out[i] = (hi << 4) | lo;
        }
        Some(Self(out))
    }
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({self})")
    }
}

impl FromStr for Fingerprint {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_hex(s).ok_or(())
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Fingerprint::parse_hex(&s)
            .ok_or_else(|| serde::de::Error::custom("expected 64 hex characters"))
    }
}
