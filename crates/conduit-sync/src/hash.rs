//! Content hashing for change detection.
//!
//! Objects are hashed over a canonical JSON encoding (object keys sorted at
//! every depth) so two representations that differ only in key order hash
//! the same. The digest is prefixed with the algorithm name; switching
//! strength therefore invalidates every stored hash and forces one rewrite.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256, Sha512};

/// Digest used for content hashes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashStrength {
    #[default]
    Sha256,
    Sha512,
    /// First 64 bits of SHA-256. Smaller, with a real collision risk on
    /// very large sources.
    Truncated64,
}

impl HashStrength {
    pub fn as_str(&self) -> &'static str {
        match self {
            HashStrength::Sha256 => "sha256",
            HashStrength::Sha512 => "sha512",
            HashStrength::Truncated64 => "truncated64",
        }
    }
}

impl fmt::Display for HashStrength {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HashStrength {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sha256" => Ok(HashStrength::Sha256),
            "sha512" => Ok(HashStrength::Sha512),
            "truncated64" | "short" => Ok(HashStrength::Truncated64),
            other => Err(format!("unknown hash strength '{}'", other)),
        }
    }
}

/// Encode `value` with object keys sorted at every depth.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Hash `value` with the given strength.
pub fn content_hash(value: &Value, strength: HashStrength) -> String {
    let canonical = canonical_json(value);
    let hex = match strength {
        HashStrength::Sha256 => format!("{:x}", Sha256::digest(canonical.as_bytes())),
        HashStrength::Sha512 => format!("{:x}", Sha512::digest(canonical.as_bytes())),
        HashStrength::Truncated64 => {
            let digest = Sha256::digest(canonical.as_bytes());
            digest[..8].iter().map(|b| format!("{:02x}", b)).collect()
        }
    };
    format!("{}:{}", strength.as_str(), hex)
}
