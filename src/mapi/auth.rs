//! MAPI challenge-response login.
//!
//! The server opens every session with a challenge line:
//!
//! ```text
//! salt:server_type:protocol:hash1,hash2,...:endianness[:password_algo]
//! ```
//!
//! and expects a single response line
//! `BIG:<user>:{ALGO}<hash>:<language>:<database>:`.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use sha1::Sha1;
use sha2::{Digest, Sha224, Sha256, Sha384, Sha512};

use super::error::{MapiError, MapiResult};

/// Digest function returning the lowercase hex encoding.
type HexDigest = fn(&[u8]) -> String;

/// Password pre-hash algorithms a v9 server may ask for.
static PASSWORD_DIGESTS: Lazy<HashMap<&'static str, HexDigest>> = Lazy::new(|| {
    let mut table: HashMap<&'static str, HexDigest> = HashMap::new();
    table.insert("MD5", md5_hex);
    table.insert("SHA1", |data| hex::encode(Sha1::digest(data)));
    table.insert("SHA224", |data| hex::encode(Sha224::digest(data)));
    table.insert("SHA256", |data| hex::encode(Sha256::digest(data)));
    table.insert("SHA384", |data| hex::encode(Sha384::digest(data)));
    table.insert("SHA512", |data| hex::encode(Sha512::digest(data)));
    table
});

fn md5_hex(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

/// Protocol versions this client speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolVersion {
    V8,
    V9,
}

/// A parsed server challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge<'a> {
    pub salt: &'a str,
    pub server_type: &'a str,
    pub protocol: ProtocolVersion,
    pub hashes: Vec<&'a str>,
    pub endianness: &'a str,
    /// Password pre-hash algorithm; only present for protocol 9.
    pub password_algo: Option<&'a str>,
}

impl<'a> Challenge<'a> {
    pub fn parse(challenge: &'a str) -> MapiResult<Self> {
        let fields: Vec<&str> = challenge.trim_end_matches(['\n', '\r']).split(':').collect();
        if fields.len() < 5 {
            return Err(MapiError::Protocol(format!(
                "challenge has {} fields, expected at least 5",
                fields.len()
            )));
        }

        let protocol = match fields[2] {
            "8" => ProtocolVersion::V8,
            "9" => ProtocolVersion::V9,
            other => {
                return Err(MapiError::Login(format!(
                    "unsupported protocol version {:?}, only 8 and 9 are spoken",
                    other
                )))
            }
        };

        let password_algo = fields.get(5).copied().filter(|algo| !algo.is_empty());
        if protocol == ProtocolVersion::V9 && password_algo.is_none() {
            return Err(MapiError::Protocol(
                "protocol 9 challenge is missing the password hash algorithm".to_string(),
            ));
        }

        Ok(Self {
            salt: fields[0],
            server_type: fields[1],
            protocol,
            hashes: fields[3].split(',').collect(),
            endianness: fields[4],
            password_algo,
        })
    }

    fn offers(&self, algo: &str) -> bool {
        self.hashes.contains(&algo)
    }
}

/// Build the login line answering `challenge`.
pub fn challenge_response(
    challenge: &str,
    username: &str,
    password: &str,
    language: &str,
    database: &str,
) -> MapiResult<String> {
    let challenge = Challenge::parse(challenge)?;

    let password = match challenge.password_algo {
        Some(algo) if challenge.protocol == ProtocolVersion::V9 => {
            let digest = PASSWORD_DIGESTS.get(algo).ok_or_else(|| {
                MapiError::Login(format!("unsupported password hash algorithm {}", algo))
            })?;
            digest(password.as_bytes())
        }
        _ => password.to_string(),
    };

    let pwhash = hash_password(&challenge, &password)?;
    Ok(format!(
        "BIG:{}:{}:{}:{}:",
        username, pwhash, language, database
    ))
}

/// Salt and hash the password with the strongest algorithm both sides know.
fn hash_password(challenge: &Challenge<'_>, password: &str) -> MapiResult<String> {
    let salted = format!("{}{}", password, challenge.salt);

    if challenge.offers("SHA1") {
        Ok(format!("{{SHA1}}{}", hex::encode(Sha1::digest(salted.as_bytes()))))
    } else if challenge.offers("MD5") {
        Ok(format!("{{MD5}}{}", md5_hex(salted.as_bytes())))
    } else if challenge.offers("crypt") {
        let key: String = salted.chars().take(8).collect();
        let salt_len = challenge.salt.chars().count();
        if salt_len < 2 {
            return Err(MapiError::Protocol(
                "crypt requires a salt of at least 2 characters".to_string(),
            ));
        }
        let crypt_salt: String = challenge.salt.chars().skip(salt_len - 2).collect();
        let hashed = pwhash::unix_crypt::hash_with(crypt_salt.as_str(), key)
            .map_err(|e| MapiError::Login(format!("crypt failed: {}", e)))?;
        Ok(format!("{{crypt}}{}", hashed))
    } else {
        Ok(format!("{{plain}}{}", salted))
    }
}
