//! SASL mechanism negotiation: PLAIN and the SCRAM-SHA family

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use hmac::{Hmac, Mac};
use rand::Rng;
use sha1::{Digest, Sha1};
use sha2::{Sha256, Sha512};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SaslMechanism {
    Plain,
    ScramSha1,
    ScramSha256,
    ScramSha512,
}

impl SaslMechanism {
    pub fn as_str(self) -> &'static str {
        match self {
            SaslMechanism::Plain => "PLAIN",
            SaslMechanism::ScramSha1 => "SCRAM-SHA1",
            SaslMechanism::ScramSha256 => "SCRAM-SHA256",
            SaslMechanism::ScramSha512 => "SCRAM-SHA512",
        }
    }

    pub fn from_str(value: &str) -> Option<SaslMechanism> {
        match value {
            "PLAIN" => Some(SaslMechanism::Plain),
            "SCRAM-SHA1" => Some(SaslMechanism::ScramSha1),
            "SCRAM-SHA256" => Some(SaslMechanism::ScramSha256),
            "SCRAM-SHA512" => Some(SaslMechanism::ScramSha512),
            _ => None,
        }
    }
}

/// Pick a mechanism from the server-advertised list.
///
/// PLAIN is preferred on TLS streams (the channel already protects the
/// password); plaintext streams use the strongest SCRAM the server offers,
/// falling back to PLAIN only when the credentials explicitly allow it. An
/// `allowed` filter from the credentials restricts the candidates further.
pub fn select_mechanism(
    server_mechanisms: &[SaslMechanism],
    tls: bool,
    allowed: Option<&[SaslMechanism]>,
) -> Option<SaslMechanism> {
    let preference = if tls {
        &[
            SaslMechanism::Plain,
            SaslMechanism::ScramSha512,
            SaslMechanism::ScramSha256,
            SaslMechanism::ScramSha1,
        ][..]
    } else {
        &[
            SaslMechanism::ScramSha512,
            SaslMechanism::ScramSha256,
            SaslMechanism::ScramSha1,
            SaslMechanism::Plain,
        ][..]
    };
    preference.iter().copied().find(|mechanism| {
        if !server_mechanisms.contains(mechanism) {
            return false;
        }
        if !allowed.is_none_or(|allowed| allowed.contains(mechanism)) {
            return false;
        }
        // PLAIN over plaintext would leak the password
        if *mechanism == SaslMechanism::Plain && !tls {
            return allowed.is_some_and(|allowed| allowed.contains(&SaslMechanism::Plain));
        }
        true
    })
}

pub fn parse_mechanism_list(payload: &[u8]) -> Vec<SaslMechanism> {
    String::from_utf8_lossy(payload)
        .split_whitespace()
        .filter_map(SaslMechanism::from_str)
        .collect()
}

/// `\0user\0password`, the PLAIN initial response.
pub fn plain_payload(username: &str, password: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(username.len() + password.len() + 2);
    payload.push(0);
    payload.extend_from_slice(username.as_bytes());
    payload.push(0);
    payload.extend_from_slice(password.as_bytes());
    payload
}

pub(crate) fn hmac_digest(mechanism: SaslMechanism, key: &[u8], data: &[u8]) -> Vec<u8> {
    match mechanism {
        SaslMechanism::ScramSha1 => {
            let mut mac = Hmac::<Sha1>::new_from_slice(key).expect("hmac accepts any key length");
            mac.update(data);
            mac.finalize().into_bytes().to_vec()
        }
        SaslMechanism::ScramSha256 => {
            let mut mac = Hmac::<Sha256>::new_from_slice(key).expect("hmac accepts any key length");
            mac.update(data);
            mac.finalize().into_bytes().to_vec()
        }
        SaslMechanism::ScramSha512 => {
            let mut mac = Hmac::<Sha512>::new_from_slice(key).expect("hmac accepts any key length");
            mac.update(data);
            mac.finalize().into_bytes().to_vec()
        }
        SaslMechanism::Plain => unreachable!("PLAIN does not use HMAC"),
    }
}

pub(crate) fn message_digest(mechanism: SaslMechanism, data: &[u8]) -> Vec<u8> {
    match mechanism {
        SaslMechanism::ScramSha1 => Sha1::digest(data).to_vec(),
        SaslMechanism::ScramSha256 => Sha256::digest(data).to_vec(),
        SaslMechanism::ScramSha512 => Sha512::digest(data).to_vec(),
        SaslMechanism::Plain => unreachable!("PLAIN does not use digests"),
    }
}

pub(crate) fn salted_password(
    mechanism: SaslMechanism,
    password: &str,
    salt: &[u8],
    iterations: u32,
) -> Vec<u8> {
    match mechanism {
        SaslMechanism::ScramSha1 => {
            let mut out = vec![0u8; 20];
            pbkdf2::pbkdf2_hmac::<Sha1>(password.as_bytes(), salt, iterations, &mut out);
            out
        }
        SaslMechanism::ScramSha256 => {
            let mut out = vec![0u8; 32];
            pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, iterations, &mut out);
            out
        }
        SaslMechanism::ScramSha512 => {
            let mut out = vec![0u8; 64];
            pbkdf2::pbkdf2_hmac::<Sha512>(password.as_bytes(), salt, iterations, &mut out);
            out
        }
        SaslMechanism::Plain => unreachable!("PLAIN does not salt"),
    }
}

/// Client side of one SCRAM exchange (RFC 5802).
pub struct ScramClient {
    mechanism: SaslMechanism,
    username: String,
    password: String,
    client_nonce: String,
    client_first_bare: String,
    server_signature: Option<Vec<u8>>,
}

impl ScramClient {
    pub fn new(mechanism: SaslMechanism, username: &str, password: &str) -> ScramClient {
        let mut rng = rand::rng();
        let nonce: String = (0..24)
            .map(|_| {
                const ALPHABET: &[u8] =
                    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
                ALPHABET[rng.random_range(0..ALPHABET.len())] as char
            })
            .collect();
        ScramClient::with_nonce(mechanism, username, password, nonce)
    }

    pub(crate) fn with_nonce(
        mechanism: SaslMechanism,
        username: &str,
        password: &str,
        client_nonce: String,
    ) -> ScramClient {
        let client_first_bare = format!("n={},r={}", sasl_escape(username), client_nonce);
        ScramClient {
            mechanism,
            username: username.to_string(),
            password: password.to_string(),
            client_nonce,
            client_first_bare,
            server_signature: None,
        }
    }

    pub fn mechanism(&self) -> SaslMechanism {
        self.mechanism
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// `n,,n=<user>,r=<nonce>` — the SASL_AUTH payload.
    pub fn client_first_message(&self) -> String {
        format!("n,,{}", self.client_first_bare)
    }

    /// Consume the server-first message, producing the SASL_STEP payload.
    pub fn handle_server_first(&mut self, payload: &[u8]) -> Result<String> {
        let message = std::str::from_utf8(payload)
            .map_err(|_| Error::AuthenticationFailure("server-first is not utf-8".into()))?;
        let attributes = parse_attributes(message);
        let server_nonce = attributes
            .get(&'r')
            .ok_or_else(|| Error::AuthenticationFailure("server-first lacks nonce".into()))?;
        if !server_nonce.starts_with(&self.client_nonce) {
            return Err(Error::AuthenticationFailure("server nonce does not extend ours".into()));
        }
        let salt = BASE64
            .decode(
                attributes
                    .get(&'s')
                    .ok_or_else(|| Error::AuthenticationFailure("server-first lacks salt".into()))?,
            )
            .map_err(|_| Error::AuthenticationFailure("salt is not base64".into()))?;
        let iterations: u32 = attributes
            .get(&'i')
            .and_then(|value| value.parse().ok())
            .ok_or_else(|| Error::AuthenticationFailure("server-first lacks iterations".into()))?;

        let salted = salted_password(self.mechanism, &self.password, &salt, iterations);
        let client_key = hmac_digest(self.mechanism, &salted, b"Client Key");
        let stored_key = message_digest(self.mechanism, &client_key);

        let without_proof = format!("c=biws,r={server_nonce}");
        let auth_message =
            format!("{},{},{}", self.client_first_bare, message, without_proof);

        let client_signature = hmac_digest(self.mechanism, &stored_key, auth_message.as_bytes());
        let proof: Vec<u8> = client_key
            .iter()
            .zip(client_signature.iter())
            .map(|(key, sig)| key ^ sig)
            .collect();

        let server_key = hmac_digest(self.mechanism, &salted, b"Server Key");
        self.server_signature =
            Some(hmac_digest(self.mechanism, &server_key, auth_message.as_bytes()));

        Ok(format!("{},p={}", without_proof, BASE64.encode(proof)))
    }

    /// Validate the server-final message against the expected signature.
    pub fn verify_server_final(&self, payload: &[u8]) -> Result<()> {
        let message = std::str::from_utf8(payload)
            .map_err(|_| Error::AuthenticationFailure("server-final is not utf-8".into()))?;
        let attributes = parse_attributes(message);
        if let Some(error) = attributes.get(&'e') {
            return Err(Error::AuthenticationFailure(format!("server rejected SCRAM: {error}")));
        }
        let verifier = attributes
            .get(&'v')
            .ok_or_else(|| Error::AuthenticationFailure("server-final lacks verifier".into()))?;
        let expected = self
            .server_signature
            .as_ref()
            .ok_or_else(|| Error::AuthenticationFailure("SCRAM exchange out of order".into()))?;
        if BASE64.encode(expected) != *verifier {
            return Err(Error::AuthenticationFailure("server signature mismatch".into()));
        }
        Ok(())
    }
}

pub(crate) fn parse_attributes(message: &str) -> std::collections::HashMap<char, String> {
    message
        .split(',')
        .filter_map(|part| {
            let mut chars = part.chars();
            let key = chars.next()?;
            if chars.next()? != '=' {
                return None;
            }
            Some((key, part[2..].to_string()))
        })
        .collect()
}

fn sasl_escape(value: &str) -> String {
    value.replace('=', "=3D").replace(',', "=2C")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_payload_layout() {
        assert_eq!(plain_payload("user", "pass"), b"\0user\0pass");
    }

    #[test]
    fn selection_prefers_plain_only_on_tls() {
        let offered = [SaslMechanism::Plain, SaslMechanism::ScramSha256];
        assert_eq!(select_mechanism(&offered, true, None), Some(SaslMechanism::Plain));
        assert_eq!(select_mechanism(&offered, false, None), Some(SaslMechanism::ScramSha256));
    }

    #[test]
    fn selection_honors_credentials_filter() {
        let offered = [SaslMechanism::Plain, SaslMechanism::ScramSha256, SaslMechanism::ScramSha512];
        let allowed = [SaslMechanism::ScramSha256];
        assert_eq!(
            select_mechanism(&offered, true, Some(&allowed)),
            Some(SaslMechanism::ScramSha256)
        );
        assert_eq!(select_mechanism(&[SaslMechanism::Plain], false, None), None);
        // explicit opt-in makes PLAIN acceptable even without TLS
        let plain_only = [SaslMechanism::Plain];
        assert_eq!(
            select_mechanism(&[SaslMechanism::Plain], false, Some(&plain_only)),
            Some(SaslMechanism::Plain)
        );
    }

    #[test]
    fn parses_server_mechanism_list() {
        let list = parse_mechanism_list(b"SCRAM-SHA512 SCRAM-SHA256 SCRAM-SHA1 PLAIN");
        assert_eq!(list.len(), 4);
        assert_eq!(list[0], SaslMechanism::ScramSha512);
    }

    // RFC 5802 §5 example exchange
    #[test]
    fn scram_sha1_reference_vector() {
        let mut client = ScramClient::with_nonce(
            SaslMechanism::ScramSha1,
            "user",
            "pencil",
            "fyko+d2lbbFgONRv9qkxdawL".to_string(),
        );
        assert_eq!(client.client_first_message(), "n,,n=user,r=fyko+d2lbbFgONRv9qkxdawL");

        let server_first =
            b"r=fyko+d2lbbFgONRv9qkxdawL3rfcNHYJY1ZVvWVs7j,s=QSXCR+Q6sek8bf92,i=4096";
        let client_final = client.handle_server_first(server_first).unwrap();
        assert_eq!(
            client_final,
            "c=biws,r=fyko+d2lbbFgONRv9qkxdawL3rfcNHYJY1ZVvWVs7j,p=v0X8v3Bz2T0CJGbJQyF0X+HI4Ts="
        );

        client.verify_server_final(b"v=rmF9pqV8S7suAoZWja4dJRkFsKQ=").unwrap();
        assert!(client.verify_server_final(b"v=AAAAAAAAAAAAAAAAAAAAAAAAAAA=").is_err());
    }

    #[test]
    fn scram_rejects_tampered_nonce() {
        let mut client = ScramClient::with_nonce(
            SaslMechanism::ScramSha256,
            "user",
            "pencil",
            "clientnonce".to_string(),
        );
        let err = client
            .handle_server_first(b"r=othernonce123,s=QSXCR+Q6sek8bf92,i=4096")
            .unwrap_err();
        assert!(matches!(err, Error::AuthenticationFailure(_)));
    }
}
