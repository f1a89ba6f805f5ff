//! SCRAM-SHA-256 client-side state machine (RFC 5802), used when the proxy
//! authenticates itself against the upstream server in pool mode.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::BytesMut;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::errors::Error;

type HmacSha256 = Hmac<Sha256>;

/// SCRAM exchange state. Drive it with `message()` (client-first), then
/// `update()` for the server-first challenge, then `finish()` for the
/// server-final signature.
pub struct ScramSha256 {
    password: String,
    client_nonce: String,
    client_first_bare: String,
    /// Set after `update()`; needed to verify the server signature.
    server_key: Option<Vec<u8>>,
    auth_message: Option<String>,
}

impl ScramSha256 {
    pub fn new(password: &str) -> Self {
        let mut bytes = [0u8; 24];
        rand::thread_rng().fill_bytes(&mut bytes);
        let client_nonce = BASE64.encode(bytes);
        let client_first_bare = format!("n=,r={client_nonce}");

        ScramSha256 {
            password: password.to_string(),
            client_nonce,
            client_first_bare,
            server_key: None,
            auth_message: None,
        }
    }

    #[cfg(test)]
    fn with_nonce(password: &str, nonce: &str) -> Self {
        ScramSha256 {
            password: password.to_string(),
            client_nonce: nonce.to_string(),
            client_first_bare: format!("n=,r={nonce}"),
            server_key: None,
            auth_message: None,
        }
    }

    /// The client-first-message, with the GS2 header for "no channel binding".
    pub fn message(&self) -> BytesMut {
        BytesMut::from(format!("n,,{}", self.client_first_bare).as_bytes())
    }

    /// Process the server-first-message, returning the client-final-message.
    pub fn update(&mut self, server_first: &[u8]) -> Result<BytesMut, Error> {
        let server_first = String::from_utf8_lossy(server_first).to_string();
        let (server_nonce, salt_base64, iterations) = parse_server_first(&server_first)?;

        if !server_nonce.starts_with(&self.client_nonce) {
            return Err(Error::ScramClientError(
                "server nonce does not start with client nonce".to_string(),
            ));
        }

        let salt = BASE64
            .decode(salt_base64)
            .map_err(|err| Error::ScramClientError(format!("bad salt: {err}")))?;

        let salted_password = hi(self.password.as_bytes(), &salt, iterations);
        let client_key = hmac_sha256(&salted_password, b"Client Key");
        let stored_key = sha256(&client_key);
        let server_key = hmac_sha256(&salted_password, b"Server Key");

        // "biws" is base64("n,,"), the channel-binding input we committed to.
        let client_final_without_proof = format!("c=biws,r={server_nonce}");
        let auth_message = format!(
            "{},{},{}",
            self.client_first_bare, server_first, client_final_without_proof
        );

        let client_signature = hmac_sha256(&stored_key, auth_message.as_bytes());
        let client_proof: Vec<u8> = client_key
            .iter()
            .zip(client_signature.iter())
            .map(|(a, b)| a ^ b)
            .collect();

        self.server_key = Some(server_key);
        self.auth_message = Some(auth_message);

        let client_final = format!(
            "{client_final_without_proof},p={}",
            BASE64.encode(&client_proof)
        );
        Ok(BytesMut::from(client_final.as_bytes()))
    }

    /// Verify the server-final-message signature.
    pub fn finish(&mut self, server_final: &[u8]) -> Result<(), Error> {
        let (server_key, auth_message) = match (&self.server_key, &self.auth_message) {
            (Some(k), Some(m)) => (k, m),
            _ => {
                return Err(Error::ScramClientError(
                    "server-final received before server-first".to_string(),
                ))
            }
        };

        let server_final = String::from_utf8_lossy(server_final).to_string();
        if let Some(err) = server_final.strip_prefix("e=") {
            return Err(Error::ScramClientError(format!("server error: {err}")));
        }

        let expected_signature = hmac_sha256(server_key, auth_message.as_bytes());
        let expected = format!("v={}", BASE64.encode(&expected_signature));
        if server_final != expected {
            return Err(Error::ScramClientError(
                "server signature verification failed".to_string(),
            ));
        }
        Ok(())
    }
}

/// Parse server-first-message: `r=<nonce>,s=<salt>,i=<iterations>`.
fn parse_server_first(msg: &str) -> Result<(&str, &str, u32), Error> {
    let mut nonce = None;
    let mut salt = None;
    let mut iterations = None;

    for part in msg.split(',') {
        if let Some(v) = part.strip_prefix("r=") {
            nonce = Some(v);
        } else if let Some(v) = part.strip_prefix("s=") {
            salt = Some(v);
        } else if let Some(v) = part.strip_prefix("i=") {
            iterations = Some(v.parse::<u32>().map_err(|_| {
                Error::ScramClientError(format!("bad iteration count: {v}"))
            })?);
        }
    }

    Ok((
        nonce.ok_or_else(|| Error::ScramClientError("missing nonce in server-first".into()))?,
        salt.ok_or_else(|| Error::ScramClientError("missing salt in server-first".into()))?,
        iterations
            .ok_or_else(|| Error::ScramClientError("missing iterations in server-first".into()))?,
    ))
}

/// The Hi function from RFC 5802: PBKDF2-HMAC-SHA256.
fn hi(password: &[u8], salt: &[u8], iterations: u32) -> [u8; 32] {
    let mut output = [0u8; 32];
    pbkdf2::pbkdf2_hmac::<Sha256>(password, salt, iterations, &mut output);
    output
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn sha256(data: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_server_first_valid() {
        let (nonce, salt, iterations) =
            parse_server_first("r=clientservernonce,s=c2FsdA==,i=4096").unwrap();
        assert_eq!(nonce, "clientservernonce");
        assert_eq!(salt, "c2FsdA==");
        assert_eq!(iterations, 4096);
    }

    #[test]
    fn parse_server_first_missing_fields() {
        assert!(parse_server_first("s=c2FsdA==,i=4096").is_err());
        assert!(parse_server_first("r=nonce,i=4096").is_err());
        assert!(parse_server_first("r=nonce,s=c2FsdA==").is_err());
        assert!(parse_server_first("r=nonce,s=c2FsdA==,i=notanumber").is_err());
    }

    #[test]
    fn client_first_message_layout() {
        let scram = ScramSha256::with_nonce("pw", "abcdef");
        assert_eq!(scram.message().as_ref(), b"n,,n=,r=abcdef");
    }

    #[test]
    fn rejects_foreign_server_nonce() {
        let mut scram = ScramSha256::with_nonce("pw", "abcdef");
        let result = scram.update(b"r=zzzzzz12345,s=c2FsdA==,i=4096");
        assert!(result.is_err());
    }

    #[test]
    fn finish_before_update_is_an_error() {
        let mut scram = ScramSha256::with_nonce("pw", "abcdef");
        assert!(scram.finish(b"v=anything").is_err());
    }

    #[test]
    fn full_exchange_against_simulated_server() {
        // Simulate the server side with the same primitives and check that
        // the client proof verifies and the server signature round-trips.
        let password = "secret";
        let salt = b"0123456789abcdef";
        let iterations = 4096u32;

        let mut client = ScramSha256::with_nonce(password, "clientnonce");
        let client_first = client.message();
        assert!(client_first.starts_with(b"n,,"));

        let server_nonce = "clientnonceSERVER";
        let server_first = format!("r={server_nonce},s={},i={iterations}", BASE64.encode(salt));
        let client_final = client.update(server_first.as_bytes()).unwrap();
        let client_final = String::from_utf8(client_final.to_vec()).unwrap();
        assert!(client_final.starts_with(&format!("c=biws,r={server_nonce},p=")));

        // Server-side verification of the proof.
        let salted_password = hi(password.as_bytes(), salt, iterations);
        let client_key = hmac_sha256(&salted_password, b"Client Key");
        let stored_key = sha256(&client_key);
        let client_final_without_proof = format!("c=biws,r={server_nonce}");
        let auth_message = format!("n=,r=clientnonce,{server_first},{client_final_without_proof}");
        let client_signature = hmac_sha256(&stored_key, auth_message.as_bytes());

        let proof_base64 = client_final.split(",p=").nth(1).unwrap();
        let proof = BASE64.decode(proof_base64).unwrap();
        let recovered_client_key: Vec<u8> = proof
            .iter()
            .zip(client_signature.iter())
            .map(|(a, b)| a ^ b)
            .collect();
        assert_eq!(sha256(&recovered_client_key), stored_key);

        // Server signature accepted by the client.
        let server_key = hmac_sha256(&salted_password, b"Server Key");
        let server_signature = hmac_sha256(&server_key, auth_message.as_bytes());
        let server_final = format!("v={}", BASE64.encode(&server_signature));
        assert!(client.finish(server_final.as_bytes()).is_ok());

        // A tampered signature is rejected.
        let mut client2 = ScramSha256::with_nonce(password, "clientnonce");
        client2.update(server_first.as_bytes()).unwrap();
        assert!(client2.finish(b"v=Zm9yZ2VyeQ==").is_err());
    }

    #[test]
    fn hi_is_deterministic() {
        assert_eq!(hi(b"password", b"salt", 4096), hi(b"password", b"salt", 4096));
        assert_ne!(hi(b"password", b"salt", 4096), hi(b"password", b"salt", 1));
    }
}
