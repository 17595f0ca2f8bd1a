//! SCRAM-SHA-256 client exchange (RFC 5802, RFC 7677) without channel binding.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::{Digest, Sha256};
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

pub const MECHANISM: &str = "SCRAM-SHA-256";

/// GS2 header for "client does not support channel binding", base64-encoded.
const GS2_HEADER_B64: &str = "biws";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScramError {
    #[error("malformed server message: {0}")]
    Malformed(&'static str),
    #[error("server nonce does not extend the client nonce")]
    NonceMismatch,
    #[error("server signature does not match")]
    BadServerSignature,
    #[error("server reported error: {0}")]
    Server(String),
    #[error("SCRAM exchange used out of order")]
    OutOfOrder,
}

enum Stage {
    Initial,
    AwaitingFinal {
        salted_password: [u8; 32],
        auth_message: String,
    },
    Done,
}

/// Client side of one SCRAM-SHA-256 exchange.
pub struct ScramSha256 {
    password: String,
    client_nonce: String,
    stage: Stage,
}

impl ScramSha256 {
    pub fn new(password: &str) -> Self {
        let nonce: [u8; 18] = rand::thread_rng().gen();
        Self::with_nonce(password, BASE64.encode(nonce))
    }

    fn with_nonce(password: &str, client_nonce: String) -> Self {
        Self {
            password: password.to_string(),
            client_nonce,
            stage: Stage::Initial,
        }
    }

    // The server takes the user name from the startup packet, so the SCRAM
    // user name is left empty.
    fn client_first_bare(&self) -> String {
        format!("n=,r={}", self.client_nonce)
    }

    pub fn client_first(&self) -> Vec<u8> {
        format!("n,,{}", self.client_first_bare()).into_bytes()
    }

    /// Consume `server-first-message`, returning `client-final-message`.
    pub fn client_final(&mut self, server_first: &[u8]) -> Result<Vec<u8>, ScramError> {
        if !matches!(self.stage, Stage::Initial) {
            return Err(ScramError::OutOfOrder);
        }
        let server_first =
            std::str::from_utf8(server_first).map_err(|_| ScramError::Malformed("not UTF-8"))?;

        let mut nonce = None;
        let mut salt = None;
        let mut iterations = None;
        for attr in server_first.split(',') {
            match attr.split_once('=') {
                Some(("r", v)) => nonce = Some(v),
                Some(("s", v)) => {
                    salt = Some(
                        BASE64
                            .decode(v)
                            .map_err(|_| ScramError::Malformed("salt is not base64"))?,
                    )
                }
                Some(("i", v)) => {
                    iterations = Some(
                        v.parse::<u32>()
                            .map_err(|_| ScramError::Malformed("bad iteration count"))?,
                    )
                }
                _ => {}
            }
        }
        let nonce = nonce.ok_or(ScramError::Malformed("missing nonce"))?;
        let salt = salt.ok_or(ScramError::Malformed("missing salt"))?;
        let iterations = iterations.ok_or(ScramError::Malformed("missing iteration count"))?;
        if !nonce.starts_with(&self.client_nonce) || nonce.len() == self.client_nonce.len() {
            return Err(ScramError::NonceMismatch);
        }

        let mut salted_password = [0u8; 32];
        pbkdf2::pbkdf2::<HmacSha256>(
            self.password.as_bytes(),
            &salt,
            iterations,
            &mut salted_password,
        )
        .map_err(|_| ScramError::Malformed("invalid key derivation parameters"))?;

        let without_proof = format!("c={},r={}", GS2_HEADER_B64, nonce);
        let auth_message = format!(
            "{},{},{}",
            self.client_first_bare(),
            server_first,
            without_proof
        );

        let client_key = hmac(&salted_password, b"Client Key")?;
        let stored_key: [u8; 32] = Sha256::digest(client_key).into();
        let signature = hmac(&stored_key, auth_message.as_bytes())?;
        let proof: Vec<u8> = client_key
            .iter()
            .zip(signature.iter())
            .map(|(k, s)| k ^ s)
            .collect();

        self.stage = Stage::AwaitingFinal {
            salted_password,
            auth_message,
        };
        Ok(format!("{},p={}", without_proof, BASE64.encode(proof)).into_bytes())
    }

    /// Check `server-final-message`.
    pub fn verify(&mut self, server_final: &[u8]) -> Result<(), ScramError> {
        let Stage::AwaitingFinal {
            salted_password,
            auth_message,
        } = &self.stage
        else {
            return Err(ScramError::OutOfOrder);
        };
        let server_final =
            std::str::from_utf8(server_final).map_err(|_| ScramError::Malformed("not UTF-8"))?;
        if let Some(err) = server_final.strip_prefix("e=") {
            return Err(ScramError::Server(err.to_string()));
        }
        let verifier = server_final
            .split(',')
            .find_map(|attr| attr.strip_prefix("v="))
            .ok_or(ScramError::Malformed("missing verifier"))?;
        let verifier = BASE64
            .decode(verifier)
            .map_err(|_| ScramError::Malformed("verifier is not base64"))?;

        let server_key = hmac(salted_password, b"Server Key")?;
        let expected = hmac(&server_key, auth_message.as_bytes())?;
        if verifier != expected {
            return Err(ScramError::BadServerSignature);
        }
        self.stage = Stage::Done;
        Ok(())
    }
}

fn hmac(key: &[u8], data: &[u8]) -> Result<[u8; 32], ScramError> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|_| ScramError::Malformed("invalid HMAC key"))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}

#[cfg(test)]
mod tests {
    use super::*;

    // Exchange from RFC 7677 section 3 (user name omitted as PostgreSQL does).
    const CLIENT_NONCE: &str = "rOprNGfwEbeRWgbNEkqO";
    const SERVER_FIRST: &str = "r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,s=W22ZaJ0SNY7soEsUEjb6gQ==,i=4096";

    #[test]
    fn test_client_first_message() {
        let scram = ScramSha256::with_nonce("pencil", CLIENT_NONCE.to_string());
        assert_eq!(scram.client_first(), b"n,,n=,r=rOprNGfwEbeRWgbNEkqO".to_vec());
    }

    #[test]
    fn test_full_exchange_verifies_server() {
        let mut scram = ScramSha256::with_nonce("pencil", CLIENT_NONCE.to_string());
        let client_final = scram.client_final(SERVER_FIRST.as_bytes()).unwrap();
        let client_final = String::from_utf8(client_final).unwrap();
        assert!(client_final.starts_with("c=biws,r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,p="));

        // compute the server signature the way a server would
        let Stage::AwaitingFinal {
            salted_password,
            auth_message,
        } = &scram.stage
        else {
            panic!("exchange should be awaiting the final message");
        };
        let server_key = hmac(salted_password, b"Server Key").unwrap();
        let signature = hmac(&server_key, auth_message.as_bytes()).unwrap();
        let server_final = format!("v={}", BASE64.encode(signature));

        scram.verify(server_final.as_bytes()).unwrap();
        assert_eq!(scram.verify(server_final.as_bytes()), Err(ScramError::OutOfOrder));
    }

    #[test]
    fn test_rejects_foreign_nonce() {
        let mut scram = ScramSha256::with_nonce("pencil", CLIENT_NONCE.to_string());
        let err = scram
            .client_final(b"r=somethingelse,s=W22ZaJ0SNY7soEsUEjb6gQ==,i=4096")
            .unwrap_err();
        assert_eq!(err, ScramError::NonceMismatch);
    }

    #[test]
    fn test_bad_server_signature() {
        let mut scram = ScramSha256::with_nonce("pencil", CLIENT_NONCE.to_string());
        scram.client_final(SERVER_FIRST.as_bytes()).unwrap();
        let err = scram.verify(b"v=AAAA").unwrap_err();
        assert_eq!(err, ScramError::BadServerSignature);
        assert!(matches!(
            scram.verify(b"e=invalid-proof"),
            Err(ScramError::Server(_))
        ));
    }
}
