//! SASL mechanisms for the data service handshake.
//!
//! SCRAM (SHA-512/256/1) is the challenge/response family; PLAIN and
//! OAUTHBEARER complete in their initial message. One-shot mechanisms are a
//! separate enum variant that simply has no `step`, so calling one is
//! unrepresentable rather than a runtime error.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use hmac::{Hmac, Mac};
use rand::Rng;
use rand::distributions::Alphanumeric;
use sha1::{Digest, Sha1};
use sha2::{Sha256, Sha512};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SaslError {
    #[error("server offered no supported mechanism (offered: {0})")]
    NoSupportedMechanism(String),
    #[error("malformed server challenge")]
    MalformedChallenge,
    #[error("server nonce does not extend the client nonce")]
    NonceMismatch,
    #[error("server signature verification failed")]
    ServerSignatureMismatch,
    #[error("iteration count out of range")]
    IterationCount,
}

/// Mechanisms in client preference order, strongest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mechanism {
    ScramSha512,
    ScramSha256,
    ScramSha1,
    Plain,
    OauthBearer,
}

impl Mechanism {
    pub fn name(self) -> &'static str {
        match self {
            Mechanism::ScramSha512 => "SCRAM-SHA512",
            Mechanism::ScramSha256 => "SCRAM-SHA256",
            Mechanism::ScramSha1 => "SCRAM-SHA1",
            Mechanism::Plain => "PLAIN",
            Mechanism::OauthBearer => "OAUTHBEARER",
        }
    }
}

/// Pick the strongest mechanism both sides support. `server_list` is the
/// space-separated SASL_LIST_MECHS payload.
pub fn select_mechanism(server_list: &str, oauth_configured: bool) -> Result<Mechanism, SaslError> {
    let offered: Vec<&str> = server_list.split_whitespace().collect();
    let mut preference = Vec::with_capacity(5);
    if oauth_configured {
        preference.push(Mechanism::OauthBearer);
    }
    preference.extend([
        Mechanism::ScramSha512,
        Mechanism::ScramSha256,
        Mechanism::ScramSha1,
        Mechanism::Plain,
    ]);
    preference
        .into_iter()
        .find(|m| offered.contains(&m.name()))
        .ok_or_else(|| SaslError::NoSupportedMechanism(server_list.to_string()))
}

/// A mechanism instance ready to produce its initial message.
pub enum Authenticator {
    /// PLAIN and OAUTHBEARER: the initial message is the whole exchange
    OneShot { mechanism: Mechanism, initial: Vec<u8> },
    /// SCRAM: initial message, one step, then server verification
    Scram { mechanism: Mechanism, client: ScramClient },
}

impl Authenticator {
    pub fn new(mechanism: Mechanism, username: &str, secret: &str) -> Self {
        match mechanism {
            Mechanism::Plain => {
                let mut initial = Vec::with_capacity(username.len() + secret.len() + 2);
                initial.push(0);
                initial.extend_from_slice(username.as_bytes());
                initial.push(0);
                initial.extend_from_slice(secret.as_bytes());
                Authenticator::OneShot { mechanism, initial }
            }
            Mechanism::OauthBearer => {
                let mut initial = b"n,,".to_vec();
                initial.push(0x01);
                initial.extend_from_slice(format!("auth=Bearer {secret}").as_bytes());
                initial.push(0x01);
                initial.push(0x01);
                Authenticator::OneShot { mechanism, initial }
            }
            Mechanism::ScramSha1 | Mechanism::ScramSha256 | Mechanism::ScramSha512 => {
                let digest = match mechanism {
                    Mechanism::ScramSha1 => ScramDigest::Sha1,
                    Mechanism::ScramSha256 => ScramDigest::Sha256,
                    _ => ScramDigest::Sha512,
                };
                Authenticator::Scram {
                    mechanism,
                    client: ScramClient::new(digest, username, secret),
                }
            }
        }
    }

    pub fn mechanism(&self) -> Mechanism {
        match self {
            Authenticator::OneShot { mechanism, .. } => *mechanism,
            Authenticator::Scram { mechanism, .. } => *mechanism,
        }
    }

    /// Payload of the SASL_AUTH request
    pub fn initial(&mut self) -> Vec<u8> {
        match self {
            Authenticator::OneShot { initial, .. } => initial.clone(),
            Authenticator::Scram { client, .. } => client.client_first().into_bytes(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScramDigest {
    Sha1,
    Sha256,
    Sha512,
}

impl ScramDigest {
    fn hmac(self, key: &[u8], data: &[u8]) -> Vec<u8> {
        macro_rules! hmac_bytes {
            ($digest:ty) => {{
                let mut mac =
                    Hmac::<$digest>::new_from_slice(key).expect("hmac accepts any key size");
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }};
        }
        match self {
            ScramDigest::Sha1 => hmac_bytes!(Sha1),
            ScramDigest::Sha256 => hmac_bytes!(Sha256),
            ScramDigest::Sha512 => hmac_bytes!(Sha512),
        }
    }

    fn hash(self, data: &[u8]) -> Vec<u8> {
        match self {
            ScramDigest::Sha1 => Sha1::digest(data).to_vec(),
            ScramDigest::Sha256 => Sha256::digest(data).to_vec(),
            ScramDigest::Sha512 => Sha512::digest(data).to_vec(),
        }
    }

    fn salted_password(self, password: &[u8], salt: &[u8], iterations: u32) -> Vec<u8> {
        let mut out = vec![0u8; self.output_len()];
        let result = match self {
            ScramDigest::Sha1 => pbkdf2::pbkdf2::<Hmac<Sha1>>(password, salt, iterations, &mut out),
            ScramDigest::Sha256 => {
                pbkdf2::pbkdf2::<Hmac<Sha256>>(password, salt, iterations, &mut out)
            }
            ScramDigest::Sha512 => {
                pbkdf2::pbkdf2::<Hmac<Sha512>>(password, salt, iterations, &mut out)
            }
        };
        result.expect("output length is fixed per digest");
        out
    }

    fn output_len(self) -> usize {
        match self {
            ScramDigest::Sha1 => 20,
            ScramDigest::Sha256 => 32,
            ScramDigest::Sha512 => 64,
        }
    }
}

/// SCRAM client state across the two round trips.
pub struct ScramClient {
    digest: ScramDigest,
    username: String,
    password: String,
    client_nonce: String,
    client_first_bare: String,
    expected_server_signature: Option<Vec<u8>>,
}

impl ScramClient {
    fn new(digest: ScramDigest, username: &str, password: &str) -> Self {
        let client_nonce: String =
            rand::thread_rng().sample_iter(&Alphanumeric).take(24).map(char::from).collect();
        Self::with_nonce(digest, username, password, client_nonce)
    }

    fn with_nonce(
        digest: ScramDigest,
        username: &str,
        password: &str,
        client_nonce: String,
    ) -> Self {
        Self {
            digest,
            username: username.to_string(),
            password: password.to_string(),
            client_nonce,
            client_first_bare: String::new(),
            expected_server_signature: None,
        }
    }

    /// `n,,n=<user>,r=<nonce>` with the RFC 5802 gs2 header
    pub fn client_first(&mut self) -> String {
        self.client_first_bare =
            format!("n={},r={}", sasl_escape(&self.username), self.client_nonce);
        format!("n,,{}", self.client_first_bare)
    }

    /// Consume the server's first message and produce the client-final
    /// message carrying the proof.
    pub fn step(&mut self, server_first: &[u8]) -> Result<String, SaslError> {
        let server_first =
            std::str::from_utf8(server_first).map_err(|_| SaslError::MalformedChallenge)?;
        let mut server_nonce = None;
        let mut salt = None;
        let mut iterations = None;
        for part in server_first.split(',') {
            match part.split_once('=') {
                Some(("r", v)) => server_nonce = Some(v.to_string()),
                Some(("s", v)) => {
                    salt = Some(
                        BASE64.decode(v.as_bytes()).map_err(|_| SaslError::MalformedChallenge)?,
                    )
                }
                Some(("i", v)) => {
                    iterations = Some(v.parse::<u32>().map_err(|_| SaslError::MalformedChallenge)?)
                }
                _ => {}
            }
        }
        let (server_nonce, salt, iterations) = match (server_nonce, salt, iterations) {
            (Some(r), Some(s), Some(i)) => (r, s, i),
            _ => return Err(SaslError::MalformedChallenge),
        };
        if !server_nonce.starts_with(&self.client_nonce) {
            return Err(SaslError::NonceMismatch);
        }
        if iterations == 0 || iterations > 10_000_000 {
            return Err(SaslError::IterationCount);
        }

        let salted = self.digest.salted_password(self.password.as_bytes(), &salt, iterations);
        let client_key = self.digest.hmac(&salted, b"Client Key");
        let stored_key = self.digest.hash(&client_key);

        let without_proof = format!("c=biws,r={server_nonce}");
        let auth_message =
            format!("{},{},{}", self.client_first_bare, server_first, without_proof);
        let client_signature = self.digest.hmac(&stored_key, auth_message.as_bytes());
        let proof: Vec<u8> =
            client_key.iter().zip(client_signature.iter()).map(|(k, s)| k ^ s).collect();

        let server_key = self.digest.hmac(&salted, b"Server Key");
        self.expected_server_signature =
            Some(self.digest.hmac(&server_key, auth_message.as_bytes()));

        Ok(format!("{without_proof},p={}", BASE64.encode(proof)))
    }

    /// Check the `v=` signature of the server-final message.
    pub fn verify_server_final(&self, server_final: &[u8]) -> Result<(), SaslError> {
        let text = std::str::from_utf8(server_final).map_err(|_| SaslError::MalformedChallenge)?;
        let signature = text
            .split(',')
            .find_map(|part| part.strip_prefix("v="))
            .ok_or(SaslError::MalformedChallenge)?;
        let signature =
            BASE64.decode(signature.as_bytes()).map_err(|_| SaslError::MalformedChallenge)?;
        match &self.expected_server_signature {
            Some(expected) if *expected == signature => Ok(()),
            _ => Err(SaslError::ServerSignatureMismatch),
        }
    }
}

/// RFC 5802 saslname escaping for the username
fn sasl_escape(name: &str) -> String {
    name.replace('=', "=3D").replace(',', "=2C")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mechanism_selection_prefers_strongest() {
        let offered = "SCRAM-SHA1 SCRAM-SHA256 PLAIN";
        assert_eq!(select_mechanism(offered, false).unwrap(), Mechanism::ScramSha256);
        assert_eq!(select_mechanism("PLAIN", false).unwrap(), Mechanism::Plain);
        assert_eq!(
            select_mechanism("OAUTHBEARER PLAIN", true).unwrap(),
            Mechanism::OauthBearer
        );
        // a configured token does not force the mechanism on servers without it
        assert_eq!(select_mechanism("PLAIN", true).unwrap(), Mechanism::Plain);
        assert!(select_mechanism("CRAM-MD5", false).is_err());
    }

    #[test]
    fn plain_payload_is_nul_separated() {
        let mut auth = Authenticator::new(Mechanism::Plain, "Administrator", "password");
        assert_eq!(auth.initial(), b"\0Administrator\0password");
    }

    #[test]
    fn oauthbearer_is_one_shot_with_framed_token() {
        let mut auth = Authenticator::new(Mechanism::OauthBearer, "ignored", "tok-123");
        let initial = auth.initial();
        assert_eq!(&initial[..3], b"n,,");
        assert_eq!(initial[3], 0x01);
        assert!(initial.ends_with(&[0x01, 0x01]));
        assert_eq!(&initial[4..initial.len() - 2], b"auth=Bearer tok-123");
        assert!(matches!(auth, Authenticator::OneShot { .. }));
    }

    // RFC 5802 §5 example exchange
    #[test]
    fn scram_sha1_reference_exchange() {
        let mut client = ScramClient::with_nonce(
            ScramDigest::Sha1,
            "user",
            "pencil",
            "fyko+d2lbbFgONRv9qkxdawL".into(),
        );
        assert_eq!(client.client_first(), "n,,n=user,r=fyko+d2lbbFgONRv9qkxdawL");
        let client_final = client
            .step(b"r=fyko+d2lbbFgONRv9qkxdawL3rfcNHYJY1ZVvWVs7j,s=QSXCR+Q6sek8bf92,i=4096")
            .unwrap();
        assert_eq!(
            client_final,
            "c=biws,r=fyko+d2lbbFgONRv9qkxdawL3rfcNHYJY1ZVvWVs7j,p=v0X8v3Bz2T0CJGbJQyF0X+HI4Ts="
        );
        client.verify_server_final(b"v=rmF9pqV8S7suAoZWja4dJRkFsKQ=").unwrap();
        assert_eq!(
            client.verify_server_final(b"v=AAAAAAAAAAAAAAAAAAAAAAAAAAA="),
            Err(SaslError::ServerSignatureMismatch)
        );
    }

    // RFC 7677 §3 example exchange
    #[test]
    fn scram_sha256_reference_exchange() {
        let mut client = ScramClient::with_nonce(
            ScramDigest::Sha256,
            "user",
            "pencil",
            "rOprNGfwEbeRWgbNEkqO".into(),
        );
        assert_eq!(client.client_first(), "n,,n=user,r=rOprNGfwEbeRWgbNEkqO");
        let client_final = client
            .step(
                b"r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,s=W22ZaJ0SNY7soEsUEjb6gQ==,i=4096",
            )
            .unwrap();
        assert_eq!(
            client_final,
            "c=biws,r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,p=dHzbZapWIk4jUhN+Ute9ytag9zjfMHgsqmmiz7AndVQ="
        );
        client
            .verify_server_final(b"v=6rriTRBi23WpRR/wtup+mMhUZUn/dB5nLTJRsjl95G4=")
            .unwrap();
    }

    #[test]
    fn scram_rejects_nonce_truncation() {
        let mut client =
            ScramClient::with_nonce(ScramDigest::Sha256, "user", "pencil", "abcdef".into());
        let _ = client.client_first();
        assert_eq!(
            client.step(b"r=wrong,s=QSXCR+Q6sek8bf92,i=4096"),
            Err(SaslError::NonceMismatch)
        );
    }

    #[test]
    fn usernames_escape_rfc5802_specials() {
        assert_eq!(sasl_escape("a=b,c"), "a=3Db=2Cc");
    }
}
