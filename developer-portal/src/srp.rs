// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! SRP-6a client for Apple's identity service.
//!
//! Apple's `signin/init` + `signin/complete` exchange is standard SRP-6a
//! over the RFC 5054 2048-bit group with SHA-256, with one twist: the
//! password is not used directly. It is first hashed with SHA-256 and then
//! stretched with PBKDF2-HMAC-SHA256 using the server-provided salt and
//! iteration count (protocol `s2k`). Protocol `s2k_fo` hex-encodes the
//! SHA-256 digest before stretching.

use {
    hmac::Hmac,
    num_bigint::BigUint,
    num_traits::Zero,
    rand::RngCore,
    sha2::{Digest, Sha256},
};

/// RFC 5054 2048-bit group prime, big-endian.
const GROUP_N: &str = "\
AC6BDB41324A9A9BF166DE5E1389582FAF72B6651987EE07FC3192943DB56050\
A37329CBB4A099ED8193E0757767A13DD52312AB4B03310DCD7F48A9DA04FD50\
E8083969EDB767B0CF6095179A163AB3661A05FBD5FAAAE82918A9962F0B93B8\
55F97993EC975EEAA80D740ADBF4FF747359D041D5C33EA71D281E446B14773B\
CA97B43A23FB801676BD207A436C6481F1D2B9078717461A5B9D32E688F87748\
544523B524B0D57D5EA77A2775D2ECFA032CFBDBF52FB3786160279004E57AE6\
AF874E7303CE53299CCC041C7BC308D82A5698F3A8D0C38271AE35F8E9DBFBB6\
94B5C803D89F7AE435DE236D525F54759B65E372FCD68EF20FA7111F9E4AFF73";

const GROUP_G: u32 = 2;

/// Key length of the stretched password, in bytes.
const S2K_KEY_LENGTH: usize = 32;

/// How the server asked for the password to be stretched.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SrpProtocol {
    S2k,
    S2kFo,
}

impl SrpProtocol {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "s2k" => Some(Self::S2k),
            "s2k_fo" => Some(Self::S2kFo),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SrpError {
    #[error("server ephemeral key is invalid (B mod N == 0)")]
    InvalidServerKey,
    #[error("scrambling parameter is zero")]
    DegenerateScrambling,
}

/// Client evidence produced by a completed SRP exchange.
#[derive(Debug)]
pub struct SrpEvidence {
    /// M1, sent to the server in `signin/complete`.
    pub m1: Vec<u8>,
    /// Expected server proof H(A | M1 | K).
    pub m2: Vec<u8>,
}

/// One SRP-6a exchange. Single use: the ephemeral secret is consumed
/// when the challenge is processed.
pub struct SrpClient {
    secret: BigUint,
    public: BigUint,
    n: BigUint,
    g: BigUint,
}

impl SrpClient {
    pub fn new() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self::with_secret(&bytes)
    }

    /// Construct with a fixed ephemeral secret. Tests only need
    /// determinism; production paths go through [SrpClient::new].
    pub fn with_secret(secret: &[u8]) -> Self {
        let n = BigUint::parse_bytes(GROUP_N.as_bytes(), 16)
            .expect("group prime constant parses");
        let g = BigUint::from(GROUP_G);
        let secret = BigUint::from_bytes_be(secret);
        let public = g.modpow(&secret, &n);

        Self {
            secret,
            public,
            n,
            g,
        }
    }

    /// The client ephemeral public key `A`, big-endian.
    pub fn public_key(&self) -> Vec<u8> {
        self.public.to_bytes_be()
    }

    /// Complete the exchange against the server challenge.
    ///
    /// `account_name` participates in M1 (Apple keeps the username in the
    /// evidence even though it is excluded from `x`).
    pub fn process_challenge(
        &self,
        account_name: &str,
        password: &str,
        protocol: SrpProtocol,
        salt: &[u8],
        iterations: u32,
        server_public: &[u8],
    ) -> Result<SrpEvidence, SrpError> {
        let b_pub = BigUint::from_bytes_be(server_public);
        if (&b_pub % &self.n).is_zero() {
            return Err(SrpError::InvalidServerKey);
        }

        let pad_len = (self.n.bits() as usize + 7) / 8;

        let u = BigUint::from_bytes_be(&sha256_cat(&[
            &pad(&self.public, pad_len),
            &pad(&b_pub, pad_len),
        ]));
        if u.is_zero() {
            return Err(SrpError::DegenerateScrambling);
        }

        let stretched = stretch_password(password, protocol, salt, iterations);

        // x = H(salt | H(":" | stretched)); the username is excluded.
        let inner = sha256_cat(&[b":", &stretched]);
        let x = BigUint::from_bytes_be(&sha256_cat(&[salt, &inner]));

        let k = BigUint::from_bytes_be(&sha256_cat(&[
            &self.n.to_bytes_be(),
            &pad(&self.g, pad_len),
        ]));

        // S = (B - k * g^x) ^ (a + u * x) mod N
        let v = self.g.modpow(&x, &self.n);
        let base = (&b_pub + &self.n - (&k * &v) % &self.n) % &self.n;
        let exponent = &self.secret + &u * &x;
        let session = base.modpow(&exponent, &self.n);
        let key = sha256_cat(&[&session.to_bytes_be()]);

        let hn = sha256_cat(&[&self.n.to_bytes_be()]);
        let hg = sha256_cat(&[&pad(&self.g, pad_len)]);
        let hash_xor: Vec<u8> = hn.iter().zip(hg.iter()).map(|(a, b)| a ^ b).collect();
        let hi = sha256_cat(&[account_name.as_bytes()]);

        let a_bytes = self.public.to_bytes_be();
        let b_bytes = b_pub.to_bytes_be();

        let m1 = sha256_cat(&[&hash_xor, &hi, salt, &a_bytes, &b_bytes, &key]);
        let m2 = sha256_cat(&[&a_bytes, &m1, &key]);

        Ok(SrpEvidence { m1, m2 })
    }
}

impl Default for SrpClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Apple's s2k/s2k_fo password stretch.
fn stretch_password(
    password: &str,
    protocol: SrpProtocol,
    salt: &[u8],
    iterations: u32,
) -> Vec<u8> {
    let digest = Sha256::digest(password.as_bytes());

    let key_material = match protocol {
        SrpProtocol::S2k => digest.to_vec(),
        SrpProtocol::S2kFo => hex::encode(digest).into_bytes(),
    };

    let mut out = vec![0u8; S2K_KEY_LENGTH];
    pbkdf2::pbkdf2::<Hmac<Sha256>>(&key_material, salt, iterations, &mut out)
        .expect("output length is valid for HMAC-SHA256");
    out
}

fn sha256_cat(parts: &[&[u8]]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().to_vec()
}

fn pad(value: &BigUint, len: usize) -> Vec<u8> {
    let bytes = value.to_bytes_be();
    let mut out = vec![0u8; len.saturating_sub(bytes.len())];
    out.extend_from_slice(&bytes);
    out
}
