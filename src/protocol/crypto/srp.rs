//! SRP-6a over the RFC 5054 3072-bit group, as used by pair-setup.
//!
//! The accessory plays the server role: it holds a verifier derived from
//! the setup pincode, publishes `B = k*v + g^b`, and checks the
//! controller's proof before revealing its own. The client half lives here
//! too; the handshake tests drive the server with it.
//!
//! Hash is SHA-512 throughout. `A`/`B` are padded to the 384-byte group
//! size inside `u`, while the proofs hash the values in their transmitted
//! (client `A`) and stripped (server `B`) forms — that asymmetry is part
//! of the deployed protocol and both halves here agree on it.

use num_bigint::{BigUint, RandomBits};
use num_traits::Zero;
use rand::Rng;
use sha2::{Digest, Sha512};
use zeroize::Zeroize;

use super::CryptoError;

/// Group parameters for the SRP exchange
pub struct SrpParams {
    n_hex: &'static str,
    g: u32,
    /// Byte length of the group modulus; public keys are padded to this.
    pub key_len: usize,
}

impl SrpParams {
    /// The RFC 5054 3072-bit group with g = 5
    pub const RFC5054_3072: Self = Self {
        n_hex: "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E08\
                8A67CC74020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B\
                302B0A6DF25F14374FE1356D6D51C245E485B576625E7EC6F44C42E9\
                A637ED6B0BFF5CB6F406B7EDEE386BFB5A899FA5AE9F24117C4B1FE6\
                49286651ECE45B3DC2007CB8A163BF0598DA48361C55D39A69163FA8\
                FD24CF5F83655D23DCA3AD961C62F356208552BB9ED529077096966D\
                670C354E4ABC9804F1746C08CA18217C32905E462E36CE3BE39E772C\
                180E86039B2783A2EC07A28FB5C55DF06F4C52C9DE2BCBF695581718\
                3995497CEA956AE515D2261898FA051015728E5A8AAAC42DAD33170D\
                04507A33A85521ABDF1CBA64ECFB850458DBEF0A8AEA71575D060C7D\
                B3970F85A6E1E4C7ABF5AE8CDB0933D71E8C94E04A25619DCEE3D226\
                1AD2EE6BF12FFA06D98A0864D87602733EC86A64521F2B18177B200C\
                BBE117577A615D6C770988C0BAD946E208E24FA074E5AB3143DB5BFC\
                E0FD108E4B82D120A93AD2CAFFFFFFFFFFFFFFFF",
        g: 5,
        key_len: 384,
    };

    fn n(&self) -> Result<BigUint, CryptoError> {
        BigUint::parse_bytes(self.n_hex.as_bytes(), 16)
            .ok_or_else(|| CryptoError::SrpError("failed to parse group modulus".to_string()))
    }

    fn g(&self) -> BigUint {
        BigUint::from(self.g)
    }
}

fn pad_to(bytes: &[u8], len: usize) -> Vec<u8> {
    if bytes.len() >= len {
        return bytes.to_vec();
    }
    let mut padded = vec![0u8; len];
    padded[len - bytes.len()..].copy_from_slice(bytes);
    padded
}

/// k = H(N | pad(g))
fn multiplier_k(n: &BigUint, g: &BigUint, key_len: usize) -> BigUint {
    let mut hasher = Sha512::new();
    hasher.update(n.to_bytes_be());
    hasher.update(pad_to(&g.to_bytes_be(), key_len));
    BigUint::from_bytes_be(&hasher.finalize())
}

/// x = H(salt | H(username ":" password))
fn private_x(username: &[u8], password: &[u8], salt: &[u8]) -> BigUint {
    let mut inner = Sha512::new();
    inner.update(username);
    inner.update(b":");
    inner.update(password);
    let h_up = inner.finalize();

    let mut outer = Sha512::new();
    outer.update(salt);
    outer.update(h_up);
    BigUint::from_bytes_be(&outer.finalize())
}

/// u = H(pad(A) | pad(B))
fn scrambler_u(a_pub: &[u8], b_pub: &[u8], key_len: usize) -> BigUint {
    let mut hasher = Sha512::new();
    hasher.update(pad_to(a_pub, key_len));
    hasher.update(pad_to(b_pub, key_len));
    BigUint::from_bytes_be(&hasher.finalize())
}

/// M1 = H(H(N) xor H(g) | H(username) | salt | A | B | K)
fn client_proof_m1(
    n: &BigUint,
    g: &BigUint,
    username: &[u8],
    salt: &[u8],
    a_wire: &[u8],
    b_stripped: &[u8],
    session_key: &[u8],
) -> Vec<u8> {
    let hn = Sha512::digest(n.to_bytes_be());
    let hg = Sha512::digest(g.to_bytes_be());
    let mut hn_xor_hg = [0u8; 64];
    for i in 0..64 {
        hn_xor_hg[i] = hn[i] ^ hg[i];
    }

    let mut hasher = Sha512::new();
    hasher.update(hn_xor_hg);
    hasher.update(Sha512::digest(username));
    hasher.update(salt);
    hasher.update(a_wire);
    hasher.update(b_stripped);
    hasher.update(session_key);
    hasher.finalize().to_vec()
}

/// M2 = H(A | M1 | K)
fn server_proof_m2(a_stripped: &[u8], m1: &[u8], session_key: &[u8]) -> Vec<u8> {
    let mut hasher = Sha512::new();
    hasher.update(a_stripped);
    hasher.update(m1);
    hasher.update(session_key);
    hasher.finalize().to_vec()
}

/// The 64-byte shared session key K = H(S); zeroed on drop
pub struct SessionKey {
    key: Vec<u8>,
}

impl SessionKey {
    pub fn as_bytes(&self) -> &[u8] {
        &self.key
    }
}

impl Drop for SessionKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

/// Server (accessory) side of the SRP exchange
pub struct SrpServer {
    n: BigUint,
    g: BigUint,
    v: BigUint,
    b: BigUint,
    public_key: Vec<u8>,
    key_len: usize,
}

impl SrpServer {
    /// Derive the password verifier `v = g^x mod N`
    pub fn compute_verifier(
        username: &[u8],
        password: &[u8],
        salt: &[u8],
        params: &SrpParams,
    ) -> Result<Vec<u8>, CryptoError> {
        let n = params.n()?;
        let g = params.g();
        let x = private_x(username, password, salt);
        Ok(g.modpow(&x, &n).to_bytes_be())
    }

    /// Create a server instance for one pairing attempt.
    ///
    /// Generates a fresh 256-bit ephemeral secret and computes
    /// `B = (k*v + g^b) mod N`.
    pub fn new(verifier: &[u8], params: &SrpParams) -> Result<Self, CryptoError> {
        let n = params.n()?;
        let g = params.g();
        let v = BigUint::from_bytes_be(verifier);
        let k = multiplier_k(&n, &g, params.key_len);

        let mut rng = rand::thread_rng();
        let b: BigUint = rng.sample(RandomBits::new(256));
        let b = b % &n;

        let b_pub = (&k * &v + g.modpow(&b, &n)) % &n;
        let public_key = pad_to(&b_pub.to_bytes_be(), params.key_len);

        Ok(Self {
            n,
            g,
            v,
            b,
            public_key,
            key_len: params.key_len,
        })
    }

    /// The padded public key `B` sent in M2
    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    /// Verify the client's proof M1 and produce the session key and M2.
    ///
    /// `client_public` is the A value exactly as received on the wire —
    /// its transmitted form participates in the proof hash.
    pub fn verify_client(
        &self,
        username: &[u8],
        salt: &[u8],
        client_public: &[u8],
        client_proof: &[u8],
    ) -> Result<(SessionKey, Vec<u8>), CryptoError> {
        let a_pub = BigUint::from_bytes_be(client_public);
        if (&a_pub % &self.n).is_zero() {
            return Err(CryptoError::SrpError("invalid client public key".to_string()));
        }

        let u = scrambler_u(client_public, &self.public_key, self.key_len);

        // S = (A * v^u)^b mod N
        let base = (&a_pub * self.v.modpow(&u, &self.n)) % &self.n;
        let s_shared = base.modpow(&self.b, &self.n);

        let session_key = Sha512::digest(s_shared.to_bytes_be()).to_vec();

        let b_stripped = BigUint::from_bytes_be(&self.public_key).to_bytes_be();
        let expected_m1 = client_proof_m1(
            &self.n,
            &self.g,
            username,
            salt,
            client_public,
            &b_stripped,
            &session_key,
        );

        if expected_m1 != client_proof {
            return Err(CryptoError::SrpError("client proof mismatch".to_string()));
        }

        let m2 = server_proof_m2(&a_pub.to_bytes_be(), client_proof, &session_key);

        Ok((SessionKey { key: session_key }, m2))
    }
}

/// Client (controller) side; the handshake tests use this
pub struct SrpClient {
    n: BigUint,
    g: BigUint,
    k: BigUint,
    a: BigUint,
    public_key: Vec<u8>,
    key_len: usize,
}

impl SrpClient {
    pub fn new(params: &SrpParams) -> Result<Self, CryptoError> {
        let n = params.n()?;
        let g = params.g();
        let k = multiplier_k(&n, &g, params.key_len);

        let mut rng = rand::thread_rng();
        let a: BigUint = rng.sample(RandomBits::new(256));
        let a = a % &n;

        let a_pub = g.modpow(&a, &n);
        let public_key = pad_to(&a_pub.to_bytes_be(), params.key_len);

        Ok(Self {
            n,
            g,
            k,
            a,
            public_key,
            key_len: params.key_len,
        })
    }

    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    /// Process the server challenge (salt, B) and produce the proof M1
    pub fn process_challenge(
        &self,
        username: &[u8],
        password: &[u8],
        salt: &[u8],
        server_public: &[u8],
    ) -> Result<SrpClientVerifier, CryptoError> {
        let b_pub = BigUint::from_bytes_be(server_public);
        if (&b_pub % &self.n).is_zero() {
            return Err(CryptoError::SrpError("invalid server public key".to_string()));
        }

        let u = scrambler_u(&self.public_key, server_public, self.key_len);
        let x = private_x(username, password, salt);

        // S = (B - k * g^x) ^ (a + u * x) mod N; BigUint has no negatives,
        // so the subtraction is lifted by N first.
        let g_x = self.g.modpow(&x, &self.n);
        let k_g_x = (&self.k * g_x) % &self.n;
        let base = if b_pub >= k_g_x {
            (&b_pub - &k_g_x) % &self.n
        } else {
            (&self.n - (&k_g_x - &b_pub) % &self.n) % &self.n
        };

        let exp = &self.a + (&u * x);
        let s_shared = base.modpow(&exp, &self.n);

        let session_key = Sha512::digest(s_shared.to_bytes_be()).to_vec();

        let m1 = client_proof_m1(
            &self.n,
            &self.g,
            username,
            salt,
            &self.public_key,
            &b_pub.to_bytes_be(),
            &session_key,
        );

        Ok(SrpClientVerifier {
            a_pub: BigUint::from_bytes_be(&self.public_key),
            m1,
            session_key,
        })
    }
}

/// Client-side state after the challenge: proof out, server proof check in
pub struct SrpClientVerifier {
    a_pub: BigUint,
    m1: Vec<u8>,
    session_key: Vec<u8>,
}

impl SrpClientVerifier {
    pub fn client_proof(&self) -> &[u8] {
        &self.m1
    }

    pub fn verify_server(&self, server_proof: &[u8]) -> Result<SessionKey, CryptoError> {
        let expected = server_proof_m2(&self.a_pub.to_bytes_be(), &self.m1, &self.session_key);
        if expected != server_proof {
            return Err(CryptoError::SrpError(
                "server proof verification failed".to_string(),
            ));
        }
        Ok(SessionKey {
            key: self.session_key.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const USERNAME: &[u8] = b"Pair-Setup";
    const PASSWORD: &[u8] = b"031-45-154";
    const SALT: &[u8] = &[0x5A; 16];

    #[test]
    fn full_exchange_agrees_on_session_key() {
        let params = SrpParams::RFC5054_3072;
        let verifier = SrpServer::compute_verifier(USERNAME, PASSWORD, SALT, &params).unwrap();
        let server = SrpServer::new(&verifier, &params).unwrap();
        let client = SrpClient::new(&params).unwrap();

        let client_verifier = client
            .process_challenge(USERNAME, PASSWORD, SALT, server.public_key())
            .unwrap();

        let (server_key, m2) = server
            .verify_client(
                USERNAME,
                SALT,
                client.public_key(),
                client_verifier.client_proof(),
            )
            .unwrap();

        let client_key = client_verifier.verify_server(&m2).unwrap();
        assert_eq!(server_key.as_bytes(), client_key.as_bytes());
        assert_eq!(server_key.as_bytes().len(), 64);
    }

    #[test]
    fn wrong_password_is_rejected() {
        let params = SrpParams::RFC5054_3072;
        let verifier = SrpServer::compute_verifier(USERNAME, PASSWORD, SALT, &params).unwrap();
        let server = SrpServer::new(&verifier, &params).unwrap();
        let client = SrpClient::new(&params).unwrap();

        let client_verifier = client
            .process_challenge(USERNAME, b"000-00-000", SALT, server.public_key())
            .unwrap();

        assert!(server
            .verify_client(
                USERNAME,
                SALT,
                client.public_key(),
                client_verifier.client_proof(),
            )
            .is_err());
    }

    #[test]
    fn zero_client_public_key_is_rejected() {
        let params = SrpParams::RFC5054_3072;
        let verifier = SrpServer::compute_verifier(USERNAME, PASSWORD, SALT, &params).unwrap();
        let server = SrpServer::new(&verifier, &params).unwrap();

        let zero = vec![0u8; 384];
        assert!(server.verify_client(USERNAME, SALT, &zero, &[0u8; 64]).is_err());
    }

    #[test]
    fn server_public_key_is_padded_to_group_size() {
        let params = SrpParams::RFC5054_3072;
        let verifier = SrpServer::compute_verifier(USERNAME, PASSWORD, SALT, &params).unwrap();
        let server = SrpServer::new(&verifier, &params).unwrap();
        assert_eq!(server.public_key().len(), 384);
    }
}
