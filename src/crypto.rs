/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Cryptographic primitives: recoverable ECDSA over secp256k1, the threshold (BLS) aggregate
//! signature scheme used for quorum certificates, and the two hash functions of the protocol.
//!
//! Block signing hashes, block IDs and vote message hashes are Blake2b-256. Addresses and
//! committee commit keys are Keccak-256, so that addresses stay compatible with the EVM-style
//! execution layer this crate is embedded next to.

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use blst::min_pk::{AggregateSignature, PublicKey as BlstPublicKey, SecretKey as BlstSecretKey, Signature as BlstSignature};
use blst::BLST_ERROR;
use k256::ecdsa::{RecoveryId, Signature as EcdsaSignature, SigningKey, VerifyingKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use sha3::Keccak256;

use crate::types::basic::{
    Address, Bytes32, PubKeyBytes, SignatureBytes, ThresholdPubKeyBytes, ThresholdSigBytes,
};

type Blake2b256 = Blake2b<U32>;

/// Domain separation tag for threshold signatures over vote message hashes.
const THRESHOLD_DST: &[u8] = b"BLS_SIG_BLS12381G2_XMD:SHA-256_SSWU_RO_KFBFT_VOTE_";

/// Errors returned by the fallible routines in this module.
///
/// Every variant except [`CryptoError::WrongSigner`] means the input bytes could not even be
/// interpreted; `WrongSigner` means they could, but the recovered identity was not the expected
/// one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Key or signature bytes do not parse as a point or scalar.
    Malformed,
    /// The signature does not verify over the given message hash.
    InvalidSig,
    /// The signature verifies, but was produced by a different key than expected.
    WrongSigner,
}

/// A secp256k1 keypair used to sign block headers and consensus message headers.
#[derive(Clone)]
pub struct EcdsaKeypair(SigningKey);

impl EcdsaKeypair {
    pub fn new(signing_key: SigningKey) -> EcdsaKeypair {
        EcdsaKeypair(signing_key)
    }

    /// Generate a fresh keypair from the operating system's entropy source.
    pub fn generate() -> EcdsaKeypair {
        EcdsaKeypair(SigningKey::random(&mut rand_core::OsRng))
    }

    pub fn from_bytes(bytes: &[u8; 32]) -> Result<EcdsaKeypair, CryptoError> {
        SigningKey::from_bytes(bytes.into())
            .map(EcdsaKeypair)
            .map_err(|_| CryptoError::Malformed)
    }

    /// Sign a 32-byte message hash, producing a recoverable `r || s || v` signature.
    pub fn sign(&self, msg_hash: &Bytes32) -> SignatureBytes {
        // Safety: signing a 32-byte prehash with a valid secp256k1 key cannot fail.
        let (sig, recovery_id) = self
            .0
            .sign_prehash_recoverable(&msg_hash.bytes())
            .expect("prehash signing with a valid key");
        let mut bytes = [0u8; 65];
        bytes[0..64].copy_from_slice(&sig.to_bytes());
        bytes[64] = recovery_id.to_byte();
        SignatureBytes::new(bytes)
    }

    /// The compressed public key of this keypair.
    pub fn public(&self) -> PubKeyBytes {
        let point = self.0.verifying_key().to_encoded_point(true);
        let mut bytes = [0u8; 33];
        bytes.copy_from_slice(point.as_bytes());
        PubKeyBytes::new(bytes)
    }

    /// The address of this keypair's public key.
    pub fn address(&self) -> Address {
        address_of(&self.public())
    }
}

/// Recover the compressed public key that produced `sig` over `msg_hash`.
pub fn recover(msg_hash: &Bytes32, sig: &SignatureBytes) -> Result<PubKeyBytes, CryptoError> {
    let bytes = sig.bytes();
    let signature =
        EcdsaSignature::from_slice(&bytes[0..64]).map_err(|_| CryptoError::Malformed)?;
    let recovery_id = RecoveryId::from_byte(bytes[64]).ok_or(CryptoError::Malformed)?;
    let verifying_key =
        VerifyingKey::recover_from_prehash(&msg_hash.bytes(), &signature, recovery_id)
            .map_err(|_| CryptoError::Malformed)?;
    let point = verifying_key.to_encoded_point(true);
    let mut out = [0u8; 33];
    out.copy_from_slice(point.as_bytes());
    Ok(PubKeyBytes::new(out))
}

/// Check that `sig` over `msg_hash` was produced by `expected`.
pub fn verify_signer(
    msg_hash: &Bytes32,
    sig: &SignatureBytes,
    expected: &PubKeyBytes,
) -> Result<(), CryptoError> {
    let signer = recover(msg_hash, sig)?;
    if &signer == expected {
        Ok(())
    } else {
        Err(CryptoError::WrongSigner)
    }
}

/// Derive the 20-byte address of a compressed secp256k1 public key:
/// `keccak256(uncompressed_pubkey)[12..32]`.
pub fn address_of(pubkey: &PubKeyBytes) -> Address {
    let uncompressed = match VerifyingKey::from_sec1_bytes(&pubkey.bytes()) {
        Ok(vk) => {
            let point = vk.to_encoded_point(false);
            // Skip the 0x04 SEC1 prefix.
            point.as_bytes()[1..65].to_vec()
        }
        // A pubkey that does not parse still maps to an address so that lookups on malformed
        // input stay total; nothing verifies against it.
        Err(_) => pubkey.bytes().to_vec(),
    };
    let digest = keccak256(&[&uncompressed]);
    let mut addr = [0u8; 20];
    addr.copy_from_slice(&digest.bytes()[12..32]);
    Address::new(addr)
}

/// A BLS keypair used to produce the threshold partial signatures aggregated into quorum
/// certificates.
pub struct ThresholdKeypair(BlstSecretKey);

impl Clone for ThresholdKeypair {
    fn clone(&self) -> Self {
        // Safety: serializing and re-parsing a valid secret key cannot fail.
        ThresholdKeypair(
            BlstSecretKey::from_bytes(&self.0.to_bytes()).expect("valid secret key bytes"),
        )
    }
}

impl ThresholdKeypair {
    /// Derive a keypair from at least 32 bytes of input keying material.
    pub fn from_seed(ikm: &[u8]) -> Result<ThresholdKeypair, CryptoError> {
        BlstSecretKey::key_gen(ikm, &[])
            .map(ThresholdKeypair)
            .map_err(|_| CryptoError::Malformed)
    }

    /// Sign `msg_hash`, producing a partial signature to be aggregated by the next proposer.
    pub fn sign(&self, msg_hash: &Bytes32) -> ThresholdSigBytes {
        let sig = self.0.sign(&msg_hash.bytes(), THRESHOLD_DST, &[]);
        ThresholdSigBytes::new(sig.to_bytes())
    }

    /// The compressed public key of this keypair.
    pub fn public(&self) -> ThresholdPubKeyBytes {
        ThresholdPubKeyBytes::new(self.0.sk_to_pk().to_bytes())
    }
}

/// Aggregate the given partial signatures into a single threshold signature.
///
/// Fails with [`CryptoError::Malformed`] if the list is empty or any partial does not decode as a
/// canonical G2 point.
pub fn threshold_aggregate(
    partials: &[ThresholdSigBytes],
) -> Result<ThresholdSigBytes, CryptoError> {
    if partials.is_empty() {
        return Err(CryptoError::Malformed);
    }
    let sigs: Result<Vec<BlstSignature>, CryptoError> = partials
        .iter()
        .map(|p| BlstSignature::from_bytes(&p.bytes()).map_err(|_| CryptoError::Malformed))
        .collect();
    let sigs = sigs?;
    let sig_refs: Vec<&BlstSignature> = sigs.iter().collect();
    let agg = AggregateSignature::aggregate(&sig_refs, true).map_err(|_| CryptoError::Malformed)?;
    Ok(ThresholdSigBytes::new(agg.to_signature().to_bytes()))
}

/// Verify an aggregated threshold signature over `msg_hash` against the public keys of the voters
/// whose partials are claimed to be inside it.
pub fn threshold_verify(
    agg: &ThresholdSigBytes,
    pubkeys: &[ThresholdPubKeyBytes],
    msg_hash: &Bytes32,
) -> bool {
    if pubkeys.is_empty() {
        return false;
    }
    let sig = match BlstSignature::from_bytes(&agg.bytes()) {
        Ok(sig) => sig,
        Err(_) => return false,
    };
    let keys: Result<Vec<BlstPublicKey>, ()> = pubkeys
        .iter()
        .map(|pk| BlstPublicKey::from_bytes(&pk.bytes()).map_err(|_| ()))
        .collect();
    let keys = match keys {
        Ok(keys) => keys,
        Err(()) => return false,
    };
    let key_refs: Vec<&BlstPublicKey> = keys.iter().collect();
    sig.fast_aggregate_verify(true, &msg_hash.bytes(), THRESHOLD_DST, &key_refs)
        == BLST_ERROR::BLST_SUCCESS
}

/// Compute the Blake2b-256 digest of the concatenation of `parts`.
pub fn blake2b(parts: &[&[u8]]) -> Bytes32 {
    let mut hasher = Blake2b256::new();
    for part in parts {
        hasher.update(part);
    }
    Bytes32::new(hasher.finalize().into())
}

/// Compute the Keccak-256 digest of the concatenation of `parts`.
pub fn keccak256(parts: &[&[u8]]) -> Bytes32 {
    let mut hasher = Keccak256::new();
    for part in parts {
        sha3::Digest::update(&mut hasher, part);
    }
    Bytes32::new(sha3::Digest::finalize(hasher).into())
}

/// Encode `int` as an unsigned varint into a fixed 10-byte buffer, trailing bytes zeroed.
///
/// The full 10 bytes participate in commit key hashing, so the padding is load-bearing for
/// cross-node determinism.
pub fn uvarint10(mut int: u64) -> [u8; 10] {
    let mut buf = [0u8; 10];
    let mut i = 0;
    while int >= 0x80 {
        buf[i] = (int as u8) | 0x80;
        int >>= 7;
        i += 1;
    }
    buf[i] = int as u8;
    buf
}
