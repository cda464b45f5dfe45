/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Types that exist only to store bytes or small quantities, and do not have any major "active"
//! behavior.

use std::{
    fmt::{self, Debug, Display, Formatter},
    ops::{Add, AddAssign, Sub},
};

use borsh::{BorshDeserialize, BorshSerialize};

/// Height of a block in the chain.
///
/// Starts at 0 for the genesis block and increases by 1 for every subsequent block. A block's
/// height is recoverable from its [`BlockId`]: the ID's leading 4 bytes are the height in
/// big-endian.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize)]
pub struct BlockHeight(u32);

impl BlockHeight {
    /// Create a new `BlockHeight` with an `int` inner value.
    pub const fn new(int: u32) -> Self {
        Self(int)
    }

    /// Get the inner `u32` value of this `BlockHeight`.
    pub const fn int(&self) -> u32 {
        self.0
    }

    /// Get the big-endian representation of the inner `u32` value of this `BlockHeight`.
    pub fn to_be_bytes(&self) -> [u8; 4] {
        self.0.to_be_bytes()
    }
}

impl Display for BlockHeight {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Add<u32> for BlockHeight {
    type Output = BlockHeight;
    fn add(self, rhs: u32) -> Self::Output {
        BlockHeight::new(self.0.add(rhs))
    }
}

impl AddAssign<u32> for BlockHeight {
    fn add_assign(&mut self, rhs: u32) {
        self.0.add_assign(rhs)
    }
}

impl Sub<u32> for BlockHeight {
    type Output = BlockHeight;
    fn sub(self, rhs: u32) -> Self::Output {
        BlockHeight::new(self.0.sub(rhs))
    }
}

/// Round number of the pacemaker's logical clock. Starts at 0 at the beginning of every epoch and
/// increases by 1 on every quorum certificate collected or view timeout.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize)]
pub struct Round(u32);

impl Round {
    /// Create a new `Round` wrapping `int`.
    pub const fn new(int: u32) -> Self {
        Self(int)
    }

    /// Get the initial `Round`, which is 0.
    pub const fn init() -> Self {
        Self(0)
    }

    /// Get the inner `u32` of this `Round`.
    pub const fn int(&self) -> u32 {
        self.0
    }
}

impl Display for Round {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Add<u32> for Round {
    type Output = Round;
    fn add(self, rhs: u32) -> Self::Output {
        Round(self.0.add(rhs))
    }
}

/// Number that identifies an epoch: the interval between two consecutive keyframe blocks.
/// Committee composition is fixed within an epoch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize)]
pub struct EpochId(u64);

impl EpochId {
    /// Create a new `EpochId` wrapping `int`.
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    /// Get the inner `u64` value of this `EpochId`.
    pub const fn int(&self) -> u64 {
        self.0
    }

    /// Get the `EpochId` that directly follows this one.
    pub const fn next(&self) -> EpochId {
        EpochId(self.0 + 1)
    }
}

impl Display for EpochId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// 32-byte cryptographic hash. Within this crate these are Blake2b-256 digests, except for commit
/// keys and addresses, which are Keccak-256 (see [`crate::crypto`]).
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, BorshDeserialize, BorshSerialize)]
pub struct Bytes32([u8; 32]);

impl Bytes32 {
    /// Create a new `Bytes32` wrapping `bytes`.
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the inner `[u8; 32]` value of this `Bytes32`.
    pub const fn bytes(&self) -> [u8; 32] {
        self.0
    }
}

impl AsRef<[u8]> for Bytes32 {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Display for Bytes32 {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl Debug for Bytes32 {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}

/// Identifier of a block: `height (big-endian, 4 bytes) || blake2b(signing_hash, signer)[4..32]`.
///
/// Embedding the height makes the containing block's position in the chain recoverable from the ID
/// alone, which the chain store's height index and the pacemaker's ancestor walks rely on.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, BorshDeserialize, BorshSerialize)]
pub struct BlockId([u8; 32]);

impl BlockId {
    /// Create a new `BlockId` wrapping `bytes`.
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Compose a `BlockId` from a block height and the tail 28 bytes of a hash.
    pub fn compose(height: BlockHeight, hash: &Bytes32) -> BlockId {
        let mut id = hash.bytes();
        id[0..4].copy_from_slice(&height.to_be_bytes());
        BlockId(id)
    }

    /// Extract the block height from the leading 4 bytes of this `BlockId`.
    pub fn height(&self) -> BlockHeight {
        let mut be = [0u8; 4];
        be.copy_from_slice(&self.0[0..4]);
        BlockHeight::new(u32::from_be_bytes(be))
    }

    /// Get the inner `[u8; 32]` value of this `BlockId`.
    pub const fn bytes(&self) -> [u8; 32] {
        self.0
    }
}

impl AsRef<[u8]> for BlockId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Display for BlockId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl Debug for BlockId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}

/// 20-byte account address, derived from an ECDSA public key as `keccak256(pubkey)[12..32]`.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, BorshDeserialize, BorshSerialize)]
pub struct Address([u8; 20]);

impl Address {
    /// Create a new `Address` wrapping `bytes`.
    pub const fn new(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    /// Get the inner `[u8; 20]` value of this `Address`.
    pub const fn bytes(&self) -> [u8; 20] {
        self.0
    }
}

impl AsRef<[u8]> for Address {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl Debug for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}

/// Recoverable ECDSA signature over the secp256k1 curve: `r || s || v`, 65 bytes.
#[derive(Clone, Copy, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct SignatureBytes([u8; 65]);

impl SignatureBytes {
    /// Create a new `SignatureBytes` wrapping `bytes`.
    pub const fn new(bytes: [u8; 65]) -> Self {
        Self(bytes)
    }

    /// Get the inner `[u8; 65]` value of this `SignatureBytes`.
    pub const fn bytes(&self) -> [u8; 65] {
        self.0
    }
}

impl Default for SignatureBytes {
    fn default() -> Self {
        Self([0u8; 65])
    }
}

impl Debug for SignatureBytes {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

/// A partial or aggregated threshold (BLS) signature: a compressed G2 point, 96 bytes.
#[derive(Clone, Copy, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct ThresholdSigBytes([u8; 96]);

impl ThresholdSigBytes {
    /// Create a new `ThresholdSigBytes` wrapping `bytes`.
    pub const fn new(bytes: [u8; 96]) -> Self {
        Self(bytes)
    }

    /// Get the inner `[u8; 96]` value of this `ThresholdSigBytes`.
    pub const fn bytes(&self) -> [u8; 96] {
        self.0
    }
}

impl Default for ThresholdSigBytes {
    fn default() -> Self {
        Self([0u8; 96])
    }
}

impl Debug for ThresholdSigBytes {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

/// A threshold (BLS) public key: a compressed G1 point, 48 bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, BorshDeserialize, BorshSerialize)]
pub struct ThresholdPubKeyBytes([u8; 48]);

impl ThresholdPubKeyBytes {
    /// Create a new `ThresholdPubKeyBytes` wrapping `bytes`.
    pub const fn new(bytes: [u8; 48]) -> Self {
        Self(bytes)
    }

    /// Get the inner `[u8; 48]` value of this `ThresholdPubKeyBytes`.
    pub const fn bytes(&self) -> [u8; 48] {
        self.0
    }
}

impl Debug for ThresholdPubKeyBytes {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

/// A compressed secp256k1 public key (33 bytes).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, BorshDeserialize, BorshSerialize)]
pub struct PubKeyBytes([u8; 33]);

impl PubKeyBytes {
    /// Create a new `PubKeyBytes` wrapping `bytes`.
    pub const fn new(bytes: [u8; 33]) -> Self {
        Self(bytes)
    }

    /// Get the inner `[u8; 33]` value of this `PubKeyBytes`.
    pub const fn bytes(&self) -> [u8; 33] {
        self.0
    }
}

impl AsRef<[u8]> for PubKeyBytes {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Debug for PubKeyBytes {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

/// 4-byte network discriminator prefixed to every consensus message. Messages whose magic does not
/// match the local configuration are silently dropped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct Magic([u8; 4]);

impl Magic {
    /// The magic of the version 1 network: `76 01 00 00`.
    pub const V1: Magic = Magic([0x76, 0x01, 0x00, 0x00]);

    /// Create a new `Magic` wrapping `bytes`.
    pub const fn new(bytes: [u8; 4]) -> Self {
        Self(bytes)
    }

    /// Get the inner `[u8; 4]` value of this `Magic`.
    pub const fn bytes(&self) -> [u8; 4] {
        self.0
    }

    /// Get the lowercase hex representation of this `Magic`, as carried in wire frames.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

/// The network address a committee member accepts consensus messages on.
#[derive(Clone, Debug, PartialEq, Eq, Hash, BorshDeserialize, BorshSerialize)]
pub struct NetAddress {
    pub ip: String,
    pub port: u16,
}

impl NetAddress {
    pub fn new(ip: impl Into<String>, port: u16) -> NetAddress {
        NetAddress {
            ip: ip.into(),
            port,
        }
    }
}

impl Display for NetAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Set of voter indices represented as a bit array, byte-packed LSB-first.
///
/// Bit `i` set means the committee member with index `i` contributed a partial signature to the
/// certificate holding this bitmap. Quorum rules are always evaluated against
/// [`count`](Self::count), the cardinality of the set bits, so duplicate votes can never inflate a
/// tally.
#[derive(Clone, Default, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct Bitmap {
    bits: Vec<u8>,
    len: u32,
}

impl Bitmap {
    /// Create a new all-zeroes `Bitmap` able to hold `len` bits.
    pub fn new(len: usize) -> Bitmap {
        Bitmap {
            bits: vec![0u8; (len + 7) / 8],
            len: len as u32,
        }
    }

    /// The number of bits this `Bitmap` can hold.
    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Set bit `index`. Out-of-range indices are ignored.
    pub fn set(&mut self, index: usize) {
        if index < self.len as usize {
            self.bits[index / 8] |= 1 << (index % 8);
        }
    }

    /// Clear bit `index`. Out-of-range indices are ignored.
    pub fn clear(&mut self, index: usize) {
        if index < self.len as usize {
            self.bits[index / 8] &= !(1 << (index % 8));
        }
    }

    /// Whether bit `index` is set. Out-of-range indices read as unset.
    pub fn get(&self, index: usize) -> bool {
        index < self.len as usize && self.bits[index / 8] & (1 << (index % 8)) != 0
    }

    /// The number of set bits.
    pub fn count(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    /// Iterate over the indices of the set bits, in ascending order.
    pub fn iter_set(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.len as usize).filter(move |i| self.get(*i))
    }
}

impl Debug for Bitmap {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for i in 0..self.len as usize {
            write!(f, "{}", if self.get(i) { 'x' } else { '_' })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitmap_set_clear_count() {
        let mut bm = Bitmap::new(10);
        assert_eq!(bm.count(), 0);
        bm.set(0);
        bm.set(7);
        bm.set(9);
        assert_eq!(bm.count(), 3);
        assert!(bm.get(7));
        assert!(!bm.get(8));

        // Setting the same bit twice does not inflate the count.
        bm.set(9);
        assert_eq!(bm.count(), 3);

        bm.clear(7);
        assert_eq!(bm.count(), 2);
        assert_eq!(bm.iter_set().collect::<Vec<_>>(), vec![0, 9]);

        // Out-of-range accesses are no-ops.
        bm.set(10);
        assert_eq!(bm.count(), 2);
    }

    #[test]
    fn block_id_embeds_height() {
        let hash = Bytes32::new([0xAB; 32]);
        let id = BlockId::compose(BlockHeight::new(0x01020304), &hash);
        assert_eq!(id.height(), BlockHeight::new(0x01020304));
        assert_eq!(id.bytes()[0..4], [0x01, 0x02, 0x03, 0x04]);
        assert_eq!(id.bytes()[4..], hash.bytes()[4..]);
    }
}
