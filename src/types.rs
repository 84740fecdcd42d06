//! Messages exchanged between the beacon, block makers, and notarizers.

use bytes::{Buf, BufMut, Bytes};
use commonware_codec::{EncodeSize, Error, FixedSize, Read, ReadExt, Write};
use commonware_cryptography::{
    bls12381::primitives::{
        group::Element,
        poly::PartialSignature,
        variant::Variant,
    },
    sha256::{self, Digest},
    Hasher, Sha256,
};
use commonware_utils::{hex, union};

/// Round number of a block or packet.
pub type Round = u64;

/// Suffix applied to the application namespace for partial signatures over
/// block headers.
pub const NOTARIZE_SUFFIX: &[u8] = b"_NOTARIZE";

/// Compute the signing namespace for notarization partials.
pub fn notarize_namespace(namespace: &[u8]) -> Vec<u8> {
    union(namespace, NOTARIZE_SUFFIX)
}

/// The message signed by notarizers: the lowercase hex rendering of a header
/// hash. All nodes must sign the same bytes for partials to aggregate.
pub fn notarize_message(digest: &Digest) -> Vec<u8> {
    hex(digest.as_ref()).into_bytes()
}

/// Owner index of the genesis block.
pub const GENESIS_OWNER: i64 = -1;

/// Blob carried by the genesis block.
pub const GENESIS_BLOB: &[u8] = b"Hello Genesis";

/// Previous-notarization placeholder carried by the genesis header.
pub const GENESIS_PRV_SIG: &[u8] =
    b"3605ff73b6faec27aa78e311603e9fe2ef35bad82ccf46fc707814bfbdcc6f9e";

/// The hard-coded first block of every chain.
///
/// Every node must derive an identical header hash from these constants.
pub fn genesis() -> Block {
    let root = sha256::hash(b"hello world");
    Block {
        header: BlockHeader {
            round: 0,
            owner: GENESIS_OWNER,
            root: root.clone(),
            randomness: 0,
            prv_hash: root,
            prv_sig: Bytes::from_static(GENESIS_PRV_SIG),
        },
        blob: Bytes::from_static(GENESIS_BLOB),
    }
}

/// Metadata identifying a block.
///
/// The header's identity is [BlockHeader::hash], a digest over its fields in
/// a fixed order. `prv_sig` carries the encoded notarization signature of the
/// parent block (opaque at this layer).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    pub round: Round,
    pub owner: i64,
    pub root: Digest,
    pub randomness: i64,
    pub prv_hash: Digest,
    pub prv_sig: Bytes,
}

impl BlockHeader {
    /// Digest over owner, round, previous hash, data root, and previous
    /// signature (in that order). The digest fields are hashed in their hex
    /// rendering so the identity is stable regardless of in-memory layout.
    pub fn hash(&self) -> Digest {
        let mut hasher = Sha256::new();
        hasher.update(&self.owner.to_be_bytes());
        hasher.update(&self.round.to_be_bytes());
        hasher.update(hex(self.prv_hash.as_ref()).as_bytes());
        hasher.update(hex(self.root.as_ref()).as_bytes());
        hasher.update(&self.prv_sig);
        hasher.finalize()
    }
}

impl Write for BlockHeader {
    fn write(&self, buf: &mut impl BufMut) {
        self.round.write(buf);
        self.owner.write(buf);
        self.root.write(buf);
        self.randomness.write(buf);
        self.prv_hash.write(buf);
        self.prv_sig.write(buf);
    }
}

impl EncodeSize for BlockHeader {
    fn encode_size(&self) -> usize {
        self.round.encode_size()
            + self.owner.encode_size()
            + self.root.encode_size()
            + self.randomness.encode_size()
            + self.prv_hash.encode_size()
            + self.prv_sig.encode_size()
    }
}

impl Read for BlockHeader {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, Error> {
        let round = Round::read(buf)?;
        let owner = i64::read(buf)?;
        let root = Digest::read(buf)?;
        let randomness = i64::read(buf)?;
        let prv_hash = Digest::read(buf)?;
        // The maximum length of a message is already bounded by the P2P connection,
        // so it is safe to read the remaining variable-length fields without a
        // tighter limit.
        let prv_sig = Bytes::read_cfg(buf, &(..).into())?;
        Ok(Self {
            round,
            owner,
            root,
            randomness,
            prv_hash,
            prv_sig,
        })
    }
}

/// A block: header plus opaque payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub blob: Bytes,
}

impl Block {
    /// The block's identity is its header hash.
    pub fn hash(&self) -> Digest {
        self.header.hash()
    }
}

impl Write for Block {
    fn write(&self, buf: &mut impl BufMut) {
        self.header.write(buf);
        self.blob.write(buf);
    }
}

impl EncodeSize for Block {
    fn encode_size(&self) -> usize {
        self.header.encode_size() + self.blob.encode_size()
    }
}

impl Read for Block {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, Error> {
        let header = BlockHeader::read(buf)?;
        let blob = Bytes::read_cfg(buf, &(..).into())?;
        Ok(Self { header, blob })
    }
}

/// A recovered threshold signature over a block's header hash.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Notarization<V: Variant> {
    pub hash: Digest,
    pub signature: V::Signature,
}

impl<V: Variant> Write for Notarization<V> {
    fn write(&self, buf: &mut impl BufMut) {
        self.hash.write(buf);
        self.signature.write(buf);
    }
}

impl<V: Variant> EncodeSize for Notarization<V> {
    fn encode_size(&self) -> usize {
        self.hash.encode_size() + self.signature.encode_size()
    }
}

impl<V: Variant> Read for Notarization<V> {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, Error> {
        let hash = Digest::read(buf)?;
        let signature = V::Signature::read(buf)?;
        Ok(Self { hash, signature })
    }
}

/// A block together with its notarization: the durable artifact a concluded
/// round leaves behind.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NotarizedBlock<V: Variant> {
    pub block: Block,
    pub notarization: Notarization<V>,
}

impl<V: Variant> NotarizedBlock<V> {
    pub fn round(&self) -> Round {
        self.block.header.round
    }

    /// The genesis block paired with a zero notarization. Seeds the finalizer
    /// buffer; blocks at round 1 reference the encoded zero signature.
    pub fn genesis() -> Self {
        let block = genesis();
        let hash = block.hash();
        Self {
            block,
            notarization: Notarization {
                hash,
                signature: V::Signature::zero(),
            },
        }
    }
}

impl<V: Variant> Write for NotarizedBlock<V> {
    fn write(&self, buf: &mut impl BufMut) {
        self.block.write(buf);
        self.notarization.write(buf);
    }
}

impl<V: Variant> EncodeSize for NotarizedBlock<V> {
    fn encode_size(&self) -> usize {
        self.block.encode_size() + self.notarization.encode_size()
    }
}

impl<V: Variant> Read for NotarizedBlock<V> {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, Error> {
        let block = Block::read(buf)?;
        let notarization = Notarization::read(buf)?;
        Ok(Self {
            block,
            notarization,
        })
    }
}

/// A notarizer's partial signature over a block, carrying the block itself so
/// recipients that missed the proposal can still record it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignatureProposal<V: Variant> {
    pub block: Block,
    pub partial: PartialSignature<V>,
}

impl<V: Variant> SignatureProposal<V> {
    /// Index of the signer, embedded in the partial.
    pub fn signer(&self) -> u32 {
        self.partial.index
    }
}

impl<V: Variant> Write for SignatureProposal<V> {
    fn write(&self, buf: &mut impl BufMut) {
        self.block.write(buf);
        self.partial.write(buf);
    }
}

impl<V: Variant> EncodeSize for SignatureProposal<V> {
    fn encode_size(&self) -> usize {
        self.block.encode_size() + self.partial.encode_size()
    }
}

impl<V: Variant> Read for SignatureProposal<V> {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, Error> {
        let block = Block::read(buf)?;
        let partial = PartialSignature::<V>::read(buf)?;
        Ok(Self { block, partial })
    }
}

/// Round randomness emitted by the beacon.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BeaconPacket {
    pub round: Round,
    pub randomness: i64,
}

impl Write for BeaconPacket {
    fn write(&self, buf: &mut impl BufMut) {
        self.round.write(buf);
        self.randomness.write(buf);
    }
}

impl FixedSize for BeaconPacket {
    const SIZE: usize = Round::SIZE + i64::SIZE;
}

impl Read for BeaconPacket {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, Error> {
        let round = Round::read(buf)?;
        let randomness = i64::read(buf)?;
        Ok(Self { round, randomness })
    }
}

/// All messages exchanged between nodes, on a single channel.
#[derive(Clone, Debug, PartialEq)]
pub enum Message<V: Variant> {
    Beacon(BeaconPacket),
    Proposal(Block),
    Signature(SignatureProposal<V>),
    Notarized(NotarizedBlock<V>),
}

impl<V: Variant> Write for Message<V> {
    fn write(&self, buf: &mut impl BufMut) {
        match self {
            Self::Beacon(v) => {
                buf.put_u8(0);
                v.write(buf);
            }
            Self::Proposal(v) => {
                buf.put_u8(1);
                v.write(buf);
            }
            Self::Signature(v) => {
                buf.put_u8(2);
                v.write(buf);
            }
            Self::Notarized(v) => {
                buf.put_u8(3);
                v.write(buf);
            }
        }
    }
}

impl<V: Variant> EncodeSize for Message<V> {
    fn encode_size(&self) -> usize {
        1 + match self {
            Self::Beacon(v) => v.encode_size(),
            Self::Proposal(v) => v.encode_size(),
            Self::Signature(v) => v.encode_size(),
            Self::Notarized(v) => v.encode_size(),
        }
    }
}

impl<V: Variant> Read for Message<V> {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, Error> {
        let tag = u8::read(buf)?;
        match tag {
            0 => Ok(Self::Beacon(BeaconPacket::read(buf)?)),
            1 => Ok(Self::Proposal(Block::read(buf)?)),
            2 => Ok(Self::Signature(SignatureProposal::read(buf)?)),
            3 => Ok(Self::Notarized(NotarizedBlock::read(buf)?)),
            _ => Err(Error::Invalid("probchain::Message", "Invalid type")),
        }
    }
}
