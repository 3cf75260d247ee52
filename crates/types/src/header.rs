use alloy_primitives::{Address, B64, B256, Bytes, U64, U256, keccak256};
use alloy_rlp::{Decodable, Encodable};
use serde::{Deserialize, Serialize};

use crate::{BlockNumber, RecoveryError, recover_signer};

const SEAL_SIGNATURE_LEN: usize = 65;
const CLIQUE_VANITY_LEN: usize = 32;
const CLIQUE_NONCE_AUTHORIZE: B64 = B64::new([0xff; 8]);
const CLIQUE_NONCE_DROP: B64 = B64::ZERO;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum HeaderError {
    #[error("block {number} carries no seal fields")]
    MissingSeal { number: BlockNumber },
    #[error("block {number} seal is malformed: {reason}")]
    MalformedSeal { number: BlockNumber, reason: String },
    #[error("block {number} extra-data is {len} bytes, too short for a clique seal")]
    ExtraDataTooShort { number: BlockNumber, len: usize },
    #[error("block {number} is missing {field}")]
    MissingField {
        number: BlockNumber,
        field: &'static str,
    },
    #[error(transparent)]
    Recovery(#[from] RecoveryError),
}

/// How a proof-of-authority chain seals its headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SealKind {
    Aura,
    Clique,
}

/// Header as returned by `eth_getBlockByNumber(n, false)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockHeader {
    pub number: U64,
    pub hash: B256,
    pub parent_hash: B256,
    pub sha3_uncles: B256,
    pub miner: Address,
    pub state_root: B256,
    pub transactions_root: B256,
    pub receipts_root: B256,
    pub logs_bloom: Bytes,
    pub difficulty: U256,
    pub gas_limit: U256,
    pub gas_used: U256,
    pub timestamp: U256,
    pub extra_data: Bytes,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mix_hash: Option<B256>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<B64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_fee_per_gas: Option<U256>,
    /// Already RLP-encoded seal items, as parity-style Aura nodes report them.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub seal_fields: Vec<Bytes>,
}

enum Encoding<'a> {
    Full,
    Bare,
    CliqueSigning(&'a [u8]),
}

impl BlockHeader {
    pub fn number(&self) -> BlockNumber {
        self.number.to::<u64>()
    }

    /// Canonical RLP encoding; its keccak equals `hash` for a well-formed header.
    pub fn rlp(&self) -> Bytes {
        self.encode_with(Encoding::Full).into()
    }

    pub fn computed_hash(&self) -> B256 {
        keccak256(self.encode_with(Encoding::Full))
    }

    /// Hash an Aura validator signs: the header without its seal fields.
    pub fn aura_bare_hash(&self) -> B256 {
        keccak256(self.encode_with(Encoding::Bare))
    }

    /// Hash a Clique signer signs: the header with the trailing seal cut from extra-data.
    pub fn clique_seal_hash(&self) -> Result<B256, HeaderError> {
        let (unsealed, _) = self.split_clique_extra()?;
        Ok(keccak256(self.encode_with(Encoding::CliqueSigning(unsealed))))
    }

    pub fn recover_sealer(&self, kind: SealKind) -> Result<Address, HeaderError> {
        let (hash, signature) = match kind {
            SealKind::Aura => (self.aura_bare_hash(), self.aura_signature()?),
            SealKind::Clique => {
                let (_, seal) = self.split_clique_extra()?;
                (self.clique_seal_hash()?, seal.to_vec())
            }
        };
        let r = B256::from_slice(&signature[0..32]);
        let s = B256::from_slice(&signature[32..64]);
        Ok(recover_signer(&hash, &r, &s, signature[64])?)
    }

    /// Validators listed in an epoch block's extra-data.
    pub fn clique_epoch_validators(&self) -> Result<Vec<Address>, HeaderError> {
        let (unsealed, _) = self.split_clique_extra()?;
        let list = unsealed.get(CLIQUE_VANITY_LEN..).unwrap_or_default();
        if list.len() % Address::len_bytes() != 0 {
            return Err(HeaderError::MalformedSeal {
                number: self.number(),
                reason: format!("validator list of {} bytes is not a multiple of 20", list.len()),
            });
        }
        Ok(list
            .chunks_exact(Address::len_bytes())
            .map(Address::from_slice)
            .collect())
    }

    /// `(nominee, authorize)` when the header carries a Clique vote.
    pub fn clique_vote(&self) -> Option<(Address, bool)> {
        if self.miner == Address::ZERO {
            return None;
        }
        match self.nonce {
            Some(nonce) if nonce == CLIQUE_NONCE_AUTHORIZE => Some((self.miner, true)),
            Some(nonce) if nonce == CLIQUE_NONCE_DROP => Some((self.miner, false)),
            _ => None,
        }
    }

    fn aura_signature(&self) -> Result<Vec<u8>, HeaderError> {
        let number = self.number();
        let raw = self
            .seal_fields
            .get(1)
            .ok_or(HeaderError::MissingSeal { number })?;
        let signature =
            Bytes::decode(&mut raw.as_ref()).map_err(|error| HeaderError::MalformedSeal {
                number,
                reason: error.to_string(),
            })?;
        if signature.len() != SEAL_SIGNATURE_LEN {
            return Err(HeaderError::MalformedSeal {
                number,
                reason: format!("signature is {} bytes, expected 65", signature.len()),
            });
        }
        Ok(signature.to_vec())
    }

    fn split_clique_extra(&self) -> Result<(&[u8], &[u8]), HeaderError> {
        let extra = self.extra_data.as_ref();
        if extra.len() < CLIQUE_VANITY_LEN + SEAL_SIGNATURE_LEN {
            return Err(HeaderError::ExtraDataTooShort {
                number: self.number(),
                len: extra.len(),
            });
        }
        Ok(extra.split_at(extra.len() - SEAL_SIGNATURE_LEN))
    }

    fn encode_with(&self, encoding: Encoding<'_>) -> Vec<u8> {
        let mut payload = Vec::with_capacity(600);
        self.parent_hash.encode(&mut payload);
        self.sha3_uncles.encode(&mut payload);
        self.miner.encode(&mut payload);
        self.state_root.encode(&mut payload);
        self.transactions_root.encode(&mut payload);
        self.receipts_root.encode(&mut payload);
        self.logs_bloom.encode(&mut payload);
        self.difficulty.encode(&mut payload);
        self.number().encode(&mut payload);
        self.gas_limit.encode(&mut payload);
        self.gas_used.encode(&mut payload);
        self.timestamp.encode(&mut payload);

        match encoding {
            Encoding::CliqueSigning(unsealed) => unsealed.encode(&mut payload),
            Encoding::Full | Encoding::Bare => self.extra_data.encode(&mut payload),
        }

        let aura = !self.seal_fields.is_empty();
        match encoding {
            Encoding::Bare if aura => {}
            Encoding::Full if aura => {
                for field in &self.seal_fields {
                    payload.extend_from_slice(field);
                }
            }
            _ => {
                self.mix_hash.unwrap_or_default().encode(&mut payload);
                self.nonce.unwrap_or_default().encode(&mut payload);
            }
        }

        if let Some(base_fee) = self.base_fee_per_gas {
            base_fee.encode(&mut payload);
        }

        let mut out = Vec::with_capacity(payload.len() + 4);
        alloy_rlp::Header {
            list: true,
            payload_length: payload.len(),
        }
        .encode(&mut out);
        out.extend_from_slice(&payload);
        out
    }
}
