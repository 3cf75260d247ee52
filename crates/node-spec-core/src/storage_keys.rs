use std::collections::BTreeSet;

use alloy_primitives::{U256, keccak256};

/// Slots holding registry metadata that every node-list proof covers.
pub const METADATA_SLOTS: [U256; 2] = [U256::ZERO, U256::from_limbs([1, 0, 0, 0])];

/// Position of one field inside the elements of a dynamic storage array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StructLayout {
    pub base_slot: u64,
    pub struct_size: u64,
    pub field_offset: u64,
}

/// `In3Node[] nodes` in the v2 registry data contract; the proven field is `proofHash`.
pub const V2_NODE_LAYOUT: StructLayout = StructLayout {
    base_slot: 0,
    struct_size: 5,
    field_offset: 4,
};

/// `Web3Server[] servers` in the legacy registry; the proven field is `owner`.
pub const LEGACY_SERVER_LAYOUT: StructLayout = StructLayout {
    base_slot: 0,
    struct_size: 6,
    field_offset: 1,
};

impl StructLayout {
    pub fn for_version(contract_version2: bool) -> Self {
        if contract_version2 {
            V2_NODE_LAYOUT
        } else {
            LEGACY_SERVER_LAYOUT
        }
    }

    pub fn slot(&self, index: u64) -> U256 {
        array_element_slot(self.base_slot, index, self.struct_size, self.field_offset)
    }
}

/// `uint256(keccak256(pad32(base))) + index * size + offset`, wrapping like the EVM.
pub fn array_element_slot(base_slot: u64, index: u64, struct_size: u64, field_offset: u64) -> U256 {
    let start = U256::from_be_bytes(keccak256(U256::from(base_slot).to_be_bytes::<32>()).0);
    start
        .wrapping_add(U256::from(index).wrapping_mul(U256::from(struct_size)))
        .wrapping_add(U256::from(field_offset))
}

/// Metadata slots plus one slot per selected node.
pub fn node_list_storage_keys(
    layout: &StructLayout,
    indices: impl IntoIterator<Item = u64>,
) -> BTreeSet<U256> {
    METADATA_SLOTS
        .into_iter()
        .chain(indices.into_iter().map(|index| layout.slot(index)))
        .collect()
}
