//! ABI of the node registry contracts and the validator set contract.

use alloy_sol_types::{SolCall, SolEvent, sol};
use in3_node_types::{Address, B256, Bytes, Log, NodeRecord, U256};

sol! {
    function nodeRegistryData() external view returns (address);
    function registryId() external view returns (bytes32);
    function totalNodes() external view returns (uint256);
    function totalServers() external view returns (uint256);

    struct In3Node {
        string url;
        uint256 deposit;
        uint64 registerTime;
        uint192 props;
        uint64 weight;
        address signer;
        bytes32 proofHash;
    }

    function getIn3NodeInformation(uint256 index) external view returns (In3Node memory);

    function servers(uint256 index) external view returns (
        string url,
        address owner,
        uint256 deposit,
        uint256 props,
        uint128 unregisterTime,
        uint128 unregisterDeposit,
        address unregisterCaller
    );

    function convict(
        uint256 serverIndex,
        bytes32 blockHash,
        uint256 blockNumber,
        uint8 v,
        bytes32 r,
        bytes32 s
    ) external;

    event LogNodeRegistered(string url, uint256 props, address signer, uint256 deposit);
    event LogNodeUpdated(string url, uint256 props, address signer, uint256 deposit);
    event LogNodeConvicted(address signer);
    event LogNodeRemoved(string url, address signer);
    event LogOwnershipChanged(address signer, address oldOwner, address newOwner);

    event LogServerRegistered(string url, uint256 props, address owner, uint256 deposit);
    event LogServerUnregisterRequested(string url, address owner, address caller);
    event LogServerUnregisterCanceled(string url, address owner);
    event LogServerConvicted(string url, address owner);
    event LogServerRemoved(string url, address owner);

    event InitiateChange(bytes32 indexed parentHash, address[] newSet);
}

/// Registry event decoded from a log, for either contract generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    NodeRegistered {
        url: String,
        props: U256,
        signer: Address,
        deposit: U256,
    },
    NodeUpdated {
        url: String,
        props: U256,
        signer: Address,
        deposit: U256,
    },
    NodeConvicted {
        signer: Address,
    },
    NodeRemoved {
        url: String,
        signer: Address,
    },
    OwnershipChanged {
        signer: Address,
        old_owner: Address,
        new_owner: Address,
    },
    ServerRegistered {
        url: String,
        props: U256,
        owner: Address,
        deposit: U256,
    },
    ServerUnregisterRequested {
        url: String,
        owner: Address,
        caller: Address,
    },
    ServerUnregisterCanceled {
        url: String,
        owner: Address,
    },
    ServerConvicted {
        url: String,
        owner: Address,
    },
    ServerRemoved {
        url: String,
        owner: Address,
    },
}

impl RegistryEvent {
    pub fn name(&self) -> &'static str {
        match self {
            RegistryEvent::NodeRegistered { .. } => "LogNodeRegistered",
            RegistryEvent::NodeUpdated { .. } => "LogNodeUpdated",
            RegistryEvent::NodeConvicted { .. } => "LogNodeConvicted",
            RegistryEvent::NodeRemoved { .. } => "LogNodeRemoved",
            RegistryEvent::OwnershipChanged { .. } => "LogOwnershipChanged",
            RegistryEvent::ServerRegistered { .. } => "LogServerRegistered",
            RegistryEvent::ServerUnregisterRequested { .. } => "LogServerUnregisterRequested",
            RegistryEvent::ServerUnregisterCanceled { .. } => "LogServerUnregisterCanceled",
            RegistryEvent::ServerConvicted { .. } => "LogServerConvicted",
            RegistryEvent::ServerRemoved { .. } => "LogServerRemoved",
        }
    }
}

/// topic0 of every registry event the watcher listens for.
pub fn registry_event_topics() -> Vec<B256> {
    vec![
        LogNodeRegistered::SIGNATURE_HASH,
        LogNodeUpdated::SIGNATURE_HASH,
        LogNodeConvicted::SIGNATURE_HASH,
        LogNodeRemoved::SIGNATURE_HASH,
        LogOwnershipChanged::SIGNATURE_HASH,
        LogServerRegistered::SIGNATURE_HASH,
        LogServerUnregisterRequested::SIGNATURE_HASH,
        LogServerUnregisterCanceled::SIGNATURE_HASH,
        LogServerConvicted::SIGNATURE_HASH,
        LogServerRemoved::SIGNATURE_HASH,
    ]
}

/// Decodes a registry log; `Ok(None)` when topic0 is not a registry event.
pub fn decode_registry_log(log: &Log) -> Result<Option<RegistryEvent>, alloy_sol_types::Error> {
    let Some(topic0) = log.topics.first() else {
        return Ok(None);
    };
    let topics = log.topics.iter().copied();
    let data = log.data.as_ref();

    let event = if *topic0 == LogNodeRegistered::SIGNATURE_HASH {
        let event = LogNodeRegistered::decode_raw_log(topics, data)?;
        RegistryEvent::NodeRegistered {
            url: event.url,
            props: event.props,
            signer: event.signer,
            deposit: event.deposit,
        }
    } else if *topic0 == LogNodeUpdated::SIGNATURE_HASH {
        let event = LogNodeUpdated::decode_raw_log(topics, data)?;
        RegistryEvent::NodeUpdated {
            url: event.url,
            props: event.props,
            signer: event.signer,
            deposit: event.deposit,
        }
    } else if *topic0 == LogNodeConvicted::SIGNATURE_HASH {
        let event = LogNodeConvicted::decode_raw_log(topics, data)?;
        RegistryEvent::NodeConvicted {
            signer: event.signer,
        }
    } else if *topic0 == LogNodeRemoved::SIGNATURE_HASH {
        let event = LogNodeRemoved::decode_raw_log(topics, data)?;
        RegistryEvent::NodeRemoved {
            url: event.url,
            signer: event.signer,
        }
    } else if *topic0 == LogOwnershipChanged::SIGNATURE_HASH {
        let event = LogOwnershipChanged::decode_raw_log(topics, data)?;
        RegistryEvent::OwnershipChanged {
            signer: event.signer,
            old_owner: event.oldOwner,
            new_owner: event.newOwner,
        }
    } else if *topic0 == LogServerRegistered::SIGNATURE_HASH {
        let event = LogServerRegistered::decode_raw_log(topics, data)?;
        RegistryEvent::ServerRegistered {
            url: event.url,
            props: event.props,
            owner: event.owner,
            deposit: event.deposit,
        }
    } else if *topic0 == LogServerUnregisterRequested::SIGNATURE_HASH {
        let event = LogServerUnregisterRequested::decode_raw_log(topics, data)?;
        RegistryEvent::ServerUnregisterRequested {
            url: event.url,
            owner: event.owner,
            caller: event.caller,
        }
    } else if *topic0 == LogServerUnregisterCanceled::SIGNATURE_HASH {
        let event = LogServerUnregisterCanceled::decode_raw_log(topics, data)?;
        RegistryEvent::ServerUnregisterCanceled {
            url: event.url,
            owner: event.owner,
        }
    } else if *topic0 == LogServerConvicted::SIGNATURE_HASH {
        let event = LogServerConvicted::decode_raw_log(topics, data)?;
        RegistryEvent::ServerConvicted {
            url: event.url,
            owner: event.owner,
        }
    } else if *topic0 == LogServerRemoved::SIGNATURE_HASH {
        let event = LogServerRemoved::decode_raw_log(topics, data)?;
        RegistryEvent::ServerRemoved {
            url: event.url,
            owner: event.owner,
        }
    } else {
        return Ok(None);
    };
    Ok(Some(event))
}

/// Decoded `InitiateChange` log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatorChange {
    pub parent_hash: B256,
    pub new_set: Vec<Address>,
}

pub fn decode_initiate_change(log: &Log) -> Result<ValidatorChange, alloy_sol_types::Error> {
    let event = InitiateChange::decode_raw_log(log.topics.iter().copied(), log.data.as_ref())?;
    Ok(ValidatorChange {
        parent_hash: event.parentHash,
        new_set: event.newSet,
    })
}

pub fn node_registry_data_call() -> Bytes {
    nodeRegistryDataCall {}.abi_encode().into()
}

pub fn registry_id_call() -> Bytes {
    registryIdCall {}.abi_encode().into()
}

/// Node count getter for the contract generation.
pub fn total_call(contract_version2: bool) -> Bytes {
    if contract_version2 {
        totalNodesCall {}.abi_encode().into()
    } else {
        totalServersCall {}.abi_encode().into()
    }
}

/// Record getter for node `index` for the contract generation.
pub fn record_call(contract_version2: bool, index: u64) -> Bytes {
    let index = U256::from(index);
    if contract_version2 {
        getIn3NodeInformationCall { index }.abi_encode().into()
    } else {
        serversCall { index }.abi_encode().into()
    }
}

pub fn decode_address(data: &[u8]) -> Result<Address, alloy_sol_types::Error> {
    nodeRegistryDataCall::abi_decode_returns(data)
}

pub fn decode_bytes32(data: &[u8]) -> Result<B256, alloy_sol_types::Error> {
    registryIdCall::abi_decode_returns(data)
}

pub fn decode_total(data: &[u8]) -> Result<U256, alloy_sol_types::Error> {
    totalNodesCall::abi_decode_returns(data)
}

/// Decodes a record returned by `getIn3NodeInformation` or `servers`.
pub fn decode_record(
    contract_version2: bool,
    index: u64,
    data: &[u8],
) -> Result<NodeRecord, alloy_sol_types::Error> {
    if contract_version2 {
        let node = getIn3NodeInformationCall::abi_decode_returns(data)?;
        return Ok(NodeRecord {
            address: node.signer,
            url: node.url,
            index,
            deposit: node.deposit,
            props: U256::from(node.props),
            weight: node.weight,
            register_time: node.registerTime,
            proof_hash: Some(node.proofHash),
            performance: None,
        });
    }
    let server = serversCall::abi_decode_returns(data)?;
    Ok(NodeRecord {
        address: server.owner,
        url: server.url,
        index,
        deposit: server.deposit,
        props: server.props,
        weight: 1,
        register_time: 0,
        proof_hash: None,
        performance: None,
    })
}

pub fn convict_call(
    server_index: u64,
    block_hash: B256,
    block_number: u64,
    v: u8,
    r: B256,
    s: B256,
) -> Bytes {
    convictCall {
        serverIndex: U256::from(server_index),
        blockHash: block_hash,
        blockNumber: U256::from(block_number),
        v,
        r,
        s,
    }
    .abi_encode()
    .into()
}


#[cfg(test)]
mod tests {
    use alloy_sol_types::SolValue;
    use in3_node_types::{U64, keccak256};

    use super::*;

    fn node(index: u64) -> NodeRecord {
        NodeRecord {
            address: Address::repeat_byte(0x10 + index as u8),
            url: format!("https://node{index}.example"),
            index,
            deposit: U256::from(1_000_u64),
            props: U256::from(0xff_u64),
            weight: 3,
            register_time: 1_600_000_000,
            proof_hash: Some(B256::repeat_byte(0xaa)),
            performance: None,
        }
    }

    #[test]
    fn selectors_match_registry_abi() {
        assert_eq!(
            nodeRegistryDataCall::SELECTOR,
            keccak256("nodeRegistryData()")[..4]
        );
        assert_eq!(
            convictCall::SELECTOR,
            keccak256("convict(uint256,bytes32,uint256,uint8,bytes32,bytes32)")[..4]
        );
        assert_eq!(
            getIn3NodeInformationCall::SELECTOR,
            keccak256("getIn3NodeInformation(uint256)")[..4]
        );
        assert_eq!(
            InitiateChange::SIGNATURE_HASH,
            keccak256("InitiateChange(bytes32,address[])")
        );
    }

    #[test]
    fn v2_record_decodes_signer_and_proof_hash() {
        let expected = node(2);
        let decoded = decode_record(true, 2, &encode::v2_record(&expected)).expect("decode");
        assert_eq!(decoded, expected);
    }

    #[test]
    fn legacy_record_uses_owner_as_address() {
        let source = node(1);
        let decoded = decode_record(false, 1, &encode::legacy_record(&source)).expect("decode");
        assert_eq!(decoded.address, source.address);
        assert_eq!(decoded.url, source.url);
        assert_eq!(decoded.proof_hash, None);
    }

    #[test]
    fn truncated_record_fails_to_decode() {
        let mut data = encode::v2_record(&node(0)).to_vec();
        data.truncate(40);
        assert!(decode_record(true, 0, &data).is_err());
    }

    #[test]
    fn decodes_registered_event_and_ignores_foreign_topics() {
        let signer = Address::repeat_byte(7);
        let data = (
            "https://a.example".to_string(),
            U256::from(1_u64),
            signer,
            U256::from(5_u64),
        )
            .abi_encode_params();
        let log = Log {
            address: Address::repeat_byte(1),
            topics: vec![LogNodeRegistered::SIGNATURE_HASH],
            data: data.into(),
            block_number: Some(U64::from(10_u64)),
            block_hash: None,
            transaction_hash: None,
            transaction_index: None,
            log_index: None,
            removed: false,
        };
        let event = decode_registry_log(&log).expect("decode").expect("known event");
        assert_eq!(event.name(), "LogNodeRegistered");
        assert!(matches!(event, RegistryEvent::NodeRegistered { signer: s, .. } if s == signer));

        let foreign = Log {
            topics: vec![B256::repeat_byte(9)],
            ..log
        };
        assert_eq!(decode_registry_log(&foreign).expect("decode"), None);
    }

    #[test]
    fn decodes_initiate_change() {
        let set = vec![Address::repeat_byte(1), Address::repeat_byte(2)];
        let log = Log {
            address: Address::repeat_byte(3),
            topics: vec![InitiateChange::SIGNATURE_HASH, B256::repeat_byte(4)],
            data: (set.clone(),).abi_encode_params().into(),
            block_number: Some(U64::from(20_u64)),
            block_hash: None,
            transaction_hash: None,
            transaction_index: None,
            log_index: None,
            removed: false,
        };
        let change = decode_initiate_change(&log).expect("decode");
        assert_eq!(change.parent_hash, B256::repeat_byte(4));
        assert_eq!(change.new_set, set);
    }
}
