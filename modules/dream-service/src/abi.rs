//! ABI encoding/decoding helpers
//!
//! Manual ABI encoding for dream, pair, ERC20 and distributor calls without
//! the abigen! macro, plus event definitions for the listener.

use ethers::abi::{AbiDecode, Event, HumanReadableParser, ParamType, RawLog, Token};
use ethers::types::{Address, H256, I256, U256};
use ethers::utils::keccak256;
use serde_json::{Map, Value};
use std::str::FromStr;

/// Function selector for balanceOf(address)
pub const BALANCE_OF_SELECTOR: [u8; 4] = [0x70, 0xa0, 0x82, 0x31];

/// Function selector for decimals()
pub const DECIMALS_SELECTOR: [u8; 4] = [0x31, 0x3c, 0xe5, 0x67];

/// Function selector for totalSupply()
pub const TOTAL_SUPPLY_SELECTOR: [u8; 4] = [0x18, 0x16, 0x0d, 0xdd];

/// Function selector for token0()
pub const TOKEN0_SELECTOR: [u8; 4] = [0x0d, 0xfe, 0x16, 0x81];

/// Function selector for token1()
pub const TOKEN1_SELECTOR: [u8; 4] = [0xd2, 0x12, 0x20, 0xa7];

/// Function selector for getReserves()
pub const GET_RESERVES_SELECTOR: [u8; 4] = [0x09, 0x02, 0xf1, 0xac];

pub const RECORD_DREAM_SIGNATURE: &str = "recordDream(string)";
pub const UPDATE_PERFORMANCE_SIGNATURE: &str =
    "updatePerformance(address,uint256,uint256,uint256,uint256,uint256)";
pub const DISTRIBUTE_REWARDS_SIGNATURE: &str = "distributeRewards(address)";
pub const FORCE_REBALANCE_SIGNATURE: &str = "forceRebalance()";
pub const SWAP_EVENT_SIGNATURE: &str = "Swap(address,uint256,uint256,uint256,uint256,address)";

/// Events the listener knows how to capture, with fallback definitions for
/// deployments whose stored ABI does not describe them.
pub const KNOWN_EVENTS: [&str; 6] = [
    "event DreamRecorded(address indexed dreamer, string dream)",
    "event DreamSubmitted(address indexed dreamer, uint256 indexed dreamId, bytes dreamData)",
    "event Transfer(address indexed from, address indexed to, uint256 value)",
    "event TokensMinted(address indexed to, uint256 amount)",
    "event Staked(address indexed user, uint256 amount)",
    "event RewardsClaimed(address indexed user, uint256 amount)",
];

/// First four bytes of keccak256 of a function signature
pub fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

/// keccak256 of an event signature, as used for topic0
pub fn event_topic(signature: &str) -> H256 {
    H256::from(keccak256(signature.as_bytes()))
}

fn encode_call(selector: [u8; 4], tokens: &[Token]) -> Vec<u8> {
    let mut data = selector.to_vec();
    data.extend_from_slice(&ethers::abi::encode(tokens));
    data
}

pub fn parse_address(address: &str) -> Result<Address, String> {
    Address::from_str(address.trim()).map_err(|e| format!("Invalid address '{}': {}", address, e))
}

// =====================================================
// Dream and distributor calls
// =====================================================

/// Encode a recordDream(string) call
pub fn encode_record_dream(dream: &str) -> Vec<u8> {
    encode_call(
        selector(RECORD_DREAM_SIGNATURE),
        &[Token::String(dream.to_string())],
    )
}

/// Encode updatePerformance(agent, dream, mind, lucid, successful, total)
pub fn encode_update_performance(agent: Address, values: [u64; 5]) -> Vec<u8> {
    let mut tokens = vec![Token::Address(agent)];
    tokens.extend(values.iter().map(|v| Token::Uint(U256::from(*v))));
    encode_call(selector(UPDATE_PERFORMANCE_SIGNATURE), &tokens)
}

pub fn encode_distribute_rewards(token: Address) -> Vec<u8> {
    encode_call(selector(DISTRIBUTE_REWARDS_SIGNATURE), &[Token::Address(token)])
}

pub fn encode_force_rebalance() -> Vec<u8> {
    selector(FORCE_REBALANCE_SIGNATURE).to_vec()
}

// =====================================================
// ERC20 and pair calls
// =====================================================

/// Encode a balanceOf(address) call
pub fn encode_balance_of(address: Address) -> Vec<u8> {
    encode_call(BALANCE_OF_SELECTOR, &[Token::Address(address)])
}

/// Decode a single uint256 word
pub fn decode_uint(data: &[u8]) -> Result<U256, String> {
    if data.len() < 32 {
        return Err(format!("uint256 response too short: {} bytes", data.len()));
    }
    U256::decode(&data[..32]).map_err(|e| format!("Failed to decode uint256: {}", e))
}

/// Decode a decimals response (uint8)
pub fn decode_decimals(data: &[u8]) -> Result<u8, String> {
    let value = decode_uint(data)?;
    if value > U256::from(255u8) {
        return Err("Decimals value too large".to_string());
    }
    Ok(value.as_u32() as u8)
}

/// Decode an address returned in a 32-byte word
pub fn decode_address(data: &[u8]) -> Result<Address, String> {
    if data.len() < 32 {
        return Err(format!("Address response too short: {} bytes", data.len()));
    }
    Ok(Address::from_slice(&data[12..32]))
}

/// Decode getReserves() into (reserve0, reserve1, blockTimestampLast)
pub fn decode_reserves(data: &[u8]) -> Result<(U256, U256, u32), String> {
    if data.len() < 96 {
        return Err(format!("Reserves response too short: {} bytes", data.len()));
    }
    let reserve0 = U256::from_big_endian(&data[0..32]);
    let reserve1 = U256::from_big_endian(&data[32..64]);
    let timestamp = U256::from_big_endian(&data[64..96]);
    Ok((reserve0, reserve1, timestamp.low_u32()))
}

/// Decode the four uint256 amounts of a Uniswap V2 Swap log's data
pub fn decode_swap_amounts(data: &[u8]) -> Result<[U256; 4], String> {
    if data.len() < 128 {
        return Err(format!("Swap data too short: {} bytes", data.len()));
    }
    Ok([
        U256::from_big_endian(&data[0..32]),
        U256::from_big_endian(&data[32..64]),
        U256::from_big_endian(&data[64..96]),
        U256::from_big_endian(&data[96..128]),
    ])
}

/// Scale a raw integer amount down by `decimals`
pub fn to_units(raw: U256, decimals: u8) -> f64 {
    let value: f64 = raw.to_string().parse().unwrap_or(f64::MAX);
    value / 10f64.powi(decimals as i32)
}

// =====================================================
// Constructors
// =====================================================

/// ABI-encode constructor arguments and append them to the bytecode
pub fn encode_deploy_data(abi: &Value, bytecode: &str, args: &[Value]) -> Result<Vec<u8>, String> {
    let code = hex::decode(bytecode.trim().trim_start_matches("0x"))
        .map_err(|e| format!("Invalid bytecode hex: {}", e))?;

    if code.is_empty() {
        return Err("Bytecode is empty".to_string());
    }

    let parsed: ethers::abi::Abi = serde_json::from_value(abi.clone())
        .map_err(|e| format!("Invalid contract ABI: {}", e))?;

    let constructor = match parsed.constructor() {
        Some(c) => c,
        None => {
            if !args.is_empty() {
                return Err(format!(
                    "Contract has no constructor but {} args were given",
                    args.len()
                ));
            }
            return Ok(code);
        }
    };

    if constructor.inputs.len() != args.len() {
        return Err(format!(
            "Constructor expects {} args, got {}",
            constructor.inputs.len(),
            args.len()
        ));
    }

    let tokens = constructor
        .inputs
        .iter()
        .zip(args)
        .map(|(param, value)| json_to_token(&param.kind, value))
        .collect::<Result<Vec<_>, _>>()?;

    constructor
        .encode_input(code, &tokens)
        .map_err(|e| format!("Failed to encode constructor args: {}", e))
}

/// Convert a JSON value into an ABI token of the given type
pub fn json_to_token(kind: &ParamType, value: &Value) -> Result<Token, String> {
    match kind {
        ParamType::Address => {
            let s = value.as_str().ok_or("Expected address string")?;
            Ok(Token::Address(parse_address(s)?))
        }
        ParamType::Uint(_) => Ok(Token::Uint(json_to_u256(value)?)),
        ParamType::Int(_) => {
            let raw = match value {
                Value::Number(n) => n.to_string(),
                Value::String(s) => s.clone(),
                _ => return Err(format!("Expected integer, got {}", value)),
            };
            let parsed = I256::from_dec_str(&raw)
                .map_err(|e| format!("Invalid int '{}': {}", raw, e))?;
            Ok(Token::Int(parsed.into_raw()))
        }
        ParamType::Bool => value
            .as_bool()
            .map(Token::Bool)
            .ok_or_else(|| format!("Expected bool, got {}", value)),
        ParamType::String => value
            .as_str()
            .map(|s| Token::String(s.to_string()))
            .ok_or_else(|| format!("Expected string, got {}", value)),
        ParamType::Bytes => Ok(Token::Bytes(json_to_bytes(value)?)),
        ParamType::FixedBytes(size) => {
            let bytes = json_to_bytes(value)?;
            if bytes.len() != *size {
                return Err(format!("Expected {} bytes, got {}", size, bytes.len()));
            }
            Ok(Token::FixedBytes(bytes))
        }
        ParamType::Array(inner) => {
            let items = value.as_array().ok_or("Expected array")?;
            let tokens = items
                .iter()
                .map(|v| json_to_token(inner, v))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Token::Array(tokens))
        }
        other => Err(format!("Unsupported constructor parameter type: {}", other)),
    }
}

fn json_to_u256(value: &Value) -> Result<U256, String> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .map(U256::from)
            .ok_or_else(|| format!("Expected unsigned integer, got {}", n)),
        Value::String(s) if s.starts_with("0x") => {
            U256::from_str_radix(&s[2..], 16).map_err(|e| format!("Invalid uint '{}': {}", s, e))
        }
        Value::String(s) => {
            U256::from_dec_str(s).map_err(|e| format!("Invalid uint '{}': {}", s, e))
        }
        _ => Err(format!("Expected unsigned integer, got {}", value)),
    }
}

fn json_to_bytes(value: &Value) -> Result<Vec<u8>, String> {
    let s = value.as_str().ok_or("Expected hex string")?;
    hex::decode(s.trim_start_matches("0x")).map_err(|e| format!("Invalid hex bytes: {}", e))
}

// =====================================================
// Events
// =====================================================

pub fn parse_event(definition: &str) -> Result<Event, String> {
    HumanReadableParser::parse_event(definition)
        .map_err(|e| format!("Invalid event definition '{}': {}", definition, e))
}

/// The known events available for a deployment.
///
/// Events described by the deployment's own ABI win; otherwise every known
/// definition is watched.
pub fn events_for_abi(abi: &Value) -> Vec<Event> {
    let from_abi: Vec<Event> = serde_json::from_value::<ethers::abi::Abi>(abi.clone())
        .map(|parsed| {
            parsed
                .events()
                .filter(|e| {
                    KNOWN_EVENTS
                        .iter()
                        .any(|def| def.starts_with(&format!("event {}(", e.name)))
                })
                .cloned()
                .collect()
        })
        .unwrap_or_default();

    if !from_abi.is_empty() {
        return from_abi;
    }

    KNOWN_EVENTS
        .iter()
        .filter_map(|def| parse_event(def).ok())
        .collect()
}

/// Decode a log's topics and data into named JSON args
pub fn decode_event_args(
    event: &Event,
    topics: Vec<H256>,
    data: Vec<u8>,
) -> Result<Map<String, Value>, String> {
    let log = event
        .parse_log(RawLog { topics, data })
        .map_err(|e| format!("Failed to decode {} log: {}", event.name, e))?;

    Ok(log
        .params
        .into_iter()
        .map(|p| (p.name, token_to_json(&p.value)))
        .collect())
}

/// Render a decoded token as JSON, with addresses lowercased and big
/// integers as decimal strings
pub fn token_to_json(token: &Token) -> Value {
    match token {
        Token::Address(a) => Value::String(format!("{:?}", a).to_lowercase()),
        Token::Uint(u) => Value::String(u.to_string()),
        Token::Int(i) => Value::String(I256::from_raw(*i).to_string()),
        Token::Bool(b) => Value::Bool(*b),
        Token::String(s) => Value::String(s.clone()),
        Token::Bytes(b) | Token::FixedBytes(b) => Value::String(format!("0x{}", hex::encode(b))),
        Token::Array(items) | Token::FixedArray(items) | Token::Tuple(items) => {
            Value::Array(items.iter().map(token_to_json).collect())
        }
    }
}
