//! Constant-product pool analysis and liquidity monitoring.

use crate::abi;
use crate::chain::ChainClient;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use dream_types::*;
use ethers::types::U256;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

pub const DEPTH_LEVELS: u32 = 10;
pub const IMPACT_SIZES_USD: [u64; 5] = [1_000, 5_000, 10_000, 50_000, 100_000];

const LOW_LIQUIDITY_USD: f64 = 100_000.0;
const HIGH_IMPACT_THRESHOLD: f64 = 0.01;
const MIN_ACTIVE_MAKERS: usize = 3;
const STATE_RETENTION_HOURS: i64 = 24;

const TRADE_LOOKBACK_BLOCKS: u64 = 1000;
const QUOTE_LOOKBACK_BLOCKS: u64 = 100;
const TRADE_LIMIT: usize = 100;

/// Pair state with decimal-adjusted reserves
#[derive(Debug, Clone, PartialEq)]
pub struct PoolInfo {
    pub address: String,
    pub token0: String,
    pub token1: String,
    pub reserve0: f64,
    pub reserve1: f64,
    pub decimals0: u8,
    pub decimals1: u8,
    pub total_supply: f64,
}

impl PoolInfo {
    fn is_token0(&self, token: &str) -> bool {
        token.eq_ignore_ascii_case(&self.token0)
    }

    fn reserves_for(&self, token: &str) -> (f64, f64) {
        if self.is_token0(token) {
            (self.reserve0, self.reserve1)
        } else {
            (self.reserve1, self.reserve0)
        }
    }
}

/// Base (stablecoin) side of a pool, falling back to token0
struct Sides<'a> {
    token: &'a str,
    base_reserve: f64,
    token_reserve: f64,
    has_stablecoin: bool,
}

fn sides<'a>(pool: &'a PoolInfo, stablecoins: &[String]) -> Sides<'a> {
    let is_stable = |t: &str| stablecoins.iter().any(|s| s.eq_ignore_ascii_case(t));

    if is_stable(&pool.token1) && !is_stable(&pool.token0) {
        Sides {
            token: &pool.token0,
            base_reserve: pool.reserve1,
            token_reserve: pool.reserve0,
            has_stablecoin: true,
        }
    } else {
        Sides {
            token: &pool.token1,
            base_reserve: pool.reserve0,
            token_reserve: pool.reserve1,
            has_stablecoin: is_stable(&pool.token0),
        }
    }
}

// =====================================================
// Pool math
// =====================================================

/// Price of `token` in units of the other side of the pool
pub fn token_price(pool: &PoolInfo, token: &str) -> f64 {
    let (token_reserve, base_reserve) = pool.reserves_for(token);
    if token_reserve == 0.0 {
        return 0.0;
    }
    base_reserve / token_reserve
}

/// Total pool value assuming both sides are worth the base side
pub fn liquidity_usd(pool: &PoolInfo, base_token: &str, base_price_usd: f64) -> f64 {
    let (base_reserve, _) = pool.reserves_for(base_token);
    2.0 * base_reserve * base_price_usd
}

/// Input available before moving the price by 1%, 2%, ... `levels`%
pub fn depth_distribution(pool: &PoolInfo, token: &str, levels: u32) -> Vec<DepthLevel> {
    let (token_reserve, _) = pool.reserves_for(token);
    (1..=levels)
        .map(|i| {
            let d = i as f64 / 100.0;
            DepthLevel {
                impact_pct: i,
                max_input: token_reserve * (1.0 - 1.0 / (1.0 + d)),
            }
        })
        .collect()
}

/// Fractional price move from buying `size_usd` worth of the non-base token.
/// Orders that would drain the pool report 1.0.
pub fn price_impact(pool: &PoolInfo, size_usd: f64, stablecoins: &[String]) -> f64 {
    let s = sides(pool, stablecoins);
    let price = token_price(pool, s.token);
    if price == 0.0 {
        return 0.0;
    }

    let tokens = size_usd / price;
    let new_token_reserve = s.token_reserve - tokens;
    if new_token_reserve <= 0.0 {
        return 1.0;
    }

    let new_price = s.base_reserve / new_token_reserve;
    ((new_price - price) / price).abs()
}

pub fn market_impact(pool: &PoolInfo, stablecoins: &[String]) -> BTreeMap<String, f64> {
    IMPACT_SIZES_USD
        .iter()
        .map(|size| (format!("impact_{}", size), price_impact(pool, *size as f64, stablecoins)))
        .collect()
}

/// USD liquidity for stablecoin pairs, raw reserve sum otherwise
pub fn pair_liquidity(pool: &PoolInfo, stablecoins: &[String]) -> f64 {
    let s = sides(pool, stablecoins);
    if s.has_stablecoin {
        2.0 * s.base_reserve
    } else {
        pool.reserve0 + pool.reserve1
    }
}

fn net_amount(out: U256, input: U256) -> (f64, String) {
    if out >= input {
        let d = out - input;
        (abi::to_units(d, 0), d.to_string())
    } else {
        let d = input - out;
        (-abi::to_units(d, 0), format!("-{}", d))
    }
}

/// Net amounts and execution price of a Swap. None when either side nets to zero.
pub fn trade_from_swap(amounts: [U256; 4]) -> Option<(String, String, f64)> {
    let [amount0_in, amount1_in, amount0_out, amount1_out] = amounts;
    let (net0, net0_str) = net_amount(amount0_out, amount0_in);
    let (net1, net1_str) = net_amount(amount1_out, amount1_in);
    if net0 == 0.0 || net1 == 0.0 {
        return None;
    }
    Some((net0_str, net1_str, (net1 / net0).abs()))
}

/// Reserves read at one block
#[derive(Debug, Clone, PartialEq)]
pub struct ReserveSnapshot {
    pub block_number: u64,
    pub timestamp: u64,
    pub reserve0: f64,
    pub reserve1: f64,
}

/// Implied maker quotes: one per reserve change, 0.5% either side of the
/// pool price, sized at a tenth of the smaller reserve
pub fn quotes_from_reserves(maker: &str, snapshots: &[ReserveSnapshot]) -> Vec<Quote> {
    snapshots
        .windows(2)
        .filter(|w| w[0].reserve0 != w[1].reserve0 || w[0].reserve1 != w[1].reserve1)
        .filter(|w| w[1].reserve0 > 0.0)
        .map(|w| {
            let current = &w[1];
            let price = current.reserve1 / current.reserve0;
            Quote {
                maker_address: maker.to_string(),
                bid_price: price * 0.995,
                ask_price: price * 1.005,
                size: current.reserve0.min(current.reserve1) / 10.0,
                block_number: current.block_number,
                observed_at: current.timestamp,
            }
        })
        .collect()
}

pub fn maker_stats(trades: &[Trade], quotes: &[Quote]) -> MakerStats {
    if trades.is_empty() || quotes.is_empty() {
        return MakerStats::default();
    }

    let makers: BTreeSet<&str> = quotes.iter().map(|q| q.maker_address.as_str()).collect();

    let spreads: Vec<f64> = quotes
        .iter()
        .filter(|q| q.bid_price > 0.0 && q.ask_price > 0.0)
        .map(|q| (q.ask_price - q.bid_price) / q.bid_price)
        .collect();

    let mut updates: HashMap<&str, Vec<u64>> = HashMap::new();
    for q in quotes {
        updates.entry(q.maker_address.as_str()).or_default().push(q.observed_at);
    }

    // Updates per hour, averaged across makers with at least two quotes
    let rates: Vec<f64> = updates
        .into_values()
        .filter_map(|mut times| {
            if times.len() < 2 {
                return None;
            }
            times.sort_unstable();
            let gaps: Vec<f64> = times.windows(2).map(|w| (w[1] - w[0]) as f64 / 3600.0).collect();
            let mean_gap = gaps.iter().sum::<f64>() / gaps.len() as f64;
            (mean_gap > 0.0).then(|| 1.0 / mean_gap)
        })
        .collect();

    let mean = |v: &[f64]| if v.is_empty() { 0.0 } else { v.iter().sum::<f64>() / v.len() as f64 };
    let sizes: Vec<f64> = quotes.iter().map(|q| q.size).collect();

    MakerStats {
        active_makers: makers.len(),
        avg_quote_size: mean(&sizes),
        quote_refresh_rate: mean(&rates),
        avg_spread: mean(&spreads),
        min_spread: spreads.iter().cloned().fold(None, |m: Option<f64>, s| Some(m.map_or(s, |m| m.min(s)))).unwrap_or(0.0),
        max_spread: spreads.iter().cloned().fold(None, |m: Option<f64>, s| Some(m.map_or(s, |m| m.max(s)))).unwrap_or(0.0),
        quote_count: quotes.len(),
        trade_count: trades.len(),
        top_makers: makers.iter().take(5).map(|m| m.to_string()).collect(),
    }
}

// =====================================================
// Pool source
// =====================================================

#[async_trait]
pub trait PoolSource: Send + Sync {
    async fn pool_info(&self, pair: &str) -> Result<PoolInfo, String>;
    async fn recent_trades(&self, pair: &str) -> Result<Vec<Trade>, String>;
    async fn active_quotes(&self, pair: &str) -> Result<Vec<Quote>, String>;
}

/// Pair fields that never change after creation
#[derive(Debug, Clone)]
struct PairMeta {
    token0: String,
    token1: String,
    decimals0: u8,
    decimals1: u8,
}

/// Reads Uniswap V2 style pairs through the chain client.
/// Token metadata is cached; reserves and supply are read on every call.
pub struct PoolFetcher {
    chain: Arc<dyn ChainClient>,
    cache: DashMap<String, PairMeta>,
}

impl PoolFetcher {
    pub fn new(chain: Arc<dyn ChainClient>) -> Self {
        Self {
            chain,
            cache: DashMap::new(),
        }
    }

    async fn read_reserves(&self, pair: &str, block: Option<u64>) -> Result<(U256, U256, u32), String> {
        let data = self
            .chain
            .call(pair, abi::GET_RESERVES_SELECTOR.to_vec(), block)
            .await?;
        abi::decode_reserves(&data)
    }

    async fn read_decimals(&self, token: &str) -> Result<u8, String> {
        let data = self.chain.call(token, abi::DECIMALS_SELECTOR.to_vec(), None).await?;
        abi::decode_decimals(&data)
    }

    async fn read_address(&self, pair: &str, selector: [u8; 4]) -> Result<String, String> {
        let data = self.chain.call(pair, selector.to_vec(), None).await?;
        Ok(format!("{:?}", abi::decode_address(&data)?))
    }

    async fn pair_meta(&self, key: &str, pair: &str) -> Result<PairMeta, String> {
        if let Some(cached) = self.cache.get(key) {
            return Ok(cached.value().clone());
        }

        let token0 = self.read_address(pair, abi::TOKEN0_SELECTOR).await?;
        let token1 = self.read_address(pair, abi::TOKEN1_SELECTOR).await?;
        let meta = PairMeta {
            decimals0: self.read_decimals(&token0).await?,
            decimals1: self.read_decimals(&token1).await?,
            token0,
            token1,
        };
        self.cache.insert(key.to_string(), meta.clone());
        Ok(meta)
    }
}

#[async_trait]
impl PoolSource for PoolFetcher {
    async fn pool_info(&self, pair: &str) -> Result<PoolInfo, String> {
        let key = pair.to_lowercase();
        let meta = self.pair_meta(&key, pair).await?;

        let (r0, r1, _) = self.read_reserves(pair, None).await?;
        let supply = self
            .chain
            .call(pair, abi::TOTAL_SUPPLY_SELECTOR.to_vec(), None)
            .await
            .and_then(|d| abi::decode_uint(&d))?;

        Ok(PoolInfo {
            address: key,
            reserve0: abi::to_units(r0, meta.decimals0),
            reserve1: abi::to_units(r1, meta.decimals1),
            total_supply: abi::to_units(supply, 0),
            token0: meta.token0,
            token1: meta.token1,
            decimals0: meta.decimals0,
            decimals1: meta.decimals1,
        })
    }

    async fn recent_trades(&self, pair: &str) -> Result<Vec<Trade>, String> {
        let head = self.chain.block_number().await?;
        let from = head.saturating_sub(TRADE_LOOKBACK_BLOCKS);
        let logs = self
            .chain
            .get_logs(pair, abi::event_topic(abi::SWAP_EVENT_SIGNATURE), from, head)
            .await?;

        let mut trades = Vec::new();
        for log in logs.iter().take(TRADE_LIMIT) {
            let Ok(amounts) = abi::decode_swap_amounts(&log.data) else {
                continue;
            };
            let Some((amount0, amount1, price)) = trade_from_swap(amounts) else {
                continue;
            };
            let topic_address = |i: usize| {
                log.topics
                    .get(i)
                    .map(|t| format!("0x{}", hex::encode(&t.as_bytes()[12..])))
                    .unwrap_or_default()
            };
            trades.push(Trade {
                tx_hash: log.tx_hash.clone(),
                sender: topic_address(1),
                receiver: topic_address(2),
                amount0,
                amount1,
                price,
                block_number: log.block_number,
            });
        }
        Ok(trades)
    }

    async fn active_quotes(&self, pair: &str) -> Result<Vec<Quote>, String> {
        let head = self.chain.block_number().await?;
        let start = head.saturating_sub(QUOTE_LOOKBACK_BLOCKS);

        let mut snapshots = Vec::new();
        for block in start..head {
            // Blocks the node cannot serve are skipped
            if let Ok((r0, r1, ts)) = self.read_reserves(pair, Some(block)).await {
                snapshots.push(ReserveSnapshot {
                    block_number: block,
                    timestamp: ts as u64,
                    reserve0: abi::to_units(r0, 0),
                    reserve1: abi::to_units(r1, 0),
                });
            }
        }
        Ok(quotes_from_reserves(&pair.to_lowercase(), &snapshots))
    }
}

// =====================================================
// Monitor
// =====================================================

pub struct LiquidityMonitor {
    source: Arc<dyn PoolSource>,
    stablecoins: Vec<String>,
    states: Mutex<HashMap<String, Vec<(DateTime<Utc>, LiquidityState)>>>,
    alerts: Mutex<Vec<(DateTime<Utc>, LiquidityAlert)>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl LiquidityMonitor {
    pub fn new(source: Arc<dyn PoolSource>, stablecoins: Vec<String>) -> Self {
        Self {
            source,
            stablecoins,
            states: Mutex::new(HashMap::new()),
            alerts: Mutex::new(Vec::new()),
        }
    }

    /// Analyze every pair, store the state, raise alerts and prune old states
    pub async fn monitor(
        &self,
        token_address: &str,
        symbol: &str,
        pairs: &[String],
    ) -> Result<LiquidityState, String> {
        abi::parse_address(token_address)?;
        if pairs.is_empty() {
            return Err("At least one pair is required".to_string());
        }

        let now = Utc::now();
        let state = self.analyze(symbol, pairs, now).await;
        self.record_state(state.clone(), now);
        Ok(state)
    }

    async fn analyze(&self, symbol: &str, pairs: &[String], now: DateTime<Utc>) -> LiquidityState {
        let mut state = LiquidityState {
            token: symbol.to_string(),
            observed_at: now.to_rfc3339(),
            total_liquidity: 0.0,
            active_pairs: Vec::new(),
            best_pair: None,
            depth_distribution: BTreeMap::new(),
            market_impact: BTreeMap::new(),
            maker_stats: BTreeMap::new(),
        };
        let mut best_liquidity = 0.0;

        for pair in pairs {
            let pool = match self.source.pool_info(pair).await {
                Ok(p) => p,
                Err(e) => {
                    log::warn!("[LIQUIDITY] Skipping pair {}: {}", pair, e);
                    continue;
                }
            };

            let liquidity = pair_liquidity(&pool, &self.stablecoins);
            if liquidity <= 0.0 {
                continue;
            }

            state.active_pairs.push(pair.clone());
            state.total_liquidity += liquidity;
            if liquidity > best_liquidity {
                best_liquidity = liquidity;
                state.best_pair = Some(pair.clone());
            }

            let token = sides(&pool, &self.stablecoins).token.to_string();
            state
                .depth_distribution
                .insert(pair.clone(), depth_distribution(&pool, &token, DEPTH_LEVELS));
            state
                .market_impact
                .insert(pair.clone(), market_impact(&pool, &self.stablecoins));

            let trades = self.source.recent_trades(pair).await.unwrap_or_else(|e| {
                log::warn!("[LIQUIDITY] No trades for {}: {}", pair, e);
                Vec::new()
            });
            let quotes = self.source.active_quotes(pair).await.unwrap_or_else(|e| {
                log::warn!("[LIQUIDITY] No quotes for {}: {}", pair, e);
                Vec::new()
            });
            state.maker_stats.insert(pair.clone(), maker_stats(&trades, &quotes));
        }

        state
    }

    fn record_state(&self, state: LiquidityState, now: DateTime<Utc>) {
        let cutoff = now - Duration::hours(STATE_RETENTION_HOURS);

        let raised = check_alerts(&state, now);
        for alert in &raised {
            log::warn!("[LIQUIDITY] {:?}: {}", alert.kind, alert.message);
        }
        {
            let mut alerts = lock(&self.alerts);
            alerts.extend(raised.into_iter().map(|a| (now, a)));
            alerts.retain(|(at, _)| *at > cutoff);
        }

        let mut states = lock(&self.states);
        let history = states.entry(state.token.clone()).or_default();
        history.push((now, state));
        history.retain(|(at, _)| *at > cutoff);
    }

    /// Latest state and its change against the previous one
    pub fn summary(&self, symbol: &str) -> Option<LiquiditySummary> {
        let states = lock(&self.states);
        let history = states.get(symbol)?;
        let (_, latest) = history.last()?;

        let change = match history.len().checked_sub(2).map(|i| &history[i].1) {
            Some(previous) if previous.total_liquidity > 0.0 => {
                (latest.total_liquidity - previous.total_liquidity) / previous.total_liquidity
            }
            _ => 0.0,
        };

        Some(LiquiditySummary {
            observed_at: latest.observed_at.clone(),
            total_liquidity: latest.total_liquidity,
            liquidity_change: change,
            active_pairs: latest.active_pairs.len(),
            best_pair: latest.best_pair.clone(),
            depth_distribution: latest.depth_distribution.clone(),
            market_impact: latest.market_impact.clone(),
            maker_stats: latest.maker_stats.clone(),
        })
    }

    pub fn alerts(&self, symbol: Option<&str>) -> Vec<LiquidityAlert> {
        lock(&self.alerts)
            .iter()
            .map(|(_, a)| a)
            .filter(|a| symbol.is_none_or(|s| a.token == s))
            .cloned()
            .collect()
    }

    pub fn state_count(&self, symbol: &str) -> usize {
        lock(&self.states).get(symbol).map(|h| h.len()).unwrap_or(0)
    }
}

fn check_alerts(state: &LiquidityState, now: DateTime<Utc>) -> Vec<LiquidityAlert> {
    let mut alerts = Vec::new();
    let mut raise = |kind, message: String| {
        alerts.push(LiquidityAlert {
            raised_at: now.to_rfc3339(),
            token: state.token.clone(),
            kind,
            message,
        })
    };

    if state.total_liquidity < LOW_LIQUIDITY_USD {
        raise(
            LiquidityAlertKind::LowLiquidity,
            format!("Total liquidity below threshold: ${:.2}", state.total_liquidity),
        );
    }

    for (pair, impacts) in &state.market_impact {
        let impact = impacts.get("impact_10000").copied().unwrap_or(0.0);
        if impact > HIGH_IMPACT_THRESHOLD {
            raise(
                LiquidityAlertKind::HighImpact,
                format!("High market impact in {}: {:.2}%", pair, impact * 100.0),
            );
        }
    }

    for (pair, stats) in &state.maker_stats {
        if stats.active_makers < MIN_ACTIVE_MAKERS {
            raise(
                LiquidityAlertKind::LowMakerCount,
                format!("Low market maker count in {}: {}", pair, stats.active_makers),
            );
        }
    }

    alerts
}
