use crate::error::GatewayError;
use crate::shard::{ShardConfig, ShardSuffix};
use arc_swap::ArcSwap;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// The live router pointer. Writers publish a whole new router with a single
/// atomic store; readers snapshot it once per request and never block.
pub type SharedRouter = Arc<ArcSwap<ShardRouter>>;

/// Routes requests to upstream shards by binary request-id suffix.
///
/// Immutable once built. The `Failsafe` variant is installed when startup
/// config loading from the database fails: it rejects every routing attempt
/// but keeps the admin surface reachable so the configuration can be fixed.
#[derive(Debug)]
pub enum ShardRouter {
    Routing(RoutingTable),
    Failsafe,
}

/// A resolved routing decision.
#[derive(Debug, Clone, PartialEq)]
pub struct ShardTarget {
    pub shard_id: i32,
    pub url: String,
}

#[derive(Debug)]
pub struct RoutingTable {
    /// Config schema version from the source document.
    version: i32,

    /// Database record id this table was built from, if it came from the DB.
    config_id: Option<i32>,

    /// Shards sorted longest-suffix-first so the first match wins.
    shards: Vec<(ShardSuffix, ShardTarget)>,

    /// Exact lookup by shard id.
    by_id: HashMap<i32, ShardTarget>,

    /// Distinct target URLs, each with the lowest shard id serving it.
    distinct_targets: Vec<ShardTarget>,
}

impl ShardRouter {
    /// Build a router from a parsed config.
    ///
    /// Fails if the shard list is empty, any id is non-positive or repeated,
    /// any URL is not plain http(s), or any suffix is a prefix of another
    /// (which would make routing ambiguous).
    pub fn from_config(config: &ShardConfig) -> Result<Self, GatewayError> {
        if config.shards.is_empty() {
            return Err(GatewayError::InvalidShardConfig(
                "shard list is empty".into(),
            ));
        }

        let mut shards: Vec<(ShardSuffix, ShardTarget)> = Vec::with_capacity(config.shards.len());
        let mut by_id = HashMap::with_capacity(config.shards.len());

        for entry in &config.shards {
            let suffix = ShardSuffix::from_shard_id(entry.id)?;
            if !entry.url.starts_with("http://") && !entry.url.starts_with("https://") {
                return Err(GatewayError::InvalidShardConfig(format!(
                    "shard {} has a non-http url: {}",
                    entry.id, entry.url
                )));
            }
            let target = ShardTarget {
                shard_id: entry.id,
                url: entry.url.trim_end_matches('/').to_string(),
            };
            if by_id.insert(entry.id, target.clone()).is_some() {
                return Err(GatewayError::InvalidShardConfig(format!(
                    "duplicate shard id {}",
                    entry.id
                )));
            }
            shards.push((suffix, target));
        }

        for (i, (a, ta)) in shards.iter().enumerate() {
            for (b, tb) in shards.iter().skip(i + 1) {
                if a.is_prefix_of(b) || b.is_prefix_of(a) {
                    return Err(GatewayError::InvalidShardConfig(format!(
                        "shards {} and {} overlap: suffix {} is a prefix of {}",
                        ta.shard_id, tb.shard_id, a.min_by_len(b), a.max_by_len(b)
                    )));
                }
            }
        }

        // Longest suffix first; ties broken by shard id for determinism.
        shards.sort_by(|(a, ta), (b, tb)| {
            b.len.cmp(&a.len).then(ta.shard_id.cmp(&tb.shard_id))
        });

        let mut distinct_targets: Vec<ShardTarget> = Vec::new();
        let mut ids: Vec<i32> = by_id.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            let t = &by_id[&id];
            if !distinct_targets.iter().any(|d| d.url == t.url) {
                distinct_targets.push(t.clone());
            }
        }

        Ok(ShardRouter::Routing(RoutingTable {
            version: config.version,
            config_id: None,
            shards,
            by_id,
            distinct_targets,
        }))
    }

    /// Tag the router with the DB record id it was built from.
    pub fn with_config_id(self, id: i32) -> Self {
        match self {
            ShardRouter::Routing(mut table) => {
                table.config_id = Some(id);
                ShardRouter::Routing(table)
            }
            failsafe => failsafe,
        }
    }

    /// Check that the suffix set is a complete prefix code: every possible
    /// request-id tail must be covered by exactly one shard.
    pub fn validate(&self) -> Result<(), GatewayError> {
        let table = match self {
            ShardRouter::Routing(t) => t,
            ShardRouter::Failsafe => return Ok(()),
        };

        let max_len = table.shards.iter().map(|(s, _)| s.len).max().unwrap_or(0);

        // Kraft equality: sum of 2^(max_len - len) over all shards must equal
        // 2^max_len. Prefix-freedom is established at construction, so a
        // shortfall means an uncovered tail and an excess is impossible.
        let covered: u64 = table
            .shards
            .iter()
            .map(|(s, _)| 1u64 << (max_len - s.len))
            .sum();
        if covered == 1u64 << max_len {
            return Ok(());
        }

        let uncovered = find_uncovered(&table.shards, max_len)
            .map(|s| s.to_string())
            .unwrap_or_else(|| "?".into());
        Err(GatewayError::InvalidShardConfig(format!(
            "incomplete shard coverage: no shard covers suffix {uncovered}"
        )))
    }

    /// Route by hex request id: interpret the last bits of the id and find
    /// the shard whose suffix matches. Accepts an optional `0x` prefix,
    /// case-insensitive; ids shorter than 64 hex chars are rejected.
    pub fn route_by_request_id(&self, request_id: &str) -> Result<ShardTarget, GatewayError> {
        let tail = parse_request_id_tail(request_id)?;
        let table = self.routing_table()?;
        for (suffix, target) in &table.shards {
            if suffix.matches_tail(tail) {
                return Ok(target.clone());
            }
        }
        // Unreachable for validated configs; surfaces on unvalidated ones.
        warn!(request_id, "no shard covers request id tail");
        Err(GatewayError::InvalidShardConfig(format!(
            "no shard covers request id tail {tail:b}"
        )))
    }

    /// Exact lookup by shard id.
    pub fn route_by_shard_id(&self, shard_id: i32) -> Result<Option<ShardTarget>, GatewayError> {
        let table = self.routing_table()?;
        Ok(table.by_id.get(&shard_id).cloned())
    }

    /// Uniform pick over the distinct target URLs (duplicates collapse).
    pub fn random_target(&self) -> Result<ShardTarget, GatewayError> {
        let table = self.routing_table()?;
        let idx = rand::thread_rng().gen_range(0..table.distinct_targets.len());
        Ok(table.distinct_targets[idx].clone())
    }

    /// All distinct target URLs.
    pub fn all_targets(&self) -> Vec<String> {
        match self {
            ShardRouter::Routing(t) => t.distinct_targets.iter().map(|t| t.url.clone()).collect(),
            ShardRouter::Failsafe => Vec::new(),
        }
    }

    pub fn is_failsafe(&self) -> bool {
        matches!(self, ShardRouter::Failsafe)
    }

    pub fn config_id(&self) -> Option<i32> {
        match self {
            ShardRouter::Routing(t) => t.config_id,
            ShardRouter::Failsafe => None,
        }
    }

    pub fn version(&self) -> Option<i32> {
        match self {
            ShardRouter::Routing(t) => Some(t.version),
            ShardRouter::Failsafe => None,
        }
    }

    pub fn shard_count(&self) -> usize {
        match self {
            ShardRouter::Routing(t) => t.shards.len(),
            ShardRouter::Failsafe => 0,
        }
    }

    fn routing_table(&self) -> Result<&RoutingTable, GatewayError> {
        match self {
            ShardRouter::Routing(t) => Ok(t),
            ShardRouter::Failsafe => Err(GatewayError::RoutingUnavailable),
        }
    }

    /// Fresh shared pointer, as published to the request and payment paths.
    pub fn into_shared(self) -> SharedRouter {
        Arc::new(ArcSwap::new(Arc::new(self)))
    }
}

impl ShardSuffix {
    fn min_by_len<'a>(&'a self, other: &'a ShardSuffix) -> &'a ShardSuffix {
        if self.len <= other.len {
            self
        } else {
            other
        }
    }

    fn max_by_len<'a>(&'a self, other: &'a ShardSuffix) -> &'a ShardSuffix {
        if self.len <= other.len {
            other
        } else {
            self
        }
    }
}

/// Parse a hex request id and return its last 32 bits.
pub fn parse_request_id_tail(request_id: &str) -> Result<u32, GatewayError> {
    let hex = request_id
        .strip_prefix("0x")
        .or_else(|| request_id.strip_prefix("0X"))
        .unwrap_or(request_id);

    if hex.len() < 64 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(GatewayError::BadRequest("invalid request ID format".into()));
    }

    let tail_hex = &hex[hex.len() - 8..];
    u32::from_str_radix(tail_hex, 16)
        .map_err(|_| GatewayError::BadRequest("invalid request ID format".into()))
}

/// Depth-first search for a tail no shard covers, up to `max_len` bits.
fn find_uncovered(
    shards: &[(ShardSuffix, ShardTarget)],
    max_len: u32,
) -> Option<ShardSuffix> {
    fn walk(
        shards: &[(ShardSuffix, ShardTarget)],
        bits: u32,
        len: u32,
        max_len: u32,
    ) -> Option<ShardSuffix> {
        let candidate = ShardSuffix { bits, len };
        if shards.iter().any(|(s, _)| s.is_prefix_of(&candidate)) {
            return None;
        }
        if len == max_len {
            return Some(candidate);
        }
        walk(shards, bits, len + 1, max_len)
            .or_else(|| walk(shards, bits | (1 << len), len + 1, max_len))
    }
    walk(shards, 0, 0, max_len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shard::ShardEntry;

    fn config(entries: &[(i32, &str)]) -> ShardConfig {
        ShardConfig {
            version: 1,
            shards: entries
                .iter()
                .map(|(id, url)| ShardEntry {
                    id: *id,
                    url: url.to_string(),
                })
                .collect(),
        }
    }

    fn req_id(tail_hex: char) -> String {
        let mut s = "0".repeat(63);
        s.push(tail_hex);
        s
    }

    #[test]
    fn from_config_rejects_empty() {
        let cfg = config(&[]);
        assert!(ShardRouter::from_config(&cfg).is_err());
    }

    #[test]
    fn from_config_rejects_duplicate_ids() {
        let cfg = config(&[(2, "http://a"), (2, "http://b")]);
        assert!(ShardRouter::from_config(&cfg).is_err());
    }

    #[test]
    fn from_config_rejects_overlapping_suffixes() {
        // id 2 (suffix 0) covers everything id 4 (suffix 00) covers
        let cfg = config(&[(2, "http://a"), (4, "http://b"), (3, "http://c")]);
        let err = ShardRouter::from_config(&cfg).unwrap_err();
        assert!(err.to_string().contains("overlap"), "{err}");
    }

    #[test]
    fn from_config_rejects_non_http_urls() {
        let cfg = config(&[(1, "ftp://a")]);
        assert!(ShardRouter::from_config(&cfg).is_err());
    }

    #[test]
    fn single_shard_covers_everything() {
        let cfg = config(&[(1, "http://only:3000")]);
        let router = ShardRouter::from_config(&cfg).unwrap();
        router.validate().unwrap();

        let t = router.route_by_request_id(&req_id('f')).unwrap();
        assert_eq!(t.shard_id, 1);
        assert_eq!(t.url, "http://only:3000");
    }

    #[test]
    fn even_odd_split_routes_by_last_bit() {
        let cfg = config(&[(2, "http://even"), (3, "http://odd")]);
        let router = ShardRouter::from_config(&cfg).unwrap();
        router.validate().unwrap();

        // even hex tail → shard 2, odd → shard 3
        assert_eq!(router.route_by_request_id(&req_id('a')).unwrap().shard_id, 2);
        assert_eq!(router.route_by_request_id(&req_id('4')).unwrap().shard_id, 2);
        assert_eq!(router.route_by_request_id(&req_id('f')).unwrap().shard_id, 3);
        assert_eq!(router.route_by_request_id(&req_id('1')).unwrap().shard_id, 3);
    }

    #[test]
    fn four_way_split_routes_mod_four() {
        let cfg = config(&[
            (4, "http://s4"),
            (5, "http://s5"),
            (6, "http://s6"),
            (7, "http://s7"),
        ]);
        let router = ShardRouter::from_config(&cfg).unwrap();
        router.validate().unwrap();

        assert_eq!(router.route_by_request_id(&req_id('0')).unwrap().shard_id, 4);
        assert_eq!(router.route_by_request_id(&req_id('1')).unwrap().shard_id, 5);
        assert_eq!(router.route_by_request_id(&req_id('2')).unwrap().shard_id, 6);
        assert_eq!(router.route_by_request_id(&req_id('3')).unwrap().shard_id, 7);
        assert_eq!(router.route_by_request_id(&req_id('4')).unwrap().shard_id, 4);
        assert_eq!(router.route_by_request_id(&req_id('7')).unwrap().shard_id, 7);
    }

    #[test]
    fn mixed_length_suffixes_longest_wins() {
        // suffix 1 (id 3) plus 00 (id 4) and 10 (id 6): complete
        let cfg = config(&[(3, "http://odd"), (4, "http://s4"), (6, "http://s6")]);
        let router = ShardRouter::from_config(&cfg).unwrap();
        router.validate().unwrap();

        assert_eq!(router.route_by_request_id(&req_id('1')).unwrap().shard_id, 3);
        assert_eq!(router.route_by_request_id(&req_id('0')).unwrap().shard_id, 4);
        assert_eq!(router.route_by_request_id(&req_id('2')).unwrap().shard_id, 6);
        assert_eq!(router.route_by_request_id(&req_id('6')).unwrap().shard_id, 6);
    }

    #[test]
    fn hex_prefix_and_case_are_accepted() {
        let cfg = config(&[(2, "http://even"), (3, "http://odd")]);
        let router = ShardRouter::from_config(&cfg).unwrap();

        let plain = req_id('b');
        let prefixed = format!("0x{plain}");
        let upper = prefixed.to_uppercase().replace("0X", "0x");

        let a = router.route_by_request_id(&plain).unwrap();
        let b = router.route_by_request_id(&prefixed).unwrap();
        let c = router.route_by_request_id(&upper).unwrap();
        assert_eq!(a, b);
        assert_eq!(a, c);
    }

    #[test]
    fn short_or_garbled_request_ids_are_rejected() {
        let cfg = config(&[(1, "http://only")]);
        let router = ShardRouter::from_config(&cfg).unwrap();

        for bad in ["", "0x12", &"g".repeat(64), &"0".repeat(63)] {
            let err = router.route_by_request_id(bad).unwrap_err();
            assert_eq!(err.to_string(), "invalid request ID format");
        }
    }

    #[test]
    fn validate_reports_uncovered_suffix() {
        // {4, 5, 6} misses suffix 11
        let cfg = config(&[(4, "http://a"), (5, "http://b"), (6, "http://c")]);
        let router = ShardRouter::from_config(&cfg).unwrap();
        let err = router.validate().unwrap_err();
        assert!(err.to_string().contains("11"), "{err}");
    }

    #[test]
    fn route_by_shard_id_is_exact() {
        let cfg = config(&[(2, "http://even"), (3, "http://odd")]);
        let router = ShardRouter::from_config(&cfg).unwrap();

        let t = router.route_by_shard_id(3).unwrap().unwrap();
        assert_eq!(t.url, "http://odd");
        assert!(router.route_by_shard_id(9).unwrap().is_none());
    }

    #[test]
    fn random_target_collapses_duplicate_urls() {
        let cfg = config(&[(2, "http://same"), (3, "http://same")]);
        let router = ShardRouter::from_config(&cfg).unwrap();

        assert_eq!(router.all_targets(), vec!["http://same".to_string()]);
        for _ in 0..16 {
            let t = router.random_target().unwrap();
            assert_eq!(t.url, "http://same");
            assert_eq!(t.shard_id, 2); // lowest id serving the url
        }
    }

    #[test]
    fn failsafe_rejects_all_routing() {
        let router = ShardRouter::Failsafe;
        assert!(router.is_failsafe());
        assert!(matches!(
            router.route_by_request_id(&req_id('0')).unwrap_err(),
            GatewayError::RoutingUnavailable
        ));
        assert!(matches!(
            router.route_by_shard_id(1).unwrap_err(),
            GatewayError::RoutingUnavailable
        ));
        assert!(router.random_target().is_err());
        assert!(router.all_targets().is_empty());
        assert!(router.validate().is_ok());
    }

    #[test]
    fn trailing_slash_is_normalized() {
        let cfg = config(&[(1, "http://host:3000/")]);
        let router = ShardRouter::from_config(&cfg).unwrap();
        assert_eq!(
            router.route_by_request_id(&req_id('0')).unwrap().url,
            "http://host:3000"
        );
    }
}
