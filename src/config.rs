use crate::chain::{FetchPolicy, DEFAULT_EXCHANGE_ADDRESSES};
use crate::domain::Address;
use crate::engine::{AggregationSettings, TagRules};
use std::collections::{BTreeSet, HashMap};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    /// Required only by commands that talk to the chain.
    pub rpc_url: Option<String>,
    pub exchange_addresses: Vec<Address>,
    pub start_block: Option<u64>,
    pub end_block: Option<u64>,
    pub fetch: FetchPolicy,
    pub aggregation: AggregationSettings,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnv(String),
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

const RPC_URL_VARS: [&str; 3] = ["POLYGON_RPC_URL", "RPC_URL", "POLYGON_RPC"];

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_map(std::env::vars().collect())
    }

    pub fn from_env_map(env_map: HashMap<String, String>) -> Result<Self, ConfigError> {
        let database_path = env_map
            .get("DATABASE_PATH")
            .cloned()
            .unwrap_or_else(|| "./polyrep.sqlite".to_string());

        let rpc_url = RPC_URL_VARS
            .iter()
            .filter_map(|key| env_map.get(*key))
            .map(|s| s.trim())
            .find(|s| !s.is_empty())
            .map(str::to_string);

        let exchange_addresses = match env_map.get("CTF_EXCHANGE_ADDRESSES") {
            Some(list) => parse_address_list("CTF_EXCHANGE_ADDRESSES", list)?,
            None => DEFAULT_EXCHANGE_ADDRESSES.iter().map(Address::new).collect(),
        };

        let start_block = parse_opt::<u64>(&env_map, "START_BLOCK")?;
        let end_block = parse_opt::<u64>(&env_map, "END_BLOCK")?;

        let defaults = FetchPolicy::default();
        let fetch = FetchPolicy {
            chunk_size: parse_or(&env_map, "CHUNK_SIZE", defaults.chunk_size)?,
            max_logs_per_chunk: parse_or(
                &env_map,
                "MAX_LOGS_PER_CHUNK",
                defaults.max_logs_per_chunk,
            )?,
            max_attempts: parse_or(&env_map, "RPC_MAX_ATTEMPTS", defaults.max_attempts)?,
            initial_backoff: parse_ms(&env_map, "RPC_INITIAL_BACKOFF_MS", defaults.initial_backoff)?,
            max_backoff: parse_ms(&env_map, "RPC_MAX_BACKOFF_MS", defaults.max_backoff)?,
            min_request_interval: parse_ms(
                &env_map,
                "RPC_MIN_INTERVAL_MS",
                defaults.min_request_interval,
            )?,
        };
        if fetch.chunk_size == 0 {
            return Err(ConfigError::InvalidValue(
                "CHUNK_SIZE".to_string(),
                "must be at least 1".to_string(),
            ));
        }
        if fetch.max_attempts == 0 {
            return Err(ConfigError::InvalidValue(
                "RPC_MAX_ATTEMPTS".to_string(),
                "must be at least 1".to_string(),
            ));
        }

        let excluded_addresses: BTreeSet<Address> = match env_map.get("EXCLUDED_ADDRESSES") {
            Some(list) => parse_address_list("EXCLUDED_ADDRESSES", list)?
                .into_iter()
                .collect(),
            None => {
                let mut set: BTreeSet<Address> = exchange_addresses.iter().cloned().collect();
                set.insert(Address::zero());
                set
            }
        };

        let require_confirmed_winner = match env_map
            .get("REQUIRE_CONFIRMED_WINNER")
            .map(|s| s.trim().to_ascii_lowercase())
            .as_deref()
        {
            None | Some("") | Some("0") | Some("false") | Some("no") => false,
            Some("1") | Some("true") | Some("yes") => true,
            Some(other) => {
                return Err(ConfigError::InvalidValue(
                    "REQUIRE_CONFIRMED_WINNER".to_string(),
                    format!("must be true or false, got {}", other),
                ))
            }
        };

        let rules = TagRules::default();
        let tag_rules = TagRules {
            high_volume_min_trades: parse_or(
                &env_map,
                "TAG_HIGH_VOLUME_MIN_TRADES",
                rules.high_volume_min_trades,
            )?,
            high_volume_min_markets: parse_or(
                &env_map,
                "TAG_HIGH_VOLUME_MIN_MARKETS",
                rules.high_volume_min_markets,
            )?,
            whale_min_trade_usd: parse_or(&env_map, "TAG_WHALE_MIN_TRADE_USD", rules.whale_min_trade_usd)?,
            smart_money_min_win_rate: parse_or(
                &env_map,
                "TAG_SMART_MONEY_MIN_WIN_RATE",
                rules.smart_money_min_win_rate,
            )?,
            smart_money_min_markets: parse_or(
                &env_map,
                "TAG_SMART_MONEY_MIN_MARKETS",
                rules.smart_money_min_markets,
            )?,
            contra_max_roi: parse_or(&env_map, "TAG_CONTRA_MAX_ROI", rules.contra_max_roi)?,
            directional_min_markets: parse_or(
                &env_map,
                "TAG_DIRECTIONAL_MIN_MARKETS",
                rules.directional_min_markets,
            )?,
        };

        Ok(Config {
            database_path,
            rpc_url,
            exchange_addresses,
            start_block,
            end_block,
            fetch,
            aggregation: AggregationSettings {
                excluded_addresses,
                require_confirmed_winner,
                tag_rules,
            },
        })
    }

    /// The RPC endpoint, for commands that cannot run without one.
    pub fn require_rpc_url(&self) -> Result<&str, ConfigError> {
        self.rpc_url
            .as_deref()
            .ok_or_else(|| ConfigError::MissingEnv("POLYGON_RPC_URL".to_string()))
    }
}

fn parse_opt<T: FromStr>(
    env_map: &HashMap<String, String>,
    key: &str,
) -> Result<Option<T>, ConfigError> {
    match env_map.get(key).map(|s| s.trim()).filter(|s| !s.is_empty()) {
        None => Ok(None),
        Some(raw) => raw.parse::<T>().map(Some).map_err(|_| {
            ConfigError::InvalidValue(key.to_string(), format!("cannot parse {:?}", raw))
        }),
    }
}

fn parse_or<T: FromStr>(
    env_map: &HashMap<String, String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError> {
    Ok(parse_opt(env_map, key)?.unwrap_or(default))
}

fn parse_ms(
    env_map: &HashMap<String, String>,
    key: &str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    Ok(parse_opt::<u64>(env_map, key)?
        .map(Duration::from_millis)
        .unwrap_or(default))
}

fn parse_address_list(key: &str, list: &str) -> Result<Vec<Address>, ConfigError> {
    let mut out = Vec::new();
    for raw in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let hex = raw.strip_prefix("0x").unwrap_or("");
        if hex.len() != 40 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ConfigError::InvalidValue(
                key.to_string(),
                format!("not a 20-byte hex address: {}", raw),
            ));
        }
        out.push(Address::new(raw));
    }
    if out.is_empty() {
        return Err(ConfigError::InvalidValue(
            key.to_string(),
            "must list at least one address".to_string(),
        ));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Decimal;

    fn setup_required_env() -> HashMap<String, String> {
        let mut map = HashMap::new();
        map.insert("DATABASE_PATH".to_string(), "/tmp/test.db".to_string());
        map.insert(
            "POLYGON_RPC_URL".to_string(),
            "https://polygon-rpc.example".to_string(),
        );
        map
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_env_map(HashMap::new()).unwrap();
        assert_eq!(config.database_path, "./polyrep.sqlite");
        assert!(config.rpc_url.is_none());
        assert!(config.require_rpc_url().is_err());
        assert_eq!(config.fetch, FetchPolicy::default());
        assert_eq!(config.exchange_addresses.len(), 2);
        assert_eq!(config.aggregation, AggregationSettings::default());
    }

    #[test]
    fn test_rpc_url_aliases() {
        let mut env_map = HashMap::new();
        env_map.insert("POLYGON_RPC".to_string(), "http://b".to_string());
        let config = Config::from_env_map(env_map.clone()).unwrap();
        assert_eq!(config.require_rpc_url().unwrap(), "http://b");

        env_map.insert("POLYGON_RPC_URL".to_string(), "http://a".to_string());
        let config = Config::from_env_map(env_map).unwrap();
        assert_eq!(config.rpc_url.as_deref(), Some("http://a"));
    }

    #[test]
    fn test_fetch_overrides() {
        let mut env_map = setup_required_env();
        env_map.insert("CHUNK_SIZE".to_string(), "2000".to_string());
        env_map.insert("RPC_MIN_INTERVAL_MS".to_string(), "250".to_string());
        env_map.insert("START_BLOCK".to_string(), "60000000".to_string());
        let config = Config::from_env_map(env_map).unwrap();
        assert_eq!(config.fetch.chunk_size, 2000);
        assert_eq!(config.fetch.min_request_interval, Duration::from_millis(250));
        assert_eq!(config.start_block, Some(60_000_000));
        assert_eq!(config.end_block, None);
    }

    #[test]
    fn test_invalid_chunk_size() {
        for value in ["abc", "0", "-5"] {
            let mut env_map = setup_required_env();
            env_map.insert("CHUNK_SIZE".to_string(), value.to_string());
            match Config::from_env_map(env_map) {
                Err(ConfigError::InvalidValue(k, _)) => assert_eq!(k, "CHUNK_SIZE"),
                other => panic!("Expected InvalidValue error, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_invalid_exchange_address() {
        let mut env_map = setup_required_env();
        env_map.insert("CTF_EXCHANGE_ADDRESSES".to_string(), "0x1234".to_string());
        match Config::from_env_map(env_map) {
            Err(ConfigError::InvalidValue(k, _)) => assert_eq!(k, "CTF_EXCHANGE_ADDRESSES"),
            _ => panic!("Expected InvalidValue error"),
        }
    }

    #[test]
    fn test_excluded_addresses_follow_exchanges() {
        let mut env_map = setup_required_env();
        env_map.insert(
            "CTF_EXCHANGE_ADDRESSES".to_string(),
            "0xAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA".to_string(),
        );
        let config = Config::from_env_map(env_map).unwrap();
        let excluded = &config.aggregation.excluded_addresses;
        assert_eq!(excluded.len(), 2);
        assert!(excluded.contains(&Address::new("0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa")));
        assert!(excluded.contains(&Address::zero()));
    }

    #[test]
    fn test_tag_thresholds_and_winner_policy() {
        let mut env_map = setup_required_env();
        env_map.insert("TAG_WHALE_MIN_TRADE_USD".to_string(), "2500.5".to_string());
        env_map.insert("TAG_DIRECTIONAL_MIN_MARKETS".to_string(), "5".to_string());
        env_map.insert("REQUIRE_CONFIRMED_WINNER".to_string(), "TRUE".to_string());
        let config = Config::from_env_map(env_map).unwrap();
        let rules = &config.aggregation.tag_rules;
        assert_eq!(
            rules.whale_min_trade_usd,
            Decimal::from_str_canonical("2500.5").unwrap()
        );
        assert_eq!(rules.directional_min_markets, 5);
        assert!(config.aggregation.require_confirmed_winner);
    }

    #[test]
    fn test_invalid_winner_policy() {
        let mut env_map = setup_required_env();
        env_map.insert("REQUIRE_CONFIRMED_WINNER".to_string(), "maybe".to_string());
        match Config::from_env_map(env_map) {
            Err(ConfigError::InvalidValue(k, _)) => assert_eq!(k, "REQUIRE_CONFIRMED_WINNER"),
            _ => panic!("Expected InvalidValue error"),
        }
    }
}
