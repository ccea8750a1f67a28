use siphasher::sip::SipHasher24;
use std::fmt;
use std::hash::Hasher;
use std::str::FromStr;
use thiserror::Error;

/// Key used by every node for the partition hash. Changing it repartitions
/// the whole cluster, so it is compiled in rather than configured.
const PARTITION_KEY: (u64, u64) = (0x7368617264_u64, 0x6d6f64756c6f73_u64);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("bad shard spec {0:?}: expected <shard>-<modulos> with shard < modulos")]
    BadShardSpec(String),
}

/// One slice of the cluster key space: `(shard, modulos)` with
/// `0 <= shard < modulos`. A file named `n` belongs to this slice iff
/// `hash(n) % modulos == shard`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardSpec {
    pub shard: u64,
    pub modulos: u64,
}

impl ShardSpec {
    pub fn new(shard: u64, modulos: u64) -> Result<Self, RouteError> {
        if modulos == 0 || shard >= modulos {
            return Err(RouteError::BadShardSpec(format!("{shard}-{modulos}")));
        }
        Ok(Self { shard, modulos })
    }

    /// Whether the file named `name` belongs to this shard. The hash is
    /// SipHash-2-4 with a fixed key, so every node computes the same
    /// membership for the same name.
    pub fn matches(&self, name: &str) -> bool {
        hash_name(name) % self.modulos == self.shard
    }
}

fn hash_name(name: &str) -> u64 {
    let mut hasher = SipHasher24::new_with_keys(PARTITION_KEY.0, PARTITION_KEY.1);
    hasher.write(name.as_bytes());
    hasher.finish()
}

impl FromStr for ShardSpec {
    type Err = RouteError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || RouteError::BadShardSpec(s.to_string());
        let (shard, modulos) = s.split_once('-').ok_or_else(bad)?;
        let shard: u64 = shard.parse().map_err(|_| bad())?;
        let modulos: u64 = modulos.parse().map_err(|_| bad())?;
        Self::new(shard, modulos).map_err(|_| bad())
    }
}

impl fmt::Display for ShardSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.shard, self.modulos)
    }
}
