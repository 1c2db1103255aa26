use std::net::Ipv4Addr;
use std::str::FromStr;
use std::time::Duration;
use anyhow::{anyhow, Context};
use rustc_hash::FxHashMap;

/// A flat `key = value` property source. Lines starting with `#` and empty lines are ignored,
///  later definitions of a key override earlier ones.
#[derive(Clone, Debug, Default)]
pub struct Properties {
    values: FxHashMap<String, String>,
}

impl Properties {
    pub fn parse(text: &str) -> anyhow::Result<Properties> {
        let mut values = FxHashMap::default();

        for (line_no, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let (key, value) = line.split_once('=')
                .ok_or_else(|| anyhow!("line {}: expected 'key = value', was {:?}", line_no + 1, raw))?;
            let key = key.trim();
            if key.is_empty() {
                return Err(anyhow!("line {}: empty property name", line_no + 1));
            }
            values.insert(key.to_string(), value.trim().to_string());
        }

        Ok(Properties { values })
    }

    pub fn set(&mut self, key: &str, value: impl ToString) {
        self.values.insert(key.to_string(), value.to_string());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(|s| s.as_str())
    }

    fn get_parsed<T: FromStr>(&self, key: &str) -> anyhow::Result<Option<T>>
    where <T as FromStr>::Err: std::error::Error + Send + Sync + 'static
    {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => raw.parse::<T>()
                .map(Some)
                .with_context(|| format!("invalid value for property {}: {:?}", key, raw)),
        }
    }

    pub fn get_u16(&self, key: &str, default: u16) -> anyhow::Result<u16> {
        Ok(self.get_parsed(key)?.unwrap_or(default))
    }

    pub fn get_u32(&self, key: &str, default: u32) -> anyhow::Result<u32> {
        Ok(self.get_parsed(key)?.unwrap_or(default))
    }

    pub fn get_u64(&self, key: &str, default: u64) -> anyhow::Result<u64> {
        Ok(self.get_parsed(key)?.unwrap_or(default))
    }

    pub fn get_usize(&self, key: &str, default: usize) -> anyhow::Result<usize> {
        Ok(self.get_parsed(key)?.unwrap_or(default))
    }

    /// property value is interpreted as milliseconds
    pub fn get_duration_millis(&self, key: &str, default: Duration) -> anyhow::Result<Duration> {
        Ok(self.get_parsed::<u64>(key)?
            .map(Duration::from_millis)
            .unwrap_or(default))
    }

    pub fn get_ipv4(&self, key: &str, default: Ipv4Addr) -> anyhow::Result<Ipv4Addr> {
        Ok(self.get_parsed(key)?.unwrap_or(default))
    }
}
