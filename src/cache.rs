use std::env;

use redis::Commands;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("redis: {msg}")]
pub struct CacheError {
    pub msg: String,
}

impl From<redis::RedisError> for CacheError {
    fn from(e: redis::RedisError) -> Self {
        CacheError { msg: e.to_string() }
    }
}

fn redis_connection() -> Result<redis::Connection, CacheError> {
    let redis_host = env::var("REDIS_HOST").unwrap_or("127.0.0.1".to_string());
    let redis_port = env::var("REDIS_PORT").unwrap_or("6379".to_string());
    let redis_path = format!("redis://{}:{}", redis_host, redis_port);
    let client = redis::Client::open(redis_path)?;
    Ok(client.get_connection()?)
}

#[cfg(test)]
pub fn flushdb() -> Result<(), CacheError> {
    let mut connection = redis_connection()?;
    redis::cmd("FLUSHDB").query::<String>(&mut connection)?;
    Ok(())
}

pub fn get(key: String) -> Result<Option<String>, CacheError> {
    let mut connection = redis_connection()?;
    Ok(connection.get(key)?)
}

pub fn set(key: String, value: String) -> Result<(), CacheError> {
    let mut connection = redis_connection()?;
    Ok(connection.set(key, value)?)
}

pub fn scan_keys(pattern: &str) -> Result<Vec<String>, CacheError> {
    let mut connection = redis_connection()?;
    let keys = connection
        .scan_match::<_, String>(pattern)?
        .collect::<Result<Vec<String>, redis::RedisError>>()?;
    Ok(keys)
}
