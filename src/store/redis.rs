//! Redis-backed store for multi-instance deployments.
//!
//! Counters and capped lists are updated by Lua scripts so that the
//! increment, expiry, and trim happen atomically on the server.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fred::prelude::*;
use tokio::sync::RwLock;
use tracing::{info, warn};

use super::{KvStore, StoreError, WindowCount};
use crate::resilience::with_timeout;

/// INCR with a first-hit PEXPIRE. Returns `{count, pttl}`.
const INCR_WINDOW_SCRIPT: &str = r#"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
  redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
local ttl = redis.call('PTTL', KEYS[1])
if ttl < 0 then
  redis.call('PEXPIRE', KEYS[1], ARGV[1])
  ttl = tonumber(ARGV[1])
end
return {count, ttl}
"#;

/// LPUSH followed by LTRIM. Returns `{len}`.
const PUSH_CAPPED_SCRIPT: &str = r#"
redis.call('LPUSH', KEYS[1], ARGV[1])
redis.call('LTRIM', KEYS[1], 0, tonumber(ARGV[2]) - 1)
return {redis.call('LLEN', KEYS[1])}
"#;

#[derive(Clone, Copy)]
enum Script {
    IncrWindow,
    PushCapped,
}

#[derive(Clone, Default)]
struct ScriptShas {
    incr_window: String,
    push_capped: String,
}

/// Store backed by a fred Redis client.
#[derive(Clone)]
pub struct RedisStore {
    client: Client,
    op_timeout: Duration,
    scripts: Arc<RwLock<ScriptShas>>,
}

fn unavailable(e: Error) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

impl RedisStore {
    /// Connect and load the Lua scripts.
    pub async fn connect(
        url: &str,
        connect_timeout: Duration,
        op_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let config = Config::from_url(url).map_err(unavailable)?;
        let client = Client::new(config, None, None, None);
        client.connect();
        with_timeout(connect_timeout, async {
            client.wait_for_connect().await.map_err(unavailable)
        })
        .await?;

        info!(url = %redact_url(url), "Connected to Redis");

        let store = Self {
            client,
            op_timeout,
            scripts: Arc::new(RwLock::new(ScriptShas::default())),
        };
        with_timeout(connect_timeout, store.load_scripts()).await?;
        Ok(store)
    }

    async fn load_scripts(&self) -> Result<(), StoreError> {
        let incr_window: String = self
            .client
            .script_load(INCR_WINDOW_SCRIPT)
            .await
            .map_err(unavailable)?;
        let push_capped: String = self
            .client
            .script_load(PUSH_CAPPED_SCRIPT)
            .await
            .map_err(unavailable)?;

        info!(
            incr_window_sha = %incr_window,
            push_capped_sha = %push_capped,
            "Lua scripts loaded into Redis"
        );

        let mut scripts = self.scripts.write().await;
        scripts.incr_window = incr_window;
        scripts.push_capped = push_capped;
        Ok(())
    }

    async fn sha(&self, script: Script) -> String {
        let scripts = self.scripts.read().await;
        match script {
            Script::IncrWindow => scripts.incr_window.clone(),
            Script::PushCapped => scripts.push_capped.clone(),
        }
    }

    /// EVALSHA with a single reload on NOSCRIPT (e.g. after a Redis restart).
    async fn eval_script(
        &self,
        script: Script,
        key: &str,
        args: Vec<String>,
    ) -> Result<Vec<i64>, StoreError> {
        let sha = self.sha(script).await;
        let first: Result<Vec<i64>, Error> =
            self.client.evalsha(&sha, vec![key], args.clone()).await;

        match first {
            Ok(r) => Ok(r),
            Err(e) if e.to_string().contains("NOSCRIPT") => {
                warn!("NOSCRIPT error, reloading Lua scripts");
                self.load_scripts().await?;
                let sha = self.sha(script).await;
                self.client
                    .evalsha(&sha, vec![key], args)
                    .await
                    .map_err(unavailable)
            }
            Err(e) => Err(unavailable(e)),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_connected()
    }
}

#[async_trait]
impl KvStore for RedisStore {
    #[tracing::instrument(skip(self), level = "trace")]
    async fn incr_window(&self, key: &str, window: Duration) -> Result<WindowCount, StoreError> {
        let window_ms = window.as_millis().max(1) as u64;
        let result = with_timeout(
            self.op_timeout,
            self.eval_script(Script::IncrWindow, key, vec![window_ms.to_string()]),
        )
        .await?;

        match result.as_slice() {
            [count, ttl, ..] => Ok(WindowCount {
                count: (*count).max(0) as u64,
                ttl: Duration::from_millis((*ttl).max(0) as u64),
            }),
            _ => Err(StoreError::Serialization(
                "incr_window script returned a short reply".to_string(),
            )),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        with_timeout(self.op_timeout, async {
            self.client
                .get::<Option<String>, _>(key)
                .await
                .map_err(unavailable)
        })
        .await
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let px = ttl.as_millis().max(1) as i64;
        with_timeout(self.op_timeout, async {
            self.client
                .set::<(), _, _>(key, value, Some(Expiration::PX(px)), None, false)
                .await
                .map_err(unavailable)
        })
        .await
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        let px = ttl.as_millis().max(1) as i64;
        let reply = with_timeout(self.op_timeout, async {
            self.client
                .set::<Option<String>, _, _>(
                    key,
                    value,
                    Some(Expiration::PX(px)),
                    Some(SetOptions::NX),
                    false,
                )
                .await
                .map_err(unavailable)
        })
        .await?;
        Ok(reply.is_some())
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        let pttl: i64 = with_timeout(self.op_timeout, async {
            self.client.pttl::<i64, _>(key).await.map_err(unavailable)
        })
        .await?;
        // -2: missing, -1: no expiry
        Ok((pttl > 0).then(|| Duration::from_millis(pttl as u64)))
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        with_timeout(self.op_timeout, async {
            self.client.del::<i64, _>(key).await.map_err(unavailable)
        })
        .await
        .map(|_| ())
    }

    async fn push_capped(&self, key: &str, value: &str, max_len: usize) -> Result<(), StoreError> {
        with_timeout(
            self.op_timeout,
            self.eval_script(
                Script::PushCapped,
                key,
                vec![value.to_string(), max_len.max(1).to_string()],
            ),
        )
        .await
        .map(|_| ())
    }

    async fn range(&self, key: &str, offset: usize, limit: usize) -> Result<Vec<String>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let start = offset as i64;
        let stop = (offset + limit - 1) as i64;
        with_timeout(self.op_timeout, async {
            self.client
                .lrange::<Vec<String>, _>(key, start, stop)
                .await
                .map_err(unavailable)
        })
        .await
    }

    async fn list_len(&self, key: &str) -> Result<usize, StoreError> {
        let len: i64 = with_timeout(self.op_timeout, async {
            self.client.llen::<i64, _>(key).await.map_err(unavailable)
        })
        .await?;
        Ok(len.max(0) as usize)
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}

/// Strip credentials from a Redis URL before logging it.
fn redact_url(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("***"));
            }
            parsed.to_string()
        }
        Err(_) => "<invalid url>".to_string(),
    }
}
