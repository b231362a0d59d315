//! 计费协作方接口
//!
//! 额度怎么存、每日怎么重置都不归这里管。流水线只在 "非缓存 + 打分成功" 时调用一次
//! `spend_one`，失败也不会丢弃已经算出的分数。

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("no credits left for user {user_id}")]
    NoCredits { user_id: i64 },
}

/// 扣一次额度。成功返回扣后余额 (不限额用户为 None)。
pub trait CreditLedger: Send + Sync {
    fn spend_one(&self, user_id: i64, reason: &str) -> Result<Option<i64>, BillingError>;
}

/// 进程内账本：每个用户首次出现时获得 `free_credits`，premium 用户不扣费。
pub struct MemoryLedger {
    free_credits: i64,
    balances: Mutex<HashMap<i64, i64>>,
    premium: HashSet<i64>,
}

impl MemoryLedger {
    pub fn new(free_credits: i64) -> Self {
        Self {
            free_credits,
            balances: Mutex::new(HashMap::new()),
            premium: HashSet::new(),
        }
    }

    pub fn with_premium(mut self, user_id: i64) -> Self {
        self.premium.insert(user_id);
        self
    }

    pub fn balance(&self, user_id: i64) -> i64 {
        *self
            .balances
            .lock()
            .get(&user_id)
            .unwrap_or(&self.free_credits)
    }
}

impl CreditLedger for MemoryLedger {
    fn spend_one(&self, user_id: i64, reason: &str) -> Result<Option<i64>, BillingError> {
        if self.premium.contains(&user_id) {
            return Ok(None);
        }

        let mut balances = self.balances.lock();
        let balance = balances.entry(user_id).or_insert(self.free_credits);
        if *balance <= 0 {
            return Err(BillingError::NoCredits { user_id });
        }
        *balance -= 1;
        debug!(user_id, reason, left = *balance, "credit spent");
        Ok(Some(*balance))
    }
}
