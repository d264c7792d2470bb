//! 退避调度器
//!
//! 以尝试次数为参数计算等待时长（指数 + 上限 + 可选抖动）。工具级恢复与推理后端重试共用；
//! 可取消的等待在 RecoverySystem::pause。

use std::time::Duration;

use rand::Rng;

use crate::config::RecoverySection;

#[derive(Debug, Clone)]
pub struct BackoffScheduler {
    base_ms: f64,
    max_ms: f64,
    multiplier: f64,
    jitter: bool,
}

impl BackoffScheduler {
    pub fn new(base: Duration, max: Duration, multiplier: f64, jitter: bool) -> Self {
        Self {
            base_ms: base.as_millis() as f64,
            max_ms: max.as_millis() as f64,
            multiplier: multiplier.max(1.0),
            jitter,
        }
    }

    pub fn from_config(cfg: &RecoverySection) -> Self {
        Self::new(
            Duration::from_millis(cfg.base_delay_ms),
            Duration::from_millis(cfg.max_delay_ms),
            cfg.multiplier,
            cfg.jitter,
        )
    }

    /// 不含抖动的名义等待时长：min(max, base * multiplier^(attempt-1))
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(64) as i32;
        let ms = (self.base_ms * self.multiplier.powi(exp)).min(self.max_ms);
        Duration::from_millis(ms.max(0.0) as u64)
    }

    /// 实际等待时长；开启抖动时在 [0.5, 1.0] 之间缩放
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let nominal = self.nominal_delay(attempt);
        if !self.jitter || nominal.is_zero() {
            return nominal;
        }
        let factor: f64 = rand::thread_rng().gen_range(0.5..=1.0);
        nominal.mul_f64(factor)
    }
}

impl Default for BackoffScheduler {
    fn default() -> Self {
        Self::from_config(&RecoverySection::default())
    }
}
