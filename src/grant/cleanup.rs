//! 过期 grant 的后台清理
//!
//! 按固定间隔调用 [`GrantStore::sweep_expired`]。失败和超时只记录 warn 日志，
//! 下一个周期自动重试，不影响签发路径。

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::grant::store::GrantStore;

/// 清理调度器
#[derive(Clone)]
pub struct CleanupScheduler {
    store: Arc<dyn GrantStore>,
    interval: Duration,
    timeout: Duration,
}

impl std::fmt::Debug for CleanupScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupScheduler")
            .field("interval", &self.interval)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl CleanupScheduler {
    /// 创建调度器，单次清理的超时默认等于间隔
    pub fn new(store: Arc<dyn GrantStore>, interval: Duration) -> Self {
        Self {
            store,
            interval,
            timeout: interval,
        }
    }

    /// 设置单次清理的超时
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// 清理间隔
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// 执行一次清理，返回删除的数量
    pub async fn run_once(&self) -> Result<usize> {
        tokio::time::timeout(self.timeout, self.store.sweep_expired(Utc::now()))
            .await
            .map_err(|_| Error::Timeout(self.timeout))?
    }

    /// 在后台任务中按间隔运行
    pub fn spawn(self) -> CleanupHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            self.run(stop_rx).await;
        });
        CleanupHandle { stop_tx, task }
    }

    async fn run(self, mut stop_rx: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_secs = self.interval.as_secs_f64(), "token cleanup started");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.run_once().await {
                        Ok(0) => debug!("no expired grants"),
                        Ok(removed) => info!(removed, "removed expired grants"),
                        Err(e) => warn!(error = %e, "token cleanup failed, retrying next tick"),
                    }
                }
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        debug!("token cleanup stopping");
                        break;
                    }
                }
            }
        }
    }
}

/// 后台清理任务的句柄
#[derive(Debug)]
pub struct CleanupHandle {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl CleanupHandle {
    /// 停止任务并等待其退出
    pub async fn shutdown(self) {
        let _ = self.stop_tx.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "token cleanup task ended abnormally");
        }
    }

    /// 任务是否已结束
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
