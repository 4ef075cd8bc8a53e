use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use cron::Schedule;
use tracing::{debug, warn};

use pipeline_core::{PipelineError, PipelineResult};

use crate::task::ScheduledTask;

/// 调度资格策略钩子
///
/// 派发循环对非初始状态（通常是 Waiting 的周期任务）调用此钩子决定
/// 本轮是否可执行；不可执行的任务重新入队等待下一轮。
pub trait SchedulePolicy: Send + Sync {
    fn should_run(&self, task: &ScheduledTask) -> bool;
}

/// 永远可执行：完成即重入的任务
pub struct AlwaysPolicy;

impl SchedulePolicy for AlwaysPolicy {
    fn should_run(&self, _task: &ScheduledTask) -> bool {
        true
    }
}

/// 只执行一次：已有完成记录的任务不再合格
pub struct OncePolicy;

impl SchedulePolicy for OncePolicy {
    fn should_run(&self, task: &ScheduledTask) -> bool {
        task.last_finished().is_none()
    }
}

/// 固定间隔：距上次执行结束超过 period 才可再次执行
pub struct IntervalPolicy {
    period: Duration,
}

impl IntervalPolicy {
    pub fn new(period: Duration) -> Self {
        Self { period }
    }
}

impl SchedulePolicy for IntervalPolicy {
    fn should_run(&self, task: &ScheduledTask) -> bool {
        match task.last_finished() {
            Some(last) => Utc::now() - last >= self.period,
            None => true,
        }
    }
}

/// CRON表达式策略
pub struct CronPolicy {
    schedule: Schedule,
}

impl CronPolicy {
    pub fn new(cron_expr: &str) -> PipelineResult<Self> {
        let schedule = Schedule::from_str(cron_expr).map_err(|e| PipelineError::InvalidCron {
            expr: cron_expr.to_string(),
            message: e.to_string(),
        })?;
        Ok(Self { schedule })
    }

    /// 验证CRON表达式是否有效
    pub fn validate(cron_expr: &str) -> PipelineResult<()> {
        Schedule::from_str(cron_expr).map_err(|e| PipelineError::InvalidCron {
            expr: cron_expr.to_string(),
            message: e.to_string(),
        })?;
        Ok(())
    }

    /// 检查给定时间是否应该触发
    pub fn should_trigger(&self, last_run: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        match last_run {
            Some(last) => {
                if let Some(next_time) = self.schedule.after(&last).next() {
                    let should_trigger = next_time <= now;
                    if should_trigger {
                        debug!(
                            "任务到达调度时间: 上次执行={}, 下次执行={}",
                            last.format("%Y-%m-%d %H:%M:%S UTC"),
                            next_time.format("%Y-%m-%d %H:%M:%S UTC")
                        );
                    }
                    should_trigger
                } else {
                    warn!(
                        "无法计算下一次执行时间，上次执行时间: {}",
                        last.format("%Y-%m-%d %H:%M:%S UTC")
                    );
                    false
                }
            }
            None => {
                // 从未执行过：检查刚刚过去的一分钟内是否有执行点已经到期
                let check_from = now - Duration::minutes(1);
                self.schedule
                    .after(&check_from)
                    .next()
                    .map(|next_time| next_time <= now)
                    .unwrap_or(false)
            }
        }
    }

    /// 获取下一次执行时间
    pub fn next_execution_time(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&from).next()
    }

    /// 检查任务是否已过期（超过预期执行时间太久）
    pub fn is_overdue(
        &self,
        last_run: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        grace_period_minutes: i64,
    ) -> bool {
        if let Some(last) = last_run {
            if let Some(expected_time) = self.schedule.after(&last).next() {
                return now > expected_time + Duration::minutes(grace_period_minutes);
            }
        }
        false
    }
}

impl SchedulePolicy for CronPolicy {
    fn should_run(&self, task: &ScheduledTask) -> bool {
        self.should_trigger(task.last_finished(), Utc::now())
    }
}
