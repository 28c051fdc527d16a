//! 构建报告

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::artifact::Artifact;

/// 构建阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    Connecting,
    Resolving,
    Cloning,
    ConfiguringHardware,
    AwaitingGuest,
    Snapshotting,
    Templatizing,
    Done,
    Failed,
}

impl Stage {
    /// 执行顺序中的工作阶段 (不含终态)
    pub const PIPELINE: [Stage; 7] = [
        Stage::Connecting,
        Stage::Resolving,
        Stage::Cloning,
        Stage::ConfiguringHardware,
        Stage::AwaitingGuest,
        Stage::Snapshotting,
        Stage::Templatizing,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Connecting => "connecting",
            Stage::Resolving => "resolving",
            Stage::Cloning => "cloning",
            Stage::ConfiguringHardware => "configuring hardware",
            Stage::AwaitingGuest => "awaiting guest",
            Stage::Snapshotting => "snapshotting",
            Stage::Templatizing => "templatizing",
            Stage::Done => "done",
            Stage::Failed => "failed",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 构建报告
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildReport {
    /// 目标虚拟机名称
    pub vm_name: String,

    /// 是否成功
    pub passed: bool,

    /// 执行的阶段数
    pub steps_executed: usize,

    pub passed_count: usize,

    pub failed_count: usize,

    pub skipped_count: usize,

    /// 总耗时（毫秒）
    pub duration_ms: u64,

    /// 开始时间
    pub started_at: DateTime<Utc>,

    /// 最终阶段 (Done / Failed)
    pub final_stage: Stage,

    /// 产物，仅成功时存在
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<Artifact>,

    /// 阶段报告列表
    pub steps: Vec<StepReport>,
}

impl BuildReport {
    pub fn new(vm_name: &str) -> Self {
        Self {
            vm_name: vm_name.to_string(),
            passed: true,
            steps_executed: 0,
            passed_count: 0,
            failed_count: 0,
            skipped_count: 0,
            duration_ms: 0,
            started_at: Utc::now(),
            final_stage: Stage::Connecting,
            artifact: None,
            steps: Vec::new(),
        }
    }

    pub fn add_step(&mut self, step: StepReport) {
        self.steps_executed += 1;

        match step.status {
            StepStatus::Success => self.passed_count += 1,
            StepStatus::Failed => {
                self.failed_count += 1;
                self.passed = false;
            }
            StepStatus::Skipped => self.skipped_count += 1,
        }

        self.steps.push(step);
    }

    /// 查找某阶段的报告
    pub fn step(&self, stage: Stage) -> Option<&StepReport> {
        self.steps.iter().find(|s| s.stage == stage)
    }

    /// 导出为 JSON
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// 阶段报告
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepReport {
    pub step_index: usize,

    pub stage: Stage,

    pub status: StepStatus,

    /// 错误信息
    pub error: Option<String>,

    /// 耗时（毫秒）
    pub duration_ms: u64,
}

impl StepReport {
    pub fn success(index: usize, stage: Stage) -> Self {
        Self {
            step_index: index,
            stage,
            status: StepStatus::Success,
            error: None,
            duration_ms: 0,
        }
    }

    pub fn failed(index: usize, stage: Stage, error: &str) -> Self {
        Self {
            step_index: index,
            stage,
            status: StepStatus::Failed,
            error: Some(error.to_string()),
            duration_ms: 0,
        }
    }

    pub fn skipped(index: usize, stage: Stage) -> Self {
        Self {
            step_index: index,
            stage,
            status: StepStatus::Skipped,
            error: None,
            duration_ms: 0,
        }
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }
}

/// 阶段状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepStatus {
    Success,
    Failed,
    Skipped,
}
