//! 构建步骤与命令输出相关领域模型

use chrono::{DateTime, Utc};
use serde::Serialize;

/// 构建步骤状态
#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    /// Layer reused from the cache
    Cached,
    /// Layer produced by this build
    Built,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Cached => "cached",
            StepStatus::Built => "built",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        }
    }

    pub fn icon(&self) -> &'static str {
        match self {
            StepStatus::Built => "✓",
            StepStatus::Cached => "↺",
            StepStatus::Failed => "✗",
            StepStatus::Skipped => "⊘",
            StepStatus::Running => "⟳",
            StepStatus::Pending => "○",
        }
    }

    /// 是否为终态
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StepStatus::Pending | StepStatus::Running)
    }
}

/// 构建步骤信息
#[derive(Clone, Debug, Serialize)]
pub struct StepRecord {
    /// 1-based position in the build
    pub number: usize,
    /// Line of the instruction in the descriptor
    pub line: usize,
    /// Canonical instruction text
    pub instruction: String,
    /// Layer cache key once computed
    pub cache_key: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// 持续时间（毫秒）
    pub duration_ms: Option<i64>,
    pub status: StepStatus,
    /// 附加信息
    pub message: Option<String>,
}

impl StepRecord {
    pub fn new(number: usize, line: usize, instruction: impl Into<String>) -> Self {
        Self {
            number,
            line,
            instruction: instruction.into(),
            cache_key: None,
            started_at: None,
            finished_at: None,
            duration_ms: None,
            status: StepStatus::Pending,
            message: None,
        }
    }

    pub fn start(&mut self) {
        self.started_at = Some(Utc::now());
        self.status = StepStatus::Running;
    }

    /// 完成步骤
    pub fn finish(&mut self, status: StepStatus, message: Option<String>) {
        let now = Utc::now();
        self.finished_at = Some(now);
        self.status = status;
        self.message = message;
        if let Some(started) = self.started_at {
            self.duration_ms = Some((now - started).num_milliseconds());
        }
    }

    pub fn skip(&mut self, reason: Option<String>) {
        self.status = StepStatus::Skipped;
        self.message = reason;
    }

    /// One line for the build summary: `↺ [3/8] COPY requirements.txt . (0ms)`
    pub fn summary_line(&self, total: usize) -> String {
        let duration = self
            .duration_ms
            .map(|d| format!("{}ms", d))
            .unwrap_or_else(|| "-".to_string());
        format!(
            "{} [{}/{}] {} ({})",
            self.status.icon(),
            self.number,
            total,
            self.instruction,
            duration
        )
    }
}

/// 日志行
#[derive(Clone, Debug, Serialize)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub stream: String, // stdout | stderr
    pub content: String,
}

impl LogLine {
    pub fn new(stream: &str, content: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            stream: stream.to_string(),
            content: content.into(),
        }
    }

    pub fn stdout(content: impl Into<String>) -> Self {
        Self::new("stdout", content)
    }

    pub fn stderr(content: impl Into<String>) -> Self {
        Self::new("stderr", content)
    }

    pub fn is_stderr(&self) -> bool {
        self.stream == "stderr"
    }
}
