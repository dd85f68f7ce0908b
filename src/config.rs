//! 流水线配置 - 通过JSON文件调整参数

use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::detection::{BackendKind, ColorParams, DetectionParams, PartitionParams};
use crate::error::PipelineError;
use crate::pipeline::workers::ImageServiceParams;

/// 输入缓冲区已满时的处理策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum Backpressure {
    /// 直接丢弃该帧 (该半边结果为 Dropped)
    #[default]
    Drop,
    /// 间隔 `interval_ms` 重试 `attempts` 次, 仍失败则丢弃
    Retry { attempts: u32, interval_ms: u64 },
}

/// 帧分发方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FanOut {
    /// 各阶段共享同一份像素 (Arc 引用计数)
    #[default]
    Shared,
    /// 每个阶段拿到独立拷贝
    Copy,
}

/// 流水线参数
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    // === 缓冲区 ===
    pub input_capacity: usize,          // 输入环形缓冲区槽位数 (可用 n-1)
    pub result_capacity: usize,         // 结果环形缓冲区槽位数
    pub service_result_capacity: usize, // 保存/模糊/遮罩 回执缓冲区槽位数

    // === 超时 ===
    pub result_timeout_ms: u64,  // 等待某个会话结果的上限
    pub publish_timeout_ms: u64, // 结果缓冲区满时阶段线程的最长等待

    pub backpressure: Backpressure,
    pub fan_out: FanOut,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            input_capacity: 8,
            result_capacity: 8,
            service_result_capacity: 16,

            result_timeout_ms: 5000,
            publish_timeout_ms: 100,

            backpressure: Backpressure::Drop,
            fan_out: FanOut::Shared,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), PipelineError> {
        for (name, value) in [
            ("input_capacity", self.input_capacity),
            ("result_capacity", self.result_capacity),
            ("service_result_capacity", self.service_result_capacity),
        ] {
            if value < 2 {
                return Err(PipelineError::Configuration(format!(
                    "{name} must be at least 2, got {value}"
                )));
            }
        }
        if self.result_timeout_ms == 0 {
            return Err(PipelineError::Configuration(
                "result_timeout_ms must be positive".into(),
            ));
        }
        if let Backpressure::Retry { attempts: 0, .. } = self.backpressure {
            return Err(PipelineError::Configuration(
                "retry backpressure needs at least one attempt".into(),
            ));
        }
        Ok(())
    }

    pub fn result_timeout(&self) -> Duration {
        Duration::from_millis(self.result_timeout_ms)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }
}

/// 目标检测阶段配置
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetectionSection {
    pub kind: BackendKind,
    #[serde(default)]
    pub params: DetectionParams,
    #[serde(default)]
    pub partition: PartitionParams,
}

/// 颜色检测阶段配置
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ColorSection {
    #[serde(default = "default_color_kind")]
    pub kind: BackendKind,
    pub params: ColorParams,
    #[serde(default)]
    pub partition: PartitionParams,
    #[serde(default)]
    pub min_height: i32,
    #[serde(default)]
    pub min_width: i32,
}

fn default_color_kind() -> BackendKind {
    BackendKind::ColorInRange
}

/// 完整配置文件
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetraConfig {
    pub pipeline: PipelineConfig,
    pub detection: Option<DetectionSection>,
    pub color: Option<ColorSection>,
    pub image_service: Option<ImageServiceParams>,
}

impl NetraConfig {
    /// 从JSON文件加载配置; 文件不存在时写出默认配置, 读取或解析失败时使用默认值且不改动文件
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(json) => match serde_json::from_str(&json) {
                Ok(config) => {
                    info!(path = %path.display(), "配置已加载");
                    config
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "配置文件解析失败, 使用默认值");
                    Self::default()
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!(path = %path.display(), "配置文件不存在, 创建默认配置");
                let config = Self::default();
                if let Err(e) = config.save(path) {
                    warn!(error = %format!("{e:#}"), "保存默认配置失败");
                }
                config
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "配置文件读取失败, 使用默认值");
                Self::default()
            }
        }
    }

    /// 严格加载: 读取或解析失败都返回错误
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        serde_json::from_str(&json)
            .with_context(|| format!("failed to parse config {}", path.display()))
    }

    /// 保存配置到JSON文件
    pub fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self).context("failed to serialize config")?;
        fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))?;
        info!(path = %path.display(), "配置已保存");
        Ok(())
    }
}
