use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// 配置解析与校验错误。
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse buffer manager configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("`{field}` must be greater than zero")]
    Zero { field: &'static str },
    #[error("`max_types` must not exceed {limit}")]
    TooManyTypes { limit: usize },
}

/// `ManagerConfig` 汇总缓冲管理器的进程级常量。
///
/// # 设计初衷（Why）
/// - 注册表容量、持有者槽位数、附着边容量与等待节奏在嵌入式平台上按产品调整，
///   通过 TOML 的 `[buffer_manager]` 表注入，避免重新编译；
/// - 所有字段都有默认值，宿主只需覆盖关心的项。
///
/// # 契约说明（What）
/// - `max_types`：注册表可容纳的类型数（默认 256，上限受类型标签索引位宽约束）；
/// - `max_owner_identifiers`：每个缓冲记录的持有者标识槽位（默认 8）；
/// - `max_attached_buffers`：每个缓冲的附着边容量（默认 4）；
/// - `wait_slice_ms`：阻塞等待的单次唤醒间隔（默认 50 ms）；
/// - `long_wait_warning_ms`：等待超过该时长时周期性告警（默认 30 s）。
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ManagerConfig {
    pub max_types: usize,
    pub max_owner_identifiers: usize,
    pub max_attached_buffers: usize,
    pub wait_slice_ms: u64,
    pub long_wait_warning_ms: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_types: 256,
            max_owner_identifiers: 8,
            max_attached_buffers: 4,
            wait_slice_ms: 50,
            long_wait_warning_ms: 30_000,
        }
    }
}

#[derive(Deserialize)]
struct ConfigFile {
    #[serde(default)]
    buffer_manager: ManagerConfig,
}

impl ManagerConfig {
    /// 从 TOML 文本的 `[buffer_manager]` 表解析并校验配置；缺省该表时使用默认值。
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(text)?;
        file.buffer_manager.validate()?;
        Ok(file.buffer_manager)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let fields = [
            ("max_types", self.max_types as u64),
            ("max_owner_identifiers", self.max_owner_identifiers as u64),
            ("max_attached_buffers", self.max_attached_buffers as u64),
            ("wait_slice_ms", self.wait_slice_ms),
            ("long_wait_warning_ms", self.long_wait_warning_ms),
        ];
        if let Some(&(field, _)) = fields.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Zero { field });
        }
        if self.max_types > crate::TypeTag::MAX_INDEX {
            return Err(ConfigError::TooManyTypes {
                limit: crate::TypeTag::MAX_INDEX,
            });
        }
        Ok(())
    }

    pub(crate) fn wait_slice(&self) -> Duration {
        Duration::from_millis(self.wait_slice_ms)
    }

    pub(crate) fn wait_policy(&self) -> WaitPolicy {
        WaitPolicy {
            slice: self.wait_slice(),
            long_wait_warning: Duration::from_millis(self.long_wait_warning_ms),
        }
    }
}

/// 阻塞等待的节奏：单次唤醒间隔与长等待告警间隔。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct WaitPolicy {
    pub(crate) slice: Duration,
    pub(crate) long_wait_warning: Duration,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        ManagerConfig::default().wait_policy()
    }
}
