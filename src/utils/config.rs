//! 配置管理模块

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::{Result, SelectError};

/// 配置文件名
pub const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 连接实例 (名称 → 地址与凭据)
    #[serde(default)]
    pub instances: BTreeMap<String, InstanceConfig>,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub shell: ShellConfig,

    /// 输出格式 → 查看命令
    #[serde(default)]
    pub inline_viewers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub verify: VerifySetting,
}

/// 证书校验: 开关或 CA 文件路径
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VerifySetting {
    Enabled(bool),
    CaBundle(PathBuf),
}

impl Default for VerifySetting {
    fn default() -> Self {
        VerifySetting::Enabled(true)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// 缓存根目录; 未设置时为 `<配置目录>/cache`
    #[serde(default)]
    pub directory: Option<PathBuf>,

    #[serde(default = "default_subcache")]
    pub subcache: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            directory: None,
            subcache: default_subcache(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShellConfig {
    #[serde(default)]
    pub emacs_mode: bool,
}

// 默认值函数
fn default_true() -> bool {
    true
}
fn default_subcache() -> String {
    "default".to_string()
}

impl AppConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            SelectError::Configuration(format!("Failed to read config file: {}", e))
        })?;
        toml::from_str(&content)
            .map_err(|e| SelectError::Configuration(format!("Failed to parse config file: {}", e)))
    }

    /// 读取默认位置的配置文件; 不存在时使用默认配置
    pub fn load_default() -> Result<Self> {
        let path = Self::config_dir().join(CONFIG_FILE);
        if path.exists() {
            Self::load_from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    /// `$JIRA_SELECT_HOME` → `$XDG_CONFIG_HOME/jira-select` → `$HOME/.config/jira-select`
    pub fn config_dir() -> PathBuf {
        if let Some(home) = std::env::var_os("JIRA_SELECT_HOME") {
            return PathBuf::from(home);
        }
        if let Some(xdg) = std::env::var_os("XDG_CONFIG_HOME") {
            return PathBuf::from(xdg).join(crate::APP_NAME);
        }
        let home = std::env::var_os("HOME").map(PathBuf::from).unwrap_or_default();
        home.join(".config").join(crate::APP_NAME)
    }

    /// 指定实例; 缺少地址或用户名时报错
    pub fn instance(&self, name: &str) -> Result<&InstanceConfig> {
        let instance = self.instances.get(name).ok_or_else(|| {
            SelectError::Configuration(format!("Instance '{}' is not configured.", name))
        })?;
        if instance.url.as_deref().map_or(true, str::is_empty) {
            return Err(SelectError::Configuration(format!(
                "Instance '{}' has no url configured.",
                name
            )));
        }
        if instance.username.as_deref().map_or(true, str::is_empty) {
            return Err(SelectError::Configuration(format!(
                "Instance '{}' has no username configured.",
                name
            )));
        }
        Ok(instance)
    }

    pub fn cache_directory(&self) -> PathBuf {
        self.cache
            .directory
            .clone()
            .unwrap_or_else(|| Self::config_dir().join("cache"))
    }

    /// 创建并返回 `<缓存目录>/<subcache>`
    pub fn cache_path(&self, subcache: Option<&str>) -> Result<PathBuf> {
        let path = self
            .cache_directory()
            .join(subcache.unwrap_or(&self.cache.subcache));
        fs::create_dir_all(&path)?;
        Ok(path)
    }
}
